//! Tokio Event Loop
//!
//! [`TokioEventLoop`] implements the core's [`EventLoop`] on a current-thread
//! runtime inside a `LocalSet`. Every source (signals, descriptors, the boot
//! server) runs as a local task that only forwards events into a channel;
//! [`run`] dispatches them to the [`Daemon`] one at a time.
//!
//! ```text
//!   signal tasks ──┐
//!   fd tasks     ──┼──► events channel ──┐
//!                  │                     ├──► run() ──► Daemon::dispatch
//!   BootServer   ──┴──► requests channel ┘        ▲
//!                                                 │
//!                             deferred queue ─────┘ (drained first)
//! ```
//!
//! # Descriptor Watches
//!
//! Each watch duplicates the descriptor it is given and registers the
//! duplicate with the reactor. The caller's descriptor is never closed by the
//! loop, and two watches on one device (keyboard input and terminal hangup)
//! never collide in epoll.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::io::RawFd;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::Signal;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use splash_core::{Daemon, EventLoop, FdInterest, LoopEvent, WatchId};

use crate::protocol::Envelope;

const READ_CHUNK: usize = 4096;

/// [`EventLoop`] backed by tokio local tasks
pub struct TokioEventLoop {
    events: mpsc::UnboundedSender<LoopEvent>,
    deferred: VecDeque<LoopEvent>,
    signals: HashMap<Signal, JoinHandle<()>>,
    watches: HashMap<WatchId, JoinHandle<()>>,
    next_watch: u64,
    exit_code: Option<i32>,
}

impl TokioEventLoop {
    /// Create a loop whose sources feed `events`
    ///
    /// Must be used from within a `LocalSet`.
    #[must_use]
    pub fn new(events: mpsc::UnboundedSender<LoopEvent>) -> Self {
        Self {
            events,
            deferred: VecDeque::new(),
            signals: HashMap::new(),
            watches: HashMap::new(),
            next_watch: 1,
            exit_code: None,
        }
    }

    /// Exit code requested by the daemon, if any
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Number of live descriptor watches
    #[must_use]
    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }

    /// Whether `signal` is being delivered
    #[must_use]
    pub fn is_watching_signal(&self, signal: Signal) -> bool {
        self.signals.contains_key(&signal)
    }

    fn next_deferred(&mut self) -> Option<LoopEvent> {
        self.deferred.pop_front()
    }

    /// Forget watches whose task has already finished
    fn note_delivered(&mut self, event: &LoopEvent) {
        if let LoopEvent::Hangup(watch) = event {
            self.watches.remove(watch);
        }
    }
}

impl Drop for TokioEventLoop {
    fn drop(&mut self) {
        for (_, task) in self.signals.drain() {
            task.abort();
        }
        for (_, task) in self.watches.drain() {
            task.abort();
        }
    }
}

impl EventLoop for TokioEventLoop {
    fn watch_signal(&mut self, sig: Signal) {
        if self.signals.contains_key(&sig) {
            return;
        }
        // registered before returning so the kernel never sees the default action
        let mut stream = match signal(SignalKind::from_raw(sig as i32)) {
            Ok(stream) => stream,
            Err(error) => {
                warn!(signal = ?sig, %error, "could not watch signal");
                return;
            }
        };
        let events = self.events.clone();
        let task = tokio::task::spawn_local(async move {
            while stream.recv().await.is_some() {
                if events.send(LoopEvent::Signal(sig)).is_err() {
                    break;
                }
            }
        });
        trace!(signal = ?sig, "watching signal");
        self.signals.insert(sig, task);
    }

    fn stop_watching_signal(&mut self, sig: Signal) {
        if let Some(task) = self.signals.remove(&sig) {
            trace!(signal = ?sig, "stopped watching signal");
            task.abort();
        }
    }

    fn watch_fd(&mut self, fd: RawFd, interest: FdInterest) -> WatchId {
        let watch = WatchId(self.next_watch);
        self.next_watch += 1;

        let registered = duplicate(fd).and_then(|file| {
            AsyncFd::try_with_interest(file, Interest::READABLE).map_err(io::Error::from)
        });
        let afd = match registered {
            Ok(afd) => afd,
            Err(error) => {
                warn!(fd, %watch, %error, "could not watch descriptor");
                return watch;
            }
        };

        let events = self.events.clone();
        let task = match interest {
            FdInterest::Input => tokio::task::spawn_local(forward_input(afd, watch, events)),
            FdInterest::Hangup => tokio::task::spawn_local(forward_hangup(afd, watch, events)),
        };
        debug!(fd, %watch, ?interest, "watching descriptor");
        self.watches.insert(watch, task);
        watch
    }

    fn stop_watching_fd(&mut self, watch: WatchId) {
        if let Some(task) = self.watches.remove(&watch) {
            trace!(%watch, "stopped watching descriptor");
            task.abort();
        }
    }

    fn defer(&mut self, event: LoopEvent) {
        self.deferred.push_back(event);
    }

    fn exit(&mut self, code: i32) {
        debug!(code, "loop exit requested");
        self.exit_code = Some(code);
    }
}

// =============================================================================
// Descriptor Tasks
// =============================================================================

fn duplicate(fd: RawFd) -> io::Result<File> {
    // SAFETY: the caller keeps `fd` open for the duration of this call; the
    // clone is an independent descriptor owned by the returned File.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    borrowed.try_clone_to_owned().map(File::from)
}

/// Poll flags currently raised on `file`, without blocking
fn pending(file: &File) -> PollFlags {
    let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
    match poll(&mut fds, PollTimeout::ZERO) {
        Ok(n) if n > 0 => fds[0].revents().unwrap_or_else(PollFlags::empty),
        _ => PollFlags::empty(),
    }
}

async fn forward_input(
    afd: AsyncFd<File>,
    watch: WatchId,
    events: mpsc::UnboundedSender<LoopEvent>,
) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let mut guard = match afd.readable().await {
            Ok(guard) => guard,
            Err(error) => {
                warn!(%watch, %error, "descriptor watch failed");
                break;
            }
        };

        // readiness can be stale; never block the loop on a read
        if pending(afd.get_ref()).is_empty() {
            guard.clear_ready();
            continue;
        }

        let mut reader: &File = afd.get_ref();
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let event = LoopEvent::Input {
                    watch,
                    bytes: buf[..n].to_vec(),
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                guard.clear_ready();
            }
            Err(error) => {
                // ttys report a hangup as EIO
                trace!(%watch, %error, "read failed, treating as hangup");
                break;
            }
        }
    }
    let _ = events.send(LoopEvent::Hangup(watch));
}

async fn forward_hangup(
    afd: AsyncFd<File>,
    watch: WatchId,
    events: mpsc::UnboundedSender<LoopEvent>,
) {
    loop {
        let mut guard = match afd.readable().await {
            Ok(guard) => guard,
            Err(error) => {
                warn!(%watch, %error, "descriptor watch failed");
                break;
            }
        };
        if guard.ready().is_read_closed()
            || pending(afd.get_ref()).intersects(PollFlags::POLLHUP | PollFlags::POLLERR)
        {
            break;
        }
        // input belongs to another watch; wait for the next edge
        guard.clear_ready();
    }
    let _ = events.send(LoopEvent::Hangup(watch));
}

// =============================================================================
// Dispatch
// =============================================================================

/// Dispatch events to `daemon` until it asks the loop to exit
///
/// Deferred events run before anything new is taken from the channels.
/// Requests that complete during dispatch are acknowledged right after it.
pub async fn run(
    daemon: &mut Daemon,
    event_loop: &mut TokioEventLoop,
    events: &mut mpsc::UnboundedReceiver<LoopEvent>,
    requests: &mut mpsc::UnboundedReceiver<Envelope>,
) -> i32 {
    loop {
        while event_loop.exit_code.is_none() {
            let Some(event) = event_loop.next_deferred() else {
                break;
            };
            daemon.dispatch(event, event_loop);
        }
        if let Some(code) = event_loop.exit_code {
            return code;
        }

        tokio::select! {
            Some(event) = events.recv() => {
                event_loop.note_delivered(&event);
                daemon.dispatch(event, event_loop);
            }
            Some(envelope) = requests.recv() => {
                debug!(request = envelope.request.name(), "dispatching client request");
                daemon.dispatch(LoopEvent::Request(envelope.request), event_loop);
                Envelope::acknowledge(envelope.ack);
            }
            else => {
                debug!("all event sources closed");
                return event_loop.exit_code.unwrap_or(0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tokio::sync::oneshot;
    use tokio::task::LocalSet;
    use tokio::time::timeout;

    use splash_core::test_utils::{FakeConsole, FakePlatform};
    use splash_core::{BootRequest, DaemonOptions, Mode, Trigger};

    use crate::protocol::Reply;

    const WAIT: Duration = Duration::from_secs(2);

    fn daemon() -> Daemon {
        let dir = tempfile::tempdir().unwrap();
        let mut options = DaemonOptions::new(Mode::Boot).with_theme_dir(dir.path());
        options.cache_dir = dir.path().to_path_buf();
        options.boot_log = None;
        Daemon::new(options, FakePlatform::new(FakeConsole::vt(1)).boxed())
    }

    #[tokio::test]
    async fn test_input_watch_forwards_bytes() {
        LocalSet::new()
            .run_until(async {
                let (tx, mut rx) = mpsc::unbounded_channel();
                let mut event_loop = TokioEventLoop::new(tx);
                let (ours, mut theirs) = UnixStream::pair().unwrap();

                let watch = event_loop.watch_fd(ours.as_raw_fd(), FdInterest::Input);
                theirs.write_all(b"y\r").unwrap();

                let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
                match event {
                    LoopEvent::Input { watch: got, bytes } => {
                        assert_eq!(got, watch);
                        assert_eq!(bytes, b"y\r".to_vec());
                    }
                    other => panic!("unexpected event {other:?}"),
                }
            })
            .await;
    }

    #[tokio::test]
    async fn test_hangup_watch_ignores_input_and_reports_close() {
        LocalSet::new()
            .run_until(async {
                let (tx, mut rx) = mpsc::unbounded_channel();
                let mut event_loop = TokioEventLoop::new(tx);
                let (ours, mut theirs) = UnixStream::pair().unwrap();

                let watch = event_loop.watch_fd(ours.as_raw_fd(), FdInterest::Hangup);
                theirs.write_all(b"ignored").unwrap();
                drop(theirs);

                let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
                assert!(matches!(event, LoopEvent::Hangup(got) if got == watch));
            })
            .await;
    }

    #[tokio::test]
    async fn test_stopped_watch_stays_quiet() {
        LocalSet::new()
            .run_until(async {
                let (tx, mut rx) = mpsc::unbounded_channel();
                let mut event_loop = TokioEventLoop::new(tx);
                let (ours, mut theirs) = UnixStream::pair().unwrap();

                let watch = event_loop.watch_fd(ours.as_raw_fd(), FdInterest::Input);
                event_loop.stop_watching_fd(watch);
                assert_eq!(event_loop.watch_count(), 0);
                tokio::task::yield_now().await;
                theirs.write_all(b"x").unwrap();

                assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
            })
            .await;
    }

    #[tokio::test]
    async fn test_watch_outlives_callers_descriptor() {
        LocalSet::new()
            .run_until(async {
                let (tx, mut rx) = mpsc::unbounded_channel();
                let mut event_loop = TokioEventLoop::new(tx);
                let (ours, mut theirs) = UnixStream::pair().unwrap();

                let watch = event_loop.watch_fd(ours.as_raw_fd(), FdInterest::Input);
                drop(ours);
                theirs.write_all(b"z").unwrap();

                let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
                assert!(matches!(event, LoopEvent::Input { watch: got, .. } if got == watch));
            })
            .await;
    }

    #[tokio::test]
    async fn test_run_acks_requests_and_stops_on_quit() {
        LocalSet::new()
            .run_until(async {
                let (events_tx, mut events_rx) = mpsc::unbounded_channel();
                let (requests_tx, mut requests_rx) = mpsc::unbounded_channel();
                let mut event_loop = TokioEventLoop::new(events_tx);
                let mut daemon = daemon();

                let (ack_tx, ack_rx) = oneshot::channel();
                requests_tx
                    .send(Envelope {
                        request: BootRequest::Update {
                            status: "fsck".to_string(),
                        },
                        ack: Some(ack_tx),
                    })
                    .unwrap();

                let (quit_tx, quit_rx) = oneshot::channel();
                requests_tx
                    .send(Envelope::unacknowledged(BootRequest::Quit {
                        retain_splash: false,
                        done: Trigger::with_handler(move |_| {
                            let _ = quit_tx.send(Reply::Ack);
                        }),
                    }))
                    .unwrap();

                let code = timeout(
                    WAIT,
                    run(&mut daemon, &mut event_loop, &mut events_rx, &mut requests_rx),
                )
                .await
                .unwrap();

                assert_eq!(code, 0);
                assert_eq!(ack_rx.await.unwrap(), Reply::Ack);
                assert_eq!(quit_rx.await.unwrap(), Reply::Ack);
                assert_eq!(daemon.progress().status(), Some("fsck"));
            })
            .await;
    }

    #[tokio::test]
    async fn test_deferred_events_run_before_new_ones() {
        LocalSet::new()
            .run_until(async {
                let (events_tx, mut events_rx) = mpsc::unbounded_channel();
                let (_requests_tx, mut requests_rx) = mpsc::unbounded_channel();
                let mut event_loop = TokioEventLoop::new(events_tx);
                let mut daemon = daemon();

                event_loop.defer(LoopEvent::Request(BootRequest::Quit {
                    retain_splash: false,
                    done: Trigger::new(),
                }));

                let code = timeout(
                    WAIT,
                    run(&mut daemon, &mut event_loop, &mut events_rx, &mut requests_rx),
                )
                .await
                .unwrap();
                assert_eq!(code, 0);
                assert_eq!(event_loop.exit_code(), Some(0));
            })
            .await;
    }
}
