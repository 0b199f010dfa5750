//! Boot Socket Server
//!
//! Accepts boot clients on a Unix socket and hands their requests to the
//! event loop. Connections are served by local tasks: each one decodes a
//! [`ClientRequest`], routes it, waits for the [`Reply`], and writes it back.
//!
//! ```text
//!   client ──frame──► connection task ──Envelope──► run() ──► Daemon
//!   client ◄──frame── connection task ◄──oneshot─── Trigger / ack
//! ```
//!
//! Only root (or the daemon's own user) may connect; the socket is created
//! owner-only and peers are checked with `SO_PEERCRED`.

use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::frame::{encode, FrameDecoder};
use crate::protocol::{ClientRequest, Envelope, Reply};

/// Configuration for the boot server
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Maximum number of concurrent client connections
    pub max_connections: usize,
    /// How long to wait for replies to drain at shutdown
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 64,
            drain_timeout: Duration::from_secs(1),
        }
    }
}

/// Listener for boot clients
pub struct BootServer {
    socket_path: PathBuf,
    listener: UnixListener,
    config: ServerConfig,
}

impl BootServer {
    /// Bind the boot socket at `socket_path`
    ///
    /// Creates the parent directory, removes a stale socket, and restricts the
    /// new socket to its owner.
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot be created or its permissions set.
    pub fn bind(socket_path: &Path, config: ServerConfig) -> Result<Self> {
        prepare_socket(socket_path)?;

        let listener = UnixListener::bind(socket_path)
            .with_context(|| format!("failed to bind to {}", socket_path.display()))?;

        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(socket_path, perms)
                .with_context(|| format!("failed to set permissions on {}", socket_path.display()))?;
        }

        info!(path = %socket_path.display(), "listening for boot clients");
        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            listener,
            config,
        })
    }

    /// Socket the server listens on
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept clients until `shutdown` fires, then let pending replies drain
    ///
    /// Must run inside a `LocalSet`.
    pub async fn run(
        self,
        requests: mpsc::UnboundedSender<Envelope>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut connections = JoinSet::new();
        let active = Rc::new(Cell::new(0usize));
        let our_uid = nix::unistd::geteuid().as_raw();
        let mut next_id = 1u64;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("boot server shutting down");
                    break;
                }
                accepted = self.listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _)) => stream,
                        Err(error) => {
                            warn!(%error, "accept failed");
                            continue;
                        }
                    };

                    let peer_uid = get_peer_uid(&stream);
                    if !peer_allowed(peer_uid, our_uid) {
                        warn!(?peer_uid, "rejecting client from unprivileged user");
                        continue;
                    }
                    if active.get() >= self.config.max_connections {
                        warn!(max = self.config.max_connections, "too many boot clients");
                        continue;
                    }

                    let conn_id = next_id;
                    next_id += 1;
                    active.set(active.get() + 1);
                    let active = Rc::clone(&active);
                    let requests = requests.clone();
                    connections.spawn_local(
                        async move {
                            handle_connection(stream, requests).await;
                            active.set(active.get() - 1);
                        }
                        .instrument(info_span!("client", id = conn_id, ?peer_uid)),
                    );
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(requests);
        let drained = tokio::time::timeout(self.config.drain_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = connections.len(), "dropping clients still waiting");
        }
    }
}

impl Drop for BootServer {
    fn drop(&mut self) {
        if let Err(error) = fs::remove_file(&self.socket_path) {
            if error.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.socket_path.display(), %error, "could not remove socket");
            }
        }
    }
}

/// Create the socket directory and clear out a stale socket
fn prepare_socket(socket_path: &Path) -> Result<()> {
    if let Some(parent) = socket_path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create socket directory {}", parent.display()))?;
            info!(path = %parent.display(), "created socket directory");
        }
    }

    if socket_path.exists() {
        warn!(path = %socket_path.display(), "removing stale socket file");
        fs::remove_file(socket_path)
            .with_context(|| format!("failed to remove stale socket {}", socket_path.display()))?;
    }

    Ok(())
}

/// Get the peer's UID via `SO_PEERCRED`
fn get_peer_uid(stream: &UnixStream) -> Option<u32> {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();
    // SAFETY: ucred is plain data and zero is a valid bit pattern
    let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = libc::socklen_t::try_from(std::mem::size_of::<libc::ucred>()).ok()?;

    // SAFETY: fd is a live socket and cred/len describe a valid buffer
    let result = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            std::ptr::addr_of_mut!(cred).cast::<libc::c_void>(),
            &mut len,
        )
    };

    (result == 0).then_some(cred.uid)
}

fn peer_allowed(peer_uid: Option<u32>, our_uid: u32) -> bool {
    matches!(peer_uid, Some(uid) if uid == 0 || uid == our_uid)
}

/// Serve one client until it disconnects
async fn handle_connection(mut stream: UnixStream, requests: mpsc::UnboundedSender<Envelope>) {
    debug!("client connected");
    let mut decoder = FrameDecoder::new();
    let mut read_buf = vec![0u8; 4096];

    'connection: loop {
        let n = match stream.read(&mut read_buf).await {
            Ok(0) => {
                debug!("client disconnected");
                break;
            }
            Ok(n) => n,
            Err(error) => {
                warn!(%error, "read failed");
                break;
            }
        };
        decoder.push(&read_buf[..n]);

        loop {
            let request: ClientRequest = match decoder.decode() {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(error) => {
                    warn!(%error, "dropping client after bad frame");
                    break 'connection;
                }
            };

            let name = request.name();
            debug!(request = name, "received request");
            let Some(reply) = route(request, &requests).await else {
                debug!(request = name, "daemon went away before replying");
                break 'connection;
            };

            let bytes = match encode(&reply) {
                Ok(bytes) => bytes,
                Err(error) => {
                    warn!(%error, "could not encode reply");
                    break 'connection;
                }
            };
            if let Err(error) = stream.write_all(&bytes).await {
                debug!(%error, "client went away before reply");
                break 'connection;
            }
        }
    }
}

/// Hand `request` to the loop and wait for its reply
async fn route(request: ClientRequest, requests: &mpsc::UnboundedSender<Envelope>) -> Option<Reply> {
    let (reply_tx, reply_rx) = oneshot::channel();
    if let Some(envelope) = request.into_envelope(reply_tx) {
        requests.send(envelope).ok()?;
    }
    reply_rx.await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use splash_core::BootRequest;
    use tempfile::TempDir;
    use tokio::task::LocalSet;

    async fn exchange(stream: &mut UnixStream, request: &ClientRequest) -> Reply {
        stream.write_all(&encode(request).unwrap()).await.unwrap();
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 1024];
        loop {
            if let Some(reply) = decoder.decode::<Reply>().unwrap() {
                return reply;
            }
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "server closed the connection");
            decoder.push(&buf[..n]);
        }
    }

    #[test]
    fn test_prepare_socket_creates_dir_and_clears_stale_file() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("run").join("boot.sock");

        prepare_socket(&socket).unwrap();
        assert!(socket.parent().unwrap().is_dir());

        fs::write(&socket, b"stale").unwrap();
        prepare_socket(&socket).unwrap();
        assert!(!socket.exists());
    }

    #[test]
    fn test_peer_check() {
        assert!(peer_allowed(Some(0), 1000));
        assert!(peer_allowed(Some(1000), 1000));
        assert!(!peer_allowed(Some(1001), 1000));
        assert!(!peer_allowed(None, 0));
    }

    #[tokio::test]
    async fn test_socket_is_owner_only_and_removed_on_drop() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("boot.sock");
        let server = BootServer::bind(&socket, ServerConfig::default()).unwrap();

        let mode = fs::metadata(&socket).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        drop(server);
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn test_requests_round_trip_through_loop() {
        LocalSet::new()
            .run_until(async {
                let dir = TempDir::new().unwrap();
                let socket = dir.path().join("boot.sock");
                let server = BootServer::bind(&socket, ServerConfig::default()).unwrap();
                let (requests_tx, mut requests_rx) = mpsc::unbounded_channel();
                let (shutdown_tx, shutdown_rx) = oneshot::channel();
                let server_task = tokio::task::spawn_local(server.run(requests_tx, shutdown_rx));

                // stands in for the daemon: acks updates, answers prompts
                let fake_loop = tokio::task::spawn_local(async move {
                    let mut seen = Vec::new();
                    while let Some(envelope) = requests_rx.recv().await {
                        seen.push(envelope.request.name());
                        match envelope.request {
                            BootRequest::AskForPassword { answer, .. } => {
                                answer.pull(Some(&splash_core::Answer::Text("secret".into())));
                            }
                            BootRequest::HasActiveVt { reply } => reply.pull(Some(&false)),
                            _ => {}
                        }
                        Envelope::acknowledge(envelope.ack);
                    }
                    seen
                });

                let mut client = UnixStream::connect(&socket).await.unwrap();
                assert_eq!(exchange(&mut client, &ClientRequest::Ping).await, Reply::Ack);
                assert_eq!(
                    exchange(
                        &mut client,
                        &ClientRequest::Update {
                            status: "udev".to_string()
                        }
                    )
                    .await,
                    Reply::Ack
                );
                assert_eq!(
                    exchange(
                        &mut client,
                        &ClientRequest::AskForPassword {
                            prompt: "Disk".to_string()
                        }
                    )
                    .await,
                    Reply::Answer {
                        text: "secret".to_string()
                    }
                );
                assert_eq!(
                    exchange(&mut client, &ClientRequest::HasActiveVt).await,
                    Reply::Bool { value: false }
                );
                drop(client);

                shutdown_tx.send(()).unwrap();
                server_task.await.unwrap();
                let seen = fake_loop.await.unwrap();
                assert_eq!(seen, vec!["update", "ask-for-password", "has-active-vt"]);
            })
            .await;
    }

    #[tokio::test]
    async fn test_garbage_closes_connection() {
        LocalSet::new()
            .run_until(async {
                let dir = TempDir::new().unwrap();
                let socket = dir.path().join("boot.sock");
                let server = BootServer::bind(&socket, ServerConfig::default()).unwrap();
                let (requests_tx, _requests_rx) = mpsc::unbounded_channel();
                let (shutdown_tx, shutdown_rx) = oneshot::channel();
                let server_task = tokio::task::spawn_local(server.run(requests_tx, shutdown_rx));

                let mut client = UnixStream::connect(&socket).await.unwrap();
                client
                    .write_all(&[0, 0, 0, 4, 0xde, 0xad, 0xbe, 0xef, b'j', b'u', b'n', b'k'])
                    .await
                    .unwrap();
                let mut buf = [0u8; 16];
                assert_eq!(client.read(&mut buf).await.unwrap(), 0);

                shutdown_tx.send(()).unwrap();
                server_task.await.unwrap();
            })
            .await;
    }
}
