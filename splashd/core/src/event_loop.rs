//! Event Loop Contract
//!
//! The core never polls, sleeps, or installs signal handlers itself. It asks
//! an [`EventLoop`] to watch descriptors and signals, and the loop hands back
//! [`LoopEvent`]s that the owner dispatches one at a time on a single thread.
//! Signal delivery is therefore always serialized with every other event;
//! the kernel VT handshake runs as ordinary event handling.
//!
//! The daemon binary implements this trait on a tokio current-thread runtime;
//! tests use [`crate::test_utils::RecordingLoop`].

use std::os::unix::io::RawFd;

use nix::sys::signal::Signal;

use crate::daemon::BootRequest;

/// Identifies a descriptor watch registered with the loop
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(pub u64);

impl std::fmt::Display for WatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "watch-{}", self.0)
    }
}

/// What a descriptor watch reports
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FdInterest {
    /// Report readable bytes as [`LoopEvent::Input`] (and hangups)
    Input,
    /// Report only disconnects as [`LoopEvent::Hangup`]
    Hangup,
}

/// An event delivered by the loop
#[derive(Debug)]
pub enum LoopEvent {
    /// A watched signal arrived
    Signal(Signal),
    /// Bytes were read from an [`FdInterest::Input`] watch
    Input {
        /// Watch that produced the bytes
        watch: WatchId,
        /// Bytes read
        bytes: Vec<u8>,
    },
    /// The descriptor behind a watch hung up; the watch is gone
    Hangup(WatchId),
    /// The splash reached an idle point after being asked to
    SplashIdle,
    /// A request from a boot client
    Request(BootRequest),
}

/// Single-threaded event source the core registers interest with
pub trait EventLoop {
    /// Deliver `signal` as [`LoopEvent::Signal`] until told to stop
    fn watch_signal(&mut self, signal: Signal);

    /// Stop delivering `signal`
    fn stop_watching_signal(&mut self, signal: Signal);

    /// Watch a descriptor; the loop must not close it
    fn watch_fd(&mut self, fd: RawFd, interest: FdInterest) -> WatchId;

    /// Drop a descriptor watch; unknown ids are ignored
    fn stop_watching_fd(&mut self, watch: WatchId);

    /// Queue an event to be dispatched after the current one
    fn defer(&mut self, event: LoopEvent);

    /// Leave the loop once the current event has been handled
    fn exit(&mut self, code: i32);
}
