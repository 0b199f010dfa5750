//! Splash Core - Console Ownership and Boot Splash State Machine
//!
//! This crate holds everything the boot splash daemon decides, with none of
//! the I/O it performs. It owns the text console (line discipline, color map,
//! the kernel VT switch handshake) and the lifecycle of the splash screen
//! from the first `show-splash` to the final `quit`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         splashd binary                           │
//! │  ┌────────────┐  ┌────────────────┐  ┌────────────┐  ┌────────┐  │
//! │  │ BootServer │  │ TokioEventLoop │  │ TextSplash │  │ Session│  │
//! │  └─────┬──────┘  └───────┬────────┘  └─────┬──────┘  └───┬────┘  │
//! │        │ BootRequest     │ LoopEvent       │ Platform    │       │
//! └────────┼─────────────────┼─────────────────┼─────────────┼───────┘
//!          └─────────────────┴────────┬────────┴─────────────┘
//! ┌───────────────────────────────────┼──────────────────────────────┐
//! │                            SPLASH CORE                           │
//! │  ┌────────────────────────────────┴───────────────────────────┐  │
//! │  │                          Daemon                            │  │
//! │  │  ┌──────────┐  ┌──────────┐  ┌────────────┐  ┌──────────┐  │  │
//! │  │  │ Terminal │  │ Keyboard │  │ EntryQueue │  │ Progress │  │  │
//! │  │  └──────────┘  └──────────┘  └────────────┘  └──────────┘  │  │
//! │  └────────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Daemon`]: the lifecycle state machine driven by [`LoopEvent`]s
//! - [`Terminal`]: one console device and its VT handshake
//! - [`Trigger`]: a one-shot completion notifier carried by requests
//! - [`BootRequest`]: what boot clients can ask for
//! - [`EventLoop`]: the single-threaded loop the core registers with
//!
//! # Module Overview
//!
//! - [`daemon`]: request handling, splash selection, teardown ordering
//! - [`terminal`]: console device access and VT switching
//! - [`keyboard`]: key decoding and input watches
//! - [`entry`]: password/question prompts and keystroke watches
//! - [`policy`]: kernel command line decisions
//! - [`progress`]: elapsed boot time and the duration cache
//! - [`platform`]: traits for the splash, renderer and log session
//! - [`event_loop`]: the loop contract
//! - [`trigger`]: completion notifiers
//! - [`test_utils`]: in-memory doubles for the traits above
//!
//! # Single Threaded
//!
//! Nothing here is `Send`. The daemon runs on one thread and every signal is
//! delivered as an ordinary event, so no handler ever runs concurrently with
//! another.

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod daemon;
pub mod entry;
pub mod error;
pub mod event_loop;
pub mod keyboard;
pub mod platform;
pub mod policy;
pub mod progress;
pub mod terminal;
pub mod test_utils;
pub mod trigger;

// Re-exports for convenience
pub use daemon::{BootRequest, Daemon, DaemonOptions, Mode, BOOT_TTY, SHUTDOWN_TTY};
pub use entry::{Answer, EntryKind, EntryQueue, KeystrokeWatches};
pub use error::{SessionError, SplashError, SwitchRootError, TerminalError};
pub use event_loop::{EventLoop, FdInterest, LoopEvent, WatchId};
pub use keyboard::{KeyEvent, Keyboard, KeyboardSource};
pub use platform::{
    LogSession, PixelDisplay, Platform, Renderer, RendererHead, Splash, TextDisplay,
};
pub use policy::KernelCommandLine;
pub use progress::Progress;
pub use terminal::{
    ColorPalette, ConsoleMode, LinuxTtyOpener, Terminal, TerminalColor, TtyDevice, TtyOpener,
    VtChange, VtChangeListener, ACQUIRE_SIGNAL, RELEASE_SIGNAL,
};
pub use trigger::Trigger;
