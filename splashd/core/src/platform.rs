//! Collaborator Interfaces
//!
//! The daemon drives, but does not implement, splash rendering, the pixel
//! renderer, console log capture, or the root switch. Each is reached
//! through one of the traits below; the [`Platform`] factory builds them.
//!
//! ```text
//!                 ┌──────────────┐
//!                 │    Daemon    │
//!                 └──────┬───────┘
//!        ┌───────────┬───┴────────┬─────────────┐
//!        ▼           ▼            ▼             ▼
//!   ┌─────────┐ ┌──────────┐ ┌────────────┐ ┌──────────┐
//!   │ Splash  │ │ Renderer │ │ LogSession │ │ Terminal │
//!   └─────────┘ └──────────┘ └────────────┘ └──────────┘
//!        ▲           ▲            ▲             ▲
//!        └───────────┴─────┬──────┴─────────────┘
//!                    ┌─────┴────┐
//!                    │ Platform │
//!                    └──────────┘
//! ```

use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use crate::daemon::Mode;
use crate::error::{SessionError, SplashError, SwitchRootError};
use crate::event_loop::EventLoop;
use crate::terminal::Terminal;

// =============================================================================
// Displays
// =============================================================================

/// One output of the pixel renderer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RendererHead {
    /// Renderer-assigned index
    pub index: u32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

/// A pixel surface on one renderer head
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelDisplay {
    /// Head the display draws on
    pub head: RendererHead,
}

/// A text console the splash may write to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextDisplay {
    /// Console device path
    pub tty: PathBuf,
}

impl TextDisplay {
    /// Text display for a terminal's device
    #[must_use]
    pub fn for_terminal(terminal: &Terminal) -> Self {
        Self {
            tty: terminal.name().to_path_buf(),
        }
    }
}

// =============================================================================
// Traits
// =============================================================================

/// A loaded splash theme
pub trait Splash {
    /// Theme file the splash was loaded from
    fn theme(&self) -> &Path;

    /// Draw on a pixel display
    fn add_pixel_display(&mut self, display: &PixelDisplay);

    /// Draw on a text console
    fn add_text_display(&mut self, display: &TextDisplay);

    /// Start rendering
    ///
    /// # Errors
    ///
    /// Returns [`SplashError::Show`] if the splash cannot start.
    fn show(&mut self, mode: Mode) -> Result<(), SplashError>;

    /// Stop rendering and give the displays back
    fn hide(&mut self);

    /// A client reported a boot status
    fn update_status(&mut self, status: &str);

    /// Console output captured during boot
    fn update_output(&mut self, output: &[u8]);

    /// Show a one-off message
    fn display_message(&mut self, message: &str);

    /// Return to the normal (prompt free) view
    fn display_normal(&mut self);

    /// Show a password prompt with `bullets` characters typed
    fn display_password(&mut self, prompt: &str, bullets: usize);

    /// Show a question prompt with the text typed so far
    fn display_question(&mut self, prompt: &str, entry_text: &str);

    /// The real root filesystem is now mounted
    fn root_mounted(&mut self);

    /// Finish the current animation, then defer [`crate::LoopEvent::SplashIdle`]
    fn become_idle(&mut self, event_loop: &mut dyn EventLoop);
}

/// The pixel renderer (framebuffer, DRM, ...)
pub trait Renderer {
    /// Outputs available for pixel displays
    fn heads(&self) -> Vec<RendererHead>;

    /// Resume drawing
    fn activate(&mut self);

    /// Stop drawing and leave the hardware alone
    fn deactivate(&mut self);

    /// Release the hardware
    fn close(&mut self);

    /// Descriptor keystrokes are read from, if the renderer owns one
    fn input_fd(&self) -> Option<RawFd>;
}

/// Capture of console output into the boot log
pub trait LogSession {
    /// Start capturing console output
    ///
    /// With `redirect` the kernel console is redirected into the session.
    /// Returns the descriptor the captured output is read from.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Attach`] if the console cannot be captured.
    fn attach(&mut self, redirect: bool) -> Result<Option<RawFd>, SessionError>;

    /// Stop capturing and give the console back
    fn detach(&mut self);

    /// Start appending captured output to `path`
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Log`] if the log cannot be opened.
    fn open_log(&mut self, path: &Path) -> Result<(), SessionError>;

    /// Stop writing the log
    fn close_log(&mut self);

    /// Record bytes read from the capture descriptor
    fn log_output(&mut self, output: &[u8]);
}

/// Factory for the daemon's collaborators
pub trait Platform {
    /// Create an unopened terminal for `tty`
    fn new_terminal(&mut self, tty: &str) -> Terminal;

    /// Open a pixel renderer on top of an open terminal
    ///
    /// `None` means no renderer is available and text displays are used.
    fn open_renderer(&mut self, terminal: &Terminal) -> Option<Box<dyn Renderer>>;

    /// Load the splash theme at `theme`
    ///
    /// `boot_output` is the console output captured so far.
    ///
    /// # Errors
    ///
    /// Returns [`SplashError::Load`] if the theme is missing or invalid.
    fn load_splash(
        &mut self,
        theme: &Path,
        boot_output: &[u8],
    ) -> Result<Box<dyn Splash>, SplashError>;

    /// Create a detached logging session
    fn new_session(&mut self) -> Box<dyn LogSession>;

    /// Make `path` the root directory of the daemon
    ///
    /// # Errors
    ///
    /// Returns [`SwitchRootError`] if the change fails.
    fn switch_root(&mut self, path: &Path) -> Result<(), SwitchRootError>;
}
