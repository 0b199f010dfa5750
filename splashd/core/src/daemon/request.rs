//! Requests and startup options handed to the [`super::Daemon`]

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::entry::Answer;
use crate::policy::KernelCommandLine;
use crate::trigger::Trigger;

/// Console used at boot when none is configured
pub const BOOT_TTY: &str = "tty1";

/// Console used at shutdown when none is configured
pub const SHUTDOWN_TTY: &str = "tty63";

/// Whether the system is coming up or going down
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// System is booting
    #[default]
    Boot,
    /// System is shutting down
    Shutdown,
}

impl Mode {
    /// Console used when neither the command line nor the configuration
    /// names one
    #[must_use]
    pub fn default_tty(self) -> &'static str {
        match self {
            Self::Boot => BOOT_TTY,
            Self::Shutdown => SHUTDOWN_TTY,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boot => write!(f, "boot"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shutdown" => Ok(Self::Shutdown),
            "boot" => Ok(Self::Boot),
            other => Err(format!("unknown mode '{other}' (expected boot or shutdown)")),
        }
    }
}

// =============================================================================
// Requests
// =============================================================================

/// A request from a boot client
///
/// Requests that complete later carry the [`Trigger`] the daemon pulls when
/// they are done; the boot server turns the pull into a reply.
#[derive(Debug)]
pub enum BootRequest {
    /// New boot status text
    Update {
        /// Status text
        status: String,
    },
    /// Ask the user for a password
    AskForPassword {
        /// Prompt to show
        prompt: String,
        /// Pulled with the answer, or with no payload if nobody can be asked
        answer: Trigger<Answer>,
    },
    /// Ask the user a question
    AskQuestion {
        /// Prompt to show
        prompt: String,
        /// Pulled with the answer
        answer: Trigger<Answer>,
    },
    /// Show a message
    DisplayMessage {
        /// Message text
        message: String,
    },
    /// Wait for one of `keys`, or any key
    WatchKeystroke {
        /// Keys of interest; `None` for any key
        keys: Option<String>,
        /// Pulled with the key pressed
        trigger: Trigger<Answer>,
    },
    /// Cancel a keystroke watch registered for exactly `keys`
    IgnoreKeystroke {
        /// Keys the watch was registered with
        keys: Option<String>,
    },
    /// Stop the progress clock
    PauseProgress,
    /// Restart the progress clock
    UnpauseProgress,
    /// Show the splash
    ShowSplash,
    /// Hide the splash
    HideSplash,
    /// The real root is mounted at `path`
    NewRoot {
        /// Mount point of the new root
        path: PathBuf,
    },
    /// Writable filesystems are available
    SystemInitialized,
    /// A boot service failed
    Error,
    /// Let go of the console
    Deactivate {
        /// Pulled once the console has been released
        done: Trigger,
    },
    /// Take the console back after a deactivate
    Reactivate,
    /// Tear down and exit
    Quit {
        /// Leave the last frame on screen
        retain_splash: bool,
        /// Pulled as the daemon exits
        done: Trigger,
    },
    /// Whether the daemon's VT is on screen
    HasActiveVt {
        /// Pulled with the answer
        reply: Trigger<bool>,
    },
}

impl BootRequest {
    /// Short name for logging
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Update { .. } => "update",
            Self::AskForPassword { .. } => "ask-for-password",
            Self::AskQuestion { .. } => "ask-question",
            Self::DisplayMessage { .. } => "display-message",
            Self::WatchKeystroke { .. } => "watch-keystroke",
            Self::IgnoreKeystroke { .. } => "ignore-keystroke",
            Self::PauseProgress => "pause-progress",
            Self::UnpauseProgress => "unpause-progress",
            Self::ShowSplash => "show-splash",
            Self::HideSplash => "hide-splash",
            Self::NewRoot { .. } => "newroot",
            Self::SystemInitialized => "system-initialized",
            Self::Error => "error",
            Self::Deactivate { .. } => "deactivate",
            Self::Reactivate => "reactivate",
            Self::Quit { .. } => "quit",
            Self::HasActiveVt { .. } => "has-active-vt",
        }
    }
}

// =============================================================================
// Options
// =============================================================================

/// Everything the daemon needs to know at startup
///
/// Assembled by the binary from its CLI, configuration file and
/// `/proc/cmdline`; the core never reads those itself.
#[derive(Clone, Debug)]
pub struct DaemonOptions {
    /// Boot or shutdown
    pub mode: Mode,
    /// Console used when the command line names none
    pub default_tty: String,
    /// Kernel command line
    pub kernel_command_line: KernelCommandLine,
    /// Capture console output into the boot log
    pub should_attach_to_session: bool,
    /// Directory holding `NAME/NAME.theme` theme files
    pub theme_dir: PathBuf,
    /// Administrator's theme
    pub theme: Option<String>,
    /// Distribution's theme
    pub distribution_theme: Option<String>,
    /// Boot log; `None` disables logging
    pub boot_log: Option<PathBuf>,
    /// Where the boot log is linked after a failure
    pub spool_log: Option<PathBuf>,
    /// Directory for the duration caches
    pub cache_dir: PathBuf,
}

impl DaemonOptions {
    /// Default options for `mode`
    #[must_use]
    pub fn new(mode: Mode) -> Self {
        let (boot_log, spool_log) = match mode {
            Mode::Boot => (
                Some(PathBuf::from("/var/log/boot.log")),
                Some(PathBuf::from("/var/spool/splashd/boot.log")),
            ),
            Mode::Shutdown => (None, None),
        };

        Self {
            mode,
            default_tty: mode.default_tty().to_string(),
            kernel_command_line: KernelCommandLine::default(),
            should_attach_to_session: false,
            theme_dir: PathBuf::from("/usr/share/splashd/themes"),
            theme: None,
            distribution_theme: None,
            boot_log,
            spool_log,
            cache_dir: PathBuf::from("/var/lib/splashd"),
        }
    }

    /// Theme file for theme `name`
    #[must_use]
    pub fn theme_path(&self, name: &str) -> PathBuf {
        self.theme_dir.join(name).join(format!("{name}.theme"))
    }

    /// Theme the distribution links as its default
    #[must_use]
    pub fn default_theme_link(&self) -> PathBuf {
        self.theme_dir.join("default.theme")
    }

    /// Duration cache for this run's mode
    #[must_use]
    pub fn cache_file(&self) -> PathBuf {
        self.cache_file_for(self.mode)
    }

    /// Duration cache for `mode`
    #[must_use]
    pub fn cache_file_for(&self, mode: Mode) -> PathBuf {
        let name = match mode {
            Mode::Boot => "boot-duration",
            Mode::Shutdown => "shutdown-duration",
        };
        self.cache_dir.join(name)
    }

    /// Replace the theme directory
    #[must_use]
    pub fn with_theme_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.theme_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Replace the kernel command line
    #[must_use]
    pub fn with_kernel_command_line(mut self, text: impl Into<String>) -> Self {
        self.kernel_command_line = KernelCommandLine::new(text);
        self
    }
}
