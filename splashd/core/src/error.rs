//! Error Types
//!
//! Errors surfaced by the core. Transient device failures (a failed window
//! size query, a missing color map) never reach these types: they are logged
//! and replaced with safe defaults at the call site.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

// =============================================================================
// Terminal Errors
// =============================================================================

/// Errors returned by [`crate::Terminal`] operations
#[derive(Debug, Error)]
pub enum TerminalError {
    /// The device node could not be opened
    #[error("failed to open terminal {path}: {source}")]
    Open {
        /// Device path that was attempted
        path: PathBuf,
        /// Underlying I/O error
        source: io::Error,
    },

    /// The operation requires an open device
    #[error("terminal is not open")]
    NotOpen,

    /// The operation only applies to virtual terminals
    #[error("{0} is not a virtual terminal")]
    NotAVt(PathBuf),

    /// The VT active when the terminal was first opened was never learned
    #[error("initial virtual terminal is unknown")]
    UnknownInitialVt,

    /// Refusing to deallocate the VT the system started on
    #[error("virtual terminal {0} is the initial terminal")]
    InitialVt(u32),

    /// A terminal control call failed
    #[error("terminal control failed: {0}")]
    Device(#[from] nix::Error),

    /// A read or write on the device failed
    #[error("terminal I/O failed: {0}")]
    Io(#[from] io::Error),
}

// =============================================================================
// Collaborator Errors
// =============================================================================

/// Errors raised by splash plugins
#[derive(Debug, Error)]
pub enum SplashError {
    /// The theme file could not be loaded
    #[error("failed to load splash theme {path}: {reason}")]
    Load {
        /// Theme file path
        path: PathBuf,
        /// Human readable cause
        reason: String,
    },

    /// The splash refused to start
    #[error("failed to show splash: {0}")]
    Show(String),
}

/// Errors raised by the logging session
#[derive(Debug, Error)]
pub enum SessionError {
    /// Attaching to the console session failed
    #[error("failed to attach to session: {0}")]
    Attach(#[source] io::Error),

    /// The boot log could not be opened or spooled
    #[error("boot log {path}: {source}")]
    Log {
        /// Log file path
        path: PathBuf,
        /// Underlying I/O error
        source: io::Error,
    },
}

/// Errors raised by the platform when switching root
#[derive(Debug, Error)]
#[error("failed to switch root to {path}: {source}")]
pub struct SwitchRootError {
    /// Requested new root
    pub path: PathBuf,
    /// Underlying I/O error
    pub source: io::Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_error_display() {
        let err = TerminalError::NotAVt(PathBuf::from("/dev/ttyS0"));
        assert_eq!(err.to_string(), "/dev/ttyS0 is not a virtual terminal");

        let err = TerminalError::InitialVt(1);
        assert_eq!(err.to_string(), "virtual terminal 1 is the initial terminal");
    }

    #[test]
    fn test_nix_error_converts() {
        let err: TerminalError = nix::Error::ENOTTY.into();
        assert!(matches!(err, TerminalError::Device(nix::Error::ENOTTY)));
    }
}
