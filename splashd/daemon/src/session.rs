//! Boot Log Session
//!
//! Captures console output during boot. Attaching opens a pseudo-terminal
//! and (when asked to redirect) makes its slave side the kernel console with
//! `TIOCCONS`, so everything written to `/dev/console` arrives on the master
//! side. The daemon watches the master descriptor and feeds what it reads to
//! the splash and to [`LogSession::log_output`], which appends to the boot
//! log.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use nix::pty::openpty;
use tracing::{debug, info, warn};

use splash_core::{LogSession, SessionError};

const CONSOLE: &str = "/dev/console";

mod ioctl {
    nix::ioctl_none_bad!(tioccons, libc::TIOCCONS);
}

struct Pty {
    master: OwnedFd,
    slave: OwnedFd,
}

/// Console capture backed by a pseudo-terminal
#[derive(Default)]
pub struct BootLogSession {
    pty: Option<Pty>,
    redirected: bool,
    log: Option<(PathBuf, File)>,
}

impl BootLogSession {
    /// A detached session with no log open
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether console output is being captured
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.pty.is_some()
    }

    /// Boot log currently written, if any
    #[must_use]
    pub fn log_path(&self) -> Option<&Path> {
        self.log.as_ref().map(|(path, _)| path.as_path())
    }
}

/// Make the terminal behind `fd` the kernel console
fn redirect_console(fd: RawFd) -> io::Result<()> {
    // SAFETY: fd is an open terminal descriptor for the duration of the call
    unsafe { ioctl::tioccons(fd) }.map(drop).map_err(io::Error::from)
}

/// Hand the kernel console back to the real console device
fn restore_console() -> io::Result<()> {
    let console = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(CONSOLE)?;
    redirect_console(console.as_raw_fd())
}

impl LogSession for BootLogSession {
    fn attach(&mut self, redirect: bool) -> Result<Option<RawFd>, SessionError> {
        if let Some(pty) = &self.pty {
            return Ok(Some(pty.master.as_raw_fd()));
        }

        let pty = openpty(None, None).map_err(|errno| SessionError::Attach(errno.into()))?;
        let pty = Pty {
            master: pty.master,
            slave: pty.slave,
        };

        if redirect {
            redirect_console(pty.slave.as_raw_fd()).map_err(SessionError::Attach)?;
            self.redirected = true;
        }

        let fd = pty.master.as_raw_fd();
        info!(redirect, "attached to console session");
        self.pty = Some(pty);
        Ok(Some(fd))
    }

    fn detach(&mut self) {
        if self.redirected {
            if let Err(error) = restore_console() {
                warn!(%error, "could not give the console back");
            }
            self.redirected = false;
        }
        if self.pty.take().is_some() {
            info!("detached from console session");
        }
    }

    fn open_log(&mut self, path: &Path) -> Result<(), SessionError> {
        let log_error = |source| SessionError::Log {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(log_error)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(log_error)?;

        debug!(path = %path.display(), "opened boot log");
        self.log = Some((path.to_path_buf(), file));
        Ok(())
    }

    fn close_log(&mut self) {
        if let Some((path, mut file)) = self.log.take() {
            if let Err(error) = file.flush() {
                warn!(path = %path.display(), %error, "could not flush boot log");
            }
            debug!(path = %path.display(), "closed boot log");
        }
    }

    fn log_output(&mut self, output: &[u8]) {
        let Some((path, file)) = self.log.as_mut() else {
            return;
        };
        if let Err(error) = file.write_all(output) {
            warn!(path = %path.display(), %error, "boot log write failed, closing it");
            self.log = None;
        }
    }
}

impl Drop for BootLogSession {
    fn drop(&mut self) {
        self.close_log();
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_log_output_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("var").join("log").join("boot.log");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"previous\n").unwrap();

        let mut session = BootLogSession::new();
        session.open_log(&path).unwrap();
        session.log_output(b"Starting udev\n");
        session.log_output(b"Mounting /home\n");
        session.close_log();
        session.log_output(b"dropped\n");

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "previous\nStarting udev\nMounting /home\n"
        );
        assert_eq!(session.log_path(), None);
    }

    #[test]
    fn test_open_log_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("spool").join("boot.log");

        let mut session = BootLogSession::new();
        session.open_log(&path).unwrap();

        assert!(path.exists());
        assert_eq!(session.log_path(), Some(path.as_path()));
    }

    #[test]
    fn test_open_log_reports_path_on_failure() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"").unwrap();

        let mut session = BootLogSession::new();
        let err = session.open_log(&blocker.join("boot.log")).unwrap_err();

        assert!(matches!(err, SessionError::Log { path, .. } if path == blocker.join("boot.log")));
    }

    #[test]
    fn test_detach_without_attach_is_harmless() {
        let mut session = BootLogSession::new();
        session.detach();
        assert!(!session.is_attached());
    }
}
