//! System Platform
//!
//! The [`Platform`] the daemon runs with: real console devices, the text
//! splash, and the pty-backed boot log session. No pixel renderer is built
//! in, so every splash draws on text displays.

use std::path::Path;

use nix::unistd::{chdir, chroot};
use tracing::{debug, info};

use splash_core::{
    LinuxTtyOpener, LogSession, Platform, Renderer, Splash, SplashError, SwitchRootError,
    Terminal,
};

use crate::session::BootLogSession;
use crate::splash::TextSplash;

/// Collaborators backed by the running system
#[derive(Debug, Default)]
pub struct SystemPlatform;

impl SystemPlatform {
    /// Create the platform
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Platform for SystemPlatform {
    fn new_terminal(&mut self, tty: &str) -> Terminal {
        Terminal::new(tty, Box::new(LinuxTtyOpener))
    }

    fn open_renderer(&mut self, terminal: &Terminal) -> Option<Box<dyn Renderer>> {
        debug!(tty = %terminal.name().display(), "no pixel renderer available");
        None
    }

    fn load_splash(
        &mut self,
        theme: &Path,
        boot_output: &[u8],
    ) -> Result<Box<dyn Splash>, SplashError> {
        let splash = TextSplash::load(theme, boot_output)?;
        Ok(Box::new(splash))
    }

    fn new_session(&mut self) -> Box<dyn LogSession> {
        Box::new(BootLogSession::new())
    }

    fn switch_root(&mut self, path: &Path) -> Result<(), SwitchRootError> {
        let switch = || -> nix::Result<()> {
            chdir(path)?;
            chroot(".")?;
            chdir("/")
        };
        switch().map_err(|errno| SwitchRootError {
            path: path.to_path_buf(),
            source: errno.into(),
        })?;
        info!(path = %path.display(), "switched root");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_terminal_uses_device_path() {
        let mut platform = SystemPlatform::new();
        let terminal = platform.new_terminal("tty5");
        assert_eq!(terminal.name(), Path::new("/dev/tty5"));
        assert!(!terminal.is_open());
    }

    #[test]
    fn test_no_renderer() {
        let mut platform = SystemPlatform::new();
        let terminal = platform.new_terminal("tty1");
        assert!(platform.open_renderer(&terminal).is_none());
    }

    #[test]
    fn test_load_splash_propagates_theme_errors() {
        let dir = TempDir::new().unwrap();
        let mut platform = SystemPlatform::new();
        let result = platform.load_splash(&dir.path().join("missing.theme"), b"");
        assert!(matches!(result, Err(SplashError::Load { .. })));
    }

    #[test]
    fn test_switch_root_to_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("sysroot");
        let mut platform = SystemPlatform::new();

        let err = platform.switch_root(&missing).unwrap_err();

        assert_eq!(err.path, missing);
        assert_eq!(err.source.kind(), std::io::ErrorKind::NotFound);
    }
}
