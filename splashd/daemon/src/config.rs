//! Daemon Configuration
//!
//! Settings are loaded from `/etc/splashd/splashd.toml`, then environment
//! variables, then command line flags.
//!
//! # Configuration Priority
//!
//! 1. CLI arguments
//! 2. Environment variables (`SPLASHD_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [daemon]
//! theme = "details"
//! distribution_theme = "text"
//! theme_dir = "/usr/share/splashd/themes"
//! boot_tty = "tty1"
//! shutdown_tty = "tty63"
//! socket_path = "/run/splashd/boot.sock"
//! pid_file = "/run/splashd/splashd.pid"
//!
//! [logging]
//! boot_log = "/var/log/boot.log"
//! spool_log = "/var/spool/splashd/boot.log"
//! cache_dir = "/var/lib/splashd"
//! ```
//!
//! The kernel command line is not part of this file; it always comes from
//! `/proc/cmdline` (or `--kernel-command-line` when testing).

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use splash_core::{DaemonOptions, KernelCommandLine, Mode, BOOT_TTY, SHUTDOWN_TTY};

/// Configuration file read when `--config` is not given
pub const DEFAULT_CONFIG_PATH: &str = "/etc/splashd/splashd.toml";

/// Socket boot clients connect to
pub const DEFAULT_SOCKET_PATH: &str = "/run/splashd/boot.sock";

/// PID file written at startup
pub const DEFAULT_PID_FILE: &str = "/run/splashd/splashd.pid";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    ValidationError(String),
}

/// Where the last applied setting came from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConfigSource {
    /// Command line flag
    Cli,
    /// `SPLASHD_*` environment variable
    Env,
    /// Configuration file
    File,
    /// Built-in default
    #[default]
    Default,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Sections
// =============================================================================

/// `[daemon]` section
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct DaemonToml {
    /// Administrator's theme name
    pub theme: Option<String>,
    /// Distribution's theme name
    pub distribution_theme: Option<String>,
    /// Directory holding `NAME/NAME.theme`
    pub theme_dir: Option<PathBuf>,
    /// Console used at boot
    pub boot_tty: Option<String>,
    /// Console used at shutdown
    pub shutdown_tty: Option<String>,
    /// Boot socket
    pub socket_path: Option<PathBuf>,
    /// PID file
    pub pid_file: Option<PathBuf>,
}

/// `[logging]` section
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoggingToml {
    /// Boot log; an empty string disables it
    pub boot_log: Option<PathBuf>,
    /// Link target for the boot log after a failed boot
    pub spool_log: Option<PathBuf>,
    /// Duration cache directory
    pub cache_dir: Option<PathBuf>,
}

/// Whole configuration file
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SplashdToml {
    /// `[daemon]`
    pub daemon: DaemonToml,
    /// `[logging]`
    pub logging: LoggingToml,
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Fully resolved daemon settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SplashdConfig {
    /// Administrator's theme name
    pub theme: Option<String>,
    /// Distribution's theme name
    pub distribution_theme: Option<String>,
    /// Theme directory
    pub theme_dir: PathBuf,
    /// Console used at boot
    pub boot_tty: String,
    /// Console used at shutdown
    pub shutdown_tty: String,
    /// Boot socket
    pub socket_path: PathBuf,
    /// PID file
    pub pid_file: PathBuf,
    /// Boot log; `None` disables it
    pub boot_log: Option<PathBuf>,
    /// Spool link for the boot log
    pub spool_log: Option<PathBuf>,
    /// Duration cache directory
    pub cache_dir: PathBuf,
    /// Highest priority source that set a value
    pub source: ConfigSource,
    /// File the configuration was read from, if any
    pub config_file_path: Option<PathBuf>,
}

impl Default for SplashdConfig {
    fn default() -> Self {
        let defaults = DaemonOptions::new(Mode::Boot);
        Self {
            theme: None,
            distribution_theme: None,
            theme_dir: defaults.theme_dir,
            boot_tty: BOOT_TTY.to_string(),
            shutdown_tty: SHUTDOWN_TTY.to_string(),
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            pid_file: PathBuf::from(DEFAULT_PID_FILE),
            boot_log: defaults.boot_log,
            spool_log: defaults.spool_log,
            cache_dir: defaults.cache_dir,
            source: ConfigSource::Default,
            config_file_path: None,
        }
    }
}

fn non_empty_path(path: PathBuf) -> Option<PathBuf> {
    (!path.as_os_str().is_empty()).then_some(path)
}

fn non_empty(value: String) -> Option<String> {
    (!value.trim().is_empty()).then_some(value)
}

impl SplashdConfig {
    /// Console configured for `mode`
    #[must_use]
    pub fn tty_for(&self, mode: Mode) -> &str {
        match mode {
            Mode::Boot => &self.boot_tty,
            Mode::Shutdown => &self.shutdown_tty,
        }
    }

    /// Startup options for the daemon core
    ///
    /// Shutdown never writes the boot log.
    #[must_use]
    pub fn daemon_options(
        &self,
        mode: Mode,
        kernel_command_line: KernelCommandLine,
        attach_to_session: bool,
    ) -> DaemonOptions {
        let mut options = DaemonOptions::new(mode);
        options.default_tty = self.tty_for(mode).to_string();
        options.kernel_command_line = kernel_command_line;
        options.should_attach_to_session = attach_to_session;
        options.theme_dir.clone_from(&self.theme_dir);
        options.theme.clone_from(&self.theme);
        options.distribution_theme.clone_from(&self.distribution_theme);
        options.cache_dir.clone_from(&self.cache_dir);
        if mode == Mode::Boot {
            options.boot_log.clone_from(&self.boot_log);
            options.spool_log.clone_from(&self.spool_log);
        }
        options
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (key, tty) in [("boot_tty", &self.boot_tty), ("shutdown_tty", &self.shutdown_tty)] {
            if tty.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!("{key} must not be empty")));
            }
        }
        if self.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "socket_path must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Loading
// =============================================================================

/// Load configuration from `path` (or the default location), then apply
/// `SPLASHD_*` environment variables
///
/// A missing file is not an error.
///
/// # Errors
///
/// Returns [`ConfigError`] if the file exists but cannot be read or parsed,
/// or if a resulting value is invalid.
pub fn load_config_from_path(path: Option<&Path>) -> Result<SplashdConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// [`load_config_from_path`] with an explicit environment lookup
///
/// # Errors
///
/// See [`load_config_from_path`].
pub fn load_config_with_env(
    path: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<SplashdConfig, ConfigError> {
    let path = path.map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), Path::to_path_buf);
    let mut config = SplashdConfig::default();

    match std::fs::read_to_string(&path) {
        Ok(contents) => {
            let file: SplashdToml = toml::from_str(&contents)?;
            apply_toml_config(&mut config, file);
            config.config_file_path = Some(path);
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no configuration file, using defaults");
        }
        Err(source) => return Err(ConfigError::ReadError { path, source }),
    }

    apply_env_config(&mut config, env);
    config.validate()?;
    Ok(config)
}

fn apply_toml_config(config: &mut SplashdConfig, file: SplashdToml) {
    let SplashdToml { daemon, logging } = file;
    let before = config.clone();

    if let Some(theme) = daemon.theme {
        config.theme = non_empty(theme);
    }
    if let Some(theme) = daemon.distribution_theme {
        config.distribution_theme = non_empty(theme);
    }
    if let Some(dir) = daemon.theme_dir {
        config.theme_dir = dir;
    }
    if let Some(tty) = daemon.boot_tty {
        config.boot_tty = tty;
    }
    if let Some(tty) = daemon.shutdown_tty {
        config.shutdown_tty = tty;
    }
    if let Some(path) = daemon.socket_path {
        config.socket_path = path;
    }
    if let Some(path) = daemon.pid_file {
        config.pid_file = path;
    }
    if let Some(path) = logging.boot_log {
        config.boot_log = non_empty_path(path);
    }
    if let Some(path) = logging.spool_log {
        config.spool_log = non_empty_path(path);
    }
    if let Some(dir) = logging.cache_dir {
        config.cache_dir = dir;
    }

    if *config != before {
        config.source = ConfigSource::File;
    }
}

fn apply_env_config(config: &mut SplashdConfig, env: impl Fn(&str) -> Option<String>) {
    if let Some(theme) = env("SPLASHD_THEME") {
        config.theme = non_empty(theme);
        config.source = ConfigSource::Env;
    }
    if let Some(dir) = env("SPLASHD_THEME_DIR") {
        config.theme_dir = PathBuf::from(dir);
        config.source = ConfigSource::Env;
    }
    if let Some(tty) = env("SPLASHD_BOOT_TTY") {
        config.boot_tty = tty;
        config.source = ConfigSource::Env;
    }
    if let Some(tty) = env("SPLASHD_SHUTDOWN_TTY") {
        config.shutdown_tty = tty;
        config.source = ConfigSource::Env;
    }
    if let Some(path) = env("SPLASHD_SOCKET") {
        config.socket_path = PathBuf::from(path);
        config.source = ConfigSource::Env;
    }
    if let Some(path) = env("SPLASHD_BOOT_LOG") {
        config.boot_log = non_empty_path(PathBuf::from(path));
        config.source = ConfigSource::Env;
    }
    if let Some(dir) = env("SPLASHD_CACHE_DIR") {
        config.cache_dir = PathBuf::from(dir);
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Overrides
// =============================================================================

/// Values given on the command line
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    socket_path: Option<PathBuf>,
    pid_file: Option<PathBuf>,
    tty: Option<(Mode, String)>,
}

impl ConfigOverrides {
    /// No overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the boot socket
    #[must_use]
    pub fn socket_path(mut self, path: Option<PathBuf>) -> Self {
        self.socket_path = path;
        self
    }

    /// Override the PID file
    #[must_use]
    pub fn pid_file(mut self, path: Option<PathBuf>) -> Self {
        self.pid_file = path;
        self
    }

    /// Override the console used in `mode`
    #[must_use]
    pub fn tty(mut self, mode: Mode, tty: Option<String>) -> Self {
        self.tty = tty.map(|tty| (mode, tty));
        self
    }

    /// Apply the overrides on top of `config`
    pub fn apply(self, config: &mut SplashdConfig) {
        if let Some(path) = self.socket_path {
            config.socket_path = path;
            config.source = ConfigSource::Cli;
        }
        if let Some(path) = self.pid_file {
            config.pid_file = path;
            config.source = ConfigSource::Cli;
        }
        match self.tty {
            Some((Mode::Boot, tty)) => {
                config.boot_tty = tty;
                config.source = ConfigSource::Cli;
            }
            Some((Mode::Shutdown, tty)) => {
                config.shutdown_tty = tty;
                config.source = ConfigSource::Cli;
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn write_config(dir: &TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("splashd.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config =
            load_config_with_env(Some(&dir.path().join("absent.toml")), no_env).unwrap();

        assert_eq!(config.source, ConfigSource::Default);
        assert_eq!(config.config_file_path, None);
        assert_eq!(config.boot_tty, "tty1");
        assert_eq!(config.shutdown_tty, "tty63");
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
    }

    #[test]
    fn test_file_values_apply() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
                [daemon]
                theme = "details"
                boot_tty = "tty7"

                [logging]
                boot_log = ""
                cache_dir = "/tmp/cache"
            "#,
        );

        let config = load_config_with_env(Some(&path), no_env).unwrap();

        assert_eq!(config.source, ConfigSource::File);
        assert_eq!(config.theme.as_deref(), Some("details"));
        assert_eq!(config.boot_tty, "tty7");
        assert_eq!(config.boot_log, None);
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/cache"));
        assert_eq!(config.config_file_path, Some(path));
    }

    #[test]
    fn test_parse_error_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "[daemon\ntheme = ");
        assert!(matches!(
            load_config_with_env(Some(&path), no_env),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_empty_tty_is_invalid() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "[daemon]\nshutdown_tty = \"\"\n");
        assert!(matches!(
            load_config_with_env(Some(&path), no_env),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "[daemon]\ntheme = \"details\"\n");
        let env: HashMap<&str, &str> =
            HashMap::from([("SPLASHD_THEME", "text"), ("SPLASHD_SOCKET", "/tmp/s.sock")]);

        let config =
            load_config_with_env(Some(&path), |key| env.get(key).map(ToString::to_string))
                .unwrap();

        assert_eq!(config.source, ConfigSource::Env);
        assert_eq!(config.theme.as_deref(), Some("text"));
        assert_eq!(config.socket_path, PathBuf::from("/tmp/s.sock"));
    }

    #[test]
    fn test_cli_overrides_win() {
        let mut config = SplashdConfig::default();
        ConfigOverrides::new()
            .tty(Mode::Shutdown, Some("tty12".to_string()))
            .pid_file(Some(PathBuf::from("/tmp/splashd.pid")))
            .apply(&mut config);

        assert_eq!(config.source, ConfigSource::Cli);
        assert_eq!(config.shutdown_tty, "tty12");
        assert_eq!(config.boot_tty, "tty1");
        assert_eq!(config.pid_file, PathBuf::from("/tmp/splashd.pid"));
    }

    #[test]
    fn test_shutdown_options_never_log() {
        let config = SplashdConfig {
            theme: Some("details".to_string()),
            ..SplashdConfig::default()
        };

        let options = config.daemon_options(
            Mode::Shutdown,
            KernelCommandLine::new("quiet splash"),
            true,
        );

        assert_eq!(options.default_tty, "tty63");
        assert_eq!(options.boot_log, None);
        assert_eq!(options.theme.as_deref(), Some("details"));
        assert!(options.should_attach_to_session);
        assert_eq!(options.kernel_command_line.as_str(), "quiet splash");
    }

    #[test]
    fn test_source_display() {
        assert_eq!(ConfigSource::Cli.to_string(), "CLI");
        assert_eq!(ConfigSource::File.to_string(), "config file");
    }
}
