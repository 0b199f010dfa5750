//! splashd - Boot Splash Daemon
//!
//! Owns the console while the system boots or shuts down and serves boot
//! clients on a Unix socket.
//!
//! # Usage
//!
//! ```bash
//! # Boot splash on the default console
//! splashd --mode boot --attach-to-session
//!
//! # Shutdown splash on tty63
//! splashd --mode shutdown
//!
//! # Try a command line without rebooting
//! splashd --kernel-command-line "quiet splash plymouth:debug"
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: quit (boot mode only; ignored at shutdown so the
//!   splash survives the final kill)
//! - `SIGPIPE`: ignored
//! - `SIGUSR1` / `SIGUSR2`: VT release/acquire, handled by the core

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use nix::sys::signal::{signal as set_disposition, SigHandler, Signal};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, LocalSet};
use tracing::{info, warn};

use splash_core::{BootRequest, Daemon, DaemonOptions, KernelCommandLine, Mode, Trigger};

use splashd::config::{load_config_from_path, ConfigOverrides};
use splashd::event_loop::{self, TokioEventLoop};
use splashd::platform::SystemPlatform;
use splashd::protocol::Envelope;
use splashd::server::{BootServer, ServerConfig};

const KERNEL_COMMAND_LINE: &str = "/proc/cmdline";

/// splashd - boot splash daemon
#[derive(Parser, Debug)]
#[command(name = "splashd")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Whether the system is booting or shutting down
    #[arg(long, default_value = "boot", value_name = "MODE")]
    mode: Mode,

    /// Console to use when the kernel command line names none
    #[arg(long, value_name = "TTY")]
    tty: Option<String>,

    /// Capture console output into the boot log
    #[arg(long)]
    attach_to_session: bool,

    /// Log at debug level
    #[arg(long)]
    debug: bool,

    /// PID file path
    #[arg(long, env = "SPLASHD_PID_FILE", value_name = "PATH")]
    pid_file: Option<PathBuf>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "SPLASHD_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Unix socket path for boot clients
    #[arg(short = 's', long, value_name = "PATH")]
    socket_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "SPLASHD_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Use this text instead of /proc/cmdline
    #[arg(long, value_name = "TEXT")]
    kernel_command_line: Option<String>,
}

/// Write PID file
fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create PID directory {}", parent.display()))?;
    }

    let pid = std::process::id();
    let mut file = fs::File::create(path)
        .with_context(|| format!("failed to create PID file {}", path.display()))?;
    writeln!(file, "{pid}")?;

    info!(pid, path = %path.display(), "PID file created");
    Ok(())
}

/// Remove PID file
fn remove_pid_file(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!(error = %e, path = %path.display(), "failed to remove PID file");
        }
    }
}

/// Refuse to start if the PID file names a live process
fn check_existing_daemon(pid_path: &Path) -> Result<()> {
    if !pid_path.exists() {
        return Ok(());
    }

    let pid_str = fs::read_to_string(pid_path)
        .with_context(|| format!("failed to read PID file {}", pid_path.display()))?;
    let pid: i32 = pid_str.trim().parse().context("invalid PID in file")?;

    if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok() {
        anyhow::bail!(
            "another splashd is already running (PID: {pid}); \
             stop it first or remove {} if it is stale",
            pid_path.display()
        );
    }

    warn!(pid, "removing stale PID file");
    fs::remove_file(pid_path)?;
    Ok(())
}

/// Initialize logging, copying it to `file` when one is given
fn init_logging(level: &str, file: Option<&Path>) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("splashd={level},splash_core={level}"))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    match file {
        Some(path) => {
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open debug file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.init(),
    }

    Ok(())
}

fn ignore_signal(sig: Signal) -> Result<()> {
    // SAFETY: SigIgn installs no handler code
    unsafe { set_disposition(sig, SigHandler::SigIgn) }
        .with_context(|| format!("failed to ignore {sig}"))?;
    Ok(())
}

/// Turn SIGTERM and SIGINT into quit requests
fn forward_termination(requests: mpsc::UnboundedSender<Envelope>) -> Result<JoinHandle<()>> {
    let mut sigterm = signal(SignalKind::terminate()).context("failed to watch SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to watch SIGINT")?;

    Ok(tokio::task::spawn_local(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM, quitting"),
                _ = sigint.recv() => info!("received SIGINT, quitting"),
            }
            let quit = BootRequest::Quit {
                retain_splash: false,
                done: Trigger::new(),
            };
            if requests.send(Envelope::unacknowledged(quit)).is_err() {
                break;
            }
        }
    }))
}

async fn run_daemon(options: DaemonOptions, socket_path: &Path) -> Result<i32> {
    let mode = options.mode;
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (requests_tx, mut requests_rx) = mpsc::unbounded_channel();
    let mut event_loop = TokioEventLoop::new(events_tx);
    let mut daemon = Daemon::new(options, Box::new(SystemPlatform::new()));

    let server = BootServer::bind(socket_path, ServerConfig::default())?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let server_task = tokio::task::spawn_local(server.run(requests_tx.clone(), shutdown_rx));

    let termination = match mode {
        Mode::Boot => Some(forward_termination(requests_tx.clone())?),
        Mode::Shutdown => None,
    };
    drop(requests_tx);

    if let Err(error) = daemon.start(&mut event_loop) {
        warn!(%error, "continuing without console capture");
    }

    let code = event_loop::run(&mut daemon, &mut event_loop, &mut events_rx, &mut requests_rx).await;
    info!(code, "event loop finished");

    if let Some(task) = termination {
        task.abort();
    }
    daemon.shutdown();
    // unanswered requests are dropped here, which releases their clients
    drop(daemon);
    drop(requests_rx);
    drop(event_loop);

    let _ = shutdown_tx.send(());
    if let Err(error) = server_task.await {
        warn!(%error, "boot server task failed");
    }
    Ok(code)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let (kernel_command_line, cmdline_error) = match &args.kernel_command_line {
        Some(text) => (KernelCommandLine::new(text.clone()), None),
        None => match fs::read_to_string(KERNEL_COMMAND_LINE) {
            Ok(text) => (KernelCommandLine::new(text), None),
            Err(error) => (KernelCommandLine::default(), Some(error)),
        },
    };

    let debug_request = kernel_command_line.debug();
    let level = if args.debug || debug_request.is_some() {
        "debug"
    } else {
        args.log_level.as_str()
    };
    init_logging(level, debug_request.and_then(|d| d.file).as_deref())?;

    info!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), mode = %args.mode, "splashd starting");
    if let Some(error) = cmdline_error {
        warn!(path = KERNEL_COMMAND_LINE, %error, "could not read kernel command line");
    }

    if !nix::unistd::geteuid().is_root() {
        anyhow::bail!("splashd must be run as root");
    }

    let mut config =
        load_config_from_path(args.config.as_deref()).context("failed to load configuration")?;
    ConfigOverrides::new()
        .socket_path(args.socket_path)
        .pid_file(args.pid_file)
        .tty(args.mode, args.tty)
        .apply(&mut config);
    info!(
        source = %config.source,
        file = ?config.config_file_path,
        socket_path = %config.socket_path.display(),
        "configuration loaded"
    );

    check_existing_daemon(&config.pid_file)?;
    write_pid_file(&config.pid_file)?;

    ignore_signal(Signal::SIGPIPE)?;
    if args.mode == Mode::Shutdown {
        ignore_signal(Signal::SIGTERM)?;
    }

    let options = config.daemon_options(args.mode, kernel_command_line, args.attach_to_session);
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    let result = LocalSet::new().block_on(&runtime, run_daemon(options, &config.socket_path));

    remove_pid_file(&config.pid_file);
    let code = result?;
    info!(code, "splashd exiting");
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_args_parse_mode_and_paths() {
        let args = Args::parse_from([
            "splashd",
            "--mode",
            "shutdown",
            "--tty",
            "tty9",
            "--attach-to-session",
            "--socket-path",
            "/tmp/boot.sock",
        ]);
        assert_eq!(args.mode, Mode::Shutdown);
        assert_eq!(args.tty.as_deref(), Some("tty9"));
        assert!(args.attach_to_session);
        assert_eq!(args.socket_path, Some(PathBuf::from("/tmp/boot.sock")));
    }

    #[test]
    fn test_args_reject_unknown_mode() {
        assert!(Args::try_parse_from(["splashd", "--mode", "reboot"]).is_err());
    }

    #[test]
    fn test_pid_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run").join("splashd.pid");

        write_pid_file(&path).unwrap();
        let written: u32 = fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(written, std::process::id());

        // our own PID is alive
        assert!(check_existing_daemon(&path).is_err());

        remove_pid_file(&path);
        assert!(!path.exists());
    }

    #[test]
    fn test_stale_pid_file_is_removed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("splashd.pid");
        // PID_MAX_LIMIT is 2^22, so this can never be a live process
        fs::write(&path, "99999999\n").unwrap();

        check_existing_daemon(&path).unwrap();
        assert!(!path.exists());
    }
}
