//! Boot Progress
//!
//! Tracks how long the current boot (or shutdown) has been running, minus
//! any time spent paused while a client asked for input, and estimates a
//! completion percentage from the duration recorded by the previous run.
//!
//! The duration cache is a single line holding the elapsed seconds of the
//! last completed run, e.g. `12.345`.

use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

/// Elapsed-time tracker for one boot or shutdown
#[derive(Debug, Clone)]
pub struct Progress {
    start: Instant,
    paused_at: Option<Instant>,
    paused_total: Duration,
    previous_duration: Option<Duration>,
    status: Option<String>,
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

impl Progress {
    /// Start tracking now
    #[must_use]
    pub fn new() -> Self {
        Self::started_at(Instant::now())
    }

    /// Start tracking at `start`
    #[must_use]
    pub fn started_at(start: Instant) -> Self {
        Self {
            start,
            paused_at: None,
            paused_total: Duration::ZERO,
            previous_duration: None,
            status: None,
        }
    }

    /// Stop the clock
    pub fn pause(&mut self) {
        self.pause_at(Instant::now());
    }

    /// Stop the clock at `now`; pausing twice keeps the first pause
    pub fn pause_at(&mut self, now: Instant) {
        if self.paused_at.is_none() {
            self.paused_at = Some(now);
        }
    }

    /// Restart the clock
    pub fn unpause(&mut self) {
        self.unpause_at(Instant::now());
    }

    /// Restart the clock at `now`
    pub fn unpause_at(&mut self, now: Instant) {
        if let Some(paused_at) = self.paused_at.take() {
            self.paused_total += now.saturating_duration_since(paused_at);
        }
    }

    /// Whether the clock is stopped
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    /// Running time so far
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed_at(Instant::now())
    }

    /// Running time at `now`, excluding paused periods
    #[must_use]
    pub fn elapsed_at(&self, now: Instant) -> Duration {
        let end = self.paused_at.unwrap_or(now);
        end.saturating_duration_since(self.start)
            .saturating_sub(self.paused_total)
    }

    /// Record the latest status message from a client
    pub fn status_update(&mut self, status: &str) {
        self.status = Some(status.to_string());
    }

    /// Latest status message
    #[must_use]
    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    /// Duration of the previous run, if a cache was loaded
    #[must_use]
    pub fn previous_duration(&self) -> Option<Duration> {
        self.previous_duration
    }

    /// Estimated completion as a fraction in `0.0..=1.0`
    #[must_use]
    pub fn percentage_at(&self, now: Instant) -> Option<f64> {
        let previous = self.previous_duration?.as_secs_f64();
        if previous <= 0.0 {
            return None;
        }
        Some((self.elapsed_at(now).as_secs_f64() / previous).min(1.0))
    }

    /// Estimated completion now
    #[must_use]
    pub fn percentage(&self) -> Option<f64> {
        self.percentage_at(Instant::now())
    }

    /// Read the previous run's duration
    ///
    /// Returns `false` (keeping any earlier value) if the cache is missing or
    /// unreadable.
    pub fn load_cache(&mut self, path: &Path) -> bool {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(error) => {
                debug!(path = %path.display(), %error, "no duration cache");
                return false;
            }
        };

        match contents.trim().parse::<f64>() {
            Ok(seconds) if seconds.is_finite() && seconds >= 0.0 => {
                self.previous_duration = Some(Duration::from_secs_f64(seconds));
                trace!(path = %path.display(), seconds, "loaded duration cache");
                true
            }
            _ => {
                debug!(path = %path.display(), "ignoring malformed duration cache");
                false
            }
        }
    }

    /// Store this run's duration for the next run
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the cache cannot be written.
    pub fn save_cache(&self, path: &Path) -> io::Result<()> {
        self.save_cache_at(path, Instant::now())
    }

    /// Store the duration as of `now`
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the cache cannot be written.
    pub fn save_cache_at(&self, path: &Path, now: Instant) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let seconds = self.elapsed_at(now).as_secs_f64();
        fs::write(path, format!("{seconds:.3}\n"))?;
        trace!(path = %path.display(), seconds, "saved duration cache");
        Ok(())
    }
}
