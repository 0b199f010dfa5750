//! Text Splash
//!
//! The splash the daemon ships with: it writes to the text consoles it is
//! given and never touches pixels. A theme file selects one of two modules:
//!
//! - `details`: echoes captured console output, so the boot scrolls by as
//!   if there were no splash at all
//! - `text`: a single status line, rewritten in place
//!
//! # Theme File
//!
//! ```toml
//! [theme]
//! name = "Details"
//! description = "Verbose fallback theme"
//! module = "details"
//! ```
//!
//! Consoles are in raw mode while the splash is up, so every line feed is
//! written as CR LF.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, trace, warn};

use splash_core::{
    EventLoop, LoopEvent, Mode, PixelDisplay, Splash, SplashError, TextDisplay,
};

const CLEAR_LINE: &str = "\r\x1b[K";

/// Which renderer a theme uses
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplashModule {
    /// Echo console output
    Details,
    /// One status line
    Text,
}

#[derive(Debug, Deserialize)]
struct ThemeFile {
    theme: ThemeSection,
}

#[derive(Debug, Deserialize)]
struct ThemeSection {
    name: String,
    #[serde(default)]
    description: Option<String>,
    module: SplashModule,
}

struct Console {
    path: PathBuf,
    file: File,
}

/// A splash that draws on text consoles
pub struct TextSplash {
    theme: PathBuf,
    name: String,
    module: SplashModule,
    consoles: Vec<Console>,
    pending_output: Vec<u8>,
    mode: Option<Mode>,
    prompt_visible: bool,
    status: Option<String>,
}

impl TextSplash {
    /// Load the theme at `theme`
    ///
    /// `boot_output` is echoed when a `details` splash is shown.
    ///
    /// # Errors
    ///
    /// Returns [`SplashError::Load`] if the file cannot be read or does not
    /// name a known module.
    pub fn load(theme: &Path, boot_output: &[u8]) -> Result<Self, SplashError> {
        let load_error = |reason: String| SplashError::Load {
            path: theme.to_path_buf(),
            reason,
        };
        let contents = std::fs::read_to_string(theme).map_err(|e| load_error(e.to_string()))?;
        let file: ThemeFile = toml::from_str(&contents).map_err(|e| load_error(e.to_string()))?;

        debug!(
            theme = %theme.display(),
            name = %file.theme.name,
            description = file.theme.description.as_deref().unwrap_or(""),
            module = ?file.theme.module,
            "loaded splash theme"
        );

        Ok(Self {
            theme: theme.to_path_buf(),
            name: file.theme.name,
            module: file.theme.module,
            consoles: Vec::new(),
            pending_output: boot_output.to_vec(),
            mode: None,
            prompt_visible: false,
            status: None,
        })
    }

    /// Theme's display name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Module the theme selected
    #[must_use]
    pub fn module(&self) -> SplashModule {
        self.module
    }

    fn is_shown(&self) -> bool {
        self.mode.is_some()
    }

    fn write(&mut self, bytes: &[u8]) {
        self.consoles.retain_mut(|console| match console.file.write_all(bytes) {
            Ok(()) => true,
            Err(error) => {
                warn!(tty = %console.path.display(), %error, "dropping text display");
                false
            }
        });
    }

    fn write_status_line(&mut self) {
        if self.module != SplashModule::Text || self.prompt_visible {
            return;
        }
        let line = match (&self.status, self.mode) {
            (Some(status), _) => status.clone(),
            (None, Some(Mode::Shutdown)) => "Shutting down".to_string(),
            (None, _) => "Starting up".to_string(),
        };
        self.write(format!("{CLEAR_LINE}{line}").as_bytes());
    }

    fn write_prompt(&mut self, prompt: &str, shown: &str) {
        self.prompt_visible = true;
        self.write(format!("{CLEAR_LINE}{prompt}: {shown}").as_bytes());
    }
}

/// Expand bare line feeds to CR LF
fn to_crlf(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() + bytes.len() / 16);
    let mut previous = 0u8;
    for &byte in bytes {
        if byte == b'\n' && previous != b'\r' {
            out.push(b'\r');
        }
        out.push(byte);
        previous = byte;
    }
    out
}

impl Splash for TextSplash {
    fn theme(&self) -> &Path {
        &self.theme
    }

    fn add_pixel_display(&mut self, head_display: &PixelDisplay) {
        trace!(head = head_display.head.index, "text splash ignores pixel display");
    }

    fn add_text_display(&mut self, text_display: &TextDisplay) {
        let tty = &text_display.tty;
        let opened = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(tty);
        match opened {
            Ok(file) => {
                debug!(tty = %tty.display(), "added text display");
                self.consoles.push(Console {
                    path: tty.clone(),
                    file,
                });
            }
            Err(error) => warn!(tty = %tty.display(), %error, "could not open text display"),
        }
    }

    fn show(&mut self, mode: Mode) -> Result<(), SplashError> {
        if self.consoles.is_empty() {
            return Err(SplashError::Show("no text displays".to_string()));
        }
        self.mode = Some(mode);
        debug!(theme = %self.name, %mode, "showing text splash");

        match self.module {
            SplashModule::Details => {
                let output = to_crlf(&std::mem::take(&mut self.pending_output));
                self.write(&output);
            }
            SplashModule::Text => self.write_status_line(),
        }
        Ok(())
    }

    fn hide(&mut self) {
        if !self.is_shown() {
            return;
        }
        if self.module == SplashModule::Text {
            self.write(CLEAR_LINE.as_bytes());
        }
        self.mode = None;
        self.prompt_visible = false;
        debug!(theme = %self.name, "hid text splash");
    }

    fn update_status(&mut self, status: &str) {
        self.status = Some(status.to_string());
        if self.is_shown() {
            self.write_status_line();
        }
    }

    fn update_output(&mut self, output: &[u8]) {
        if self.module != SplashModule::Details {
            return;
        }
        if self.is_shown() {
            self.write(&to_crlf(output));
        } else {
            self.pending_output.extend_from_slice(output);
        }
    }

    fn display_message(&mut self, message: &str) {
        self.write(format!("{CLEAR_LINE}{message}\r\n").as_bytes());
        self.prompt_visible = false;
        self.write_status_line();
    }

    fn display_normal(&mut self) {
        if self.prompt_visible {
            self.prompt_visible = false;
            self.write(b"\r\n");
            self.write_status_line();
        }
    }

    fn display_password(&mut self, prompt: &str, bullets: usize) {
        let prompt = if prompt.is_empty() { "Password" } else { prompt };
        self.write_prompt(prompt, &"*".repeat(bullets));
    }

    fn display_question(&mut self, prompt: &str, entry_text: &str) {
        self.write_prompt(prompt, entry_text);
    }

    fn root_mounted(&mut self) {
        trace!(theme = %self.name, "root mounted");
    }

    fn become_idle(&mut self, event_loop: &mut dyn EventLoop) {
        // nothing animates, so every point is an idle point
        event_loop.defer(LoopEvent::SplashIdle);
    }
}
