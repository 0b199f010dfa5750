//! Kernel Command Line Policy
//!
//! Boot behaviour that the kernel command line controls: whether a splash
//! is wanted at all, which kind, which consoles carry it, and whether boot
//! output is logged. The binary reads `/proc/cmdline` once at startup; this
//! module only interprets the text.
//!
//! | Option                      | Effect                                        |
//! |-----------------------------|-----------------------------------------------|
//! | `rhgb`, `splash`            | show the graphical (default) splash           |
//! | `splash=verbose`            | show details instead                          |
//! | `single`, `1`, `s`, `S`, `-s` | single user: details only                   |
//! | `console=NAME`              | put the splash on NAME; details only          |
//! | `init=PATH`                 | ignore show-splash requests                   |
//! | `plymouth:force-splash`     | honour show-splash requests despite `init=`   |
//! | `plymouth:splash=THEME`     | override the configured theme                 |
//! | `plymouth:nolog`            | don't redirect console output to the boot log |
//! | `plymouth:debug[=file:PATH]`| verbose tracing                               |

use std::path::PathBuf;

use crate::daemon::Mode;

const SINGLE_USER_TOKENS: [&str; 5] = ["single", "1", "s", "S", "-s"];

/// The kernel command line
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KernelCommandLine {
    text: String,
}

/// Debug settings requested on the command line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DebugRequest {
    /// File to copy trace output to
    pub file: Option<PathBuf>,
}

impl KernelCommandLine {
    /// Wrap command line text
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Raw text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    fn has_option(&self, option: &str) -> bool {
        self.text.starts_with(option) || self.text.contains(&format!(" {option}"))
    }

    fn has_word(&self, word: &str) -> bool {
        self.text.starts_with(&format!("{word} "))
            || self.text.contains(&format!(" {word} "))
            || self.text.contains(&format!(" {word}\n"))
    }

    fn value_of(&self, key: &str) -> Option<&str> {
        let at = self.text.find(key)?;
        let rest = &self.text[at + key.len()..];
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        Some(&rest[..end])
    }

    /// Whether show-splash requests should be turned into a teardown
    ///
    /// Only boot mode is affected: an `init=` override means the splash
    /// would sit over an unusual init, unless `plymouth:force-splash` says
    /// otherwise.
    #[must_use]
    pub fn should_ignore_show_splash_calls(&self, mode: Mode) -> bool {
        if mode != Mode::Boot || self.has_option("plymouth:force-splash") {
            return false;
        }
        self.has_option("init=")
    }

    /// Whether the default (graphical) splash is wanted over details
    ///
    /// Consoles named with `console=` and single user boots always get
    /// details.
    #[must_use]
    pub fn should_show_default_splash(&self, has_console_tty: bool) -> bool {
        if has_console_tty {
            return false;
        }
        if SINGLE_USER_TOKENS.iter().any(|token| self.has_word(token)) {
            return false;
        }
        self.text.contains("rhgb")
            || (self.text.contains("splash") && !self.text.contains("splash=verbose"))
    }

    /// Every `console=` device, in command line order
    ///
    /// `tty0` names whichever VT is current and is replaced by `default_tty`.
    #[must_use]
    pub fn consoles(&self, default_tty: &str) -> Vec<String> {
        const KEY: &str = " console=";
        let mut consoles = Vec::new();
        let mut rest = self.text.as_str();

        while let Some(at) = rest.find(KEY) {
            rest = &rest[at + KEY.len()..];
            let end = rest
                .find(|c: char| matches!(c, ' ' | '\n' | '\t' | '\x0b' | ','))
                .unwrap_or(rest.len());
            let name = &rest[..end];
            rest = &rest[end..];

            if name == "tty0" || name == "/dev/tty0" {
                consoles.push(default_tty.to_string());
            } else {
                consoles.push(name.to_string());
            }
        }
        consoles
    }

    /// The last `console=` device, which the kernel uses for `/dev/console`
    #[must_use]
    pub fn console_tty(&self, default_tty: &str) -> Option<String> {
        self.consoles(default_tty).pop()
    }

    /// `plymouth:nolog`
    #[must_use]
    pub fn no_boot_log(&self) -> bool {
        self.has_option("plymouth:nolog")
    }

    /// `plymouth:debug` or `plymouth:debug=file:PATH`
    #[must_use]
    pub fn debug(&self) -> Option<DebugRequest> {
        if let Some(path) = self.value_of("plymouth:debug=file:") {
            return Some(DebugRequest {
                file: Some(PathBuf::from(path)),
            });
        }
        self.has_option("plymouth:debug")
            .then_some(DebugRequest { file: None })
    }

    /// Theme name from `plymouth:splash=THEME`
    #[must_use]
    pub fn splash_override(&self) -> Option<&str> {
        self.value_of("plymouth:splash=")
            .filter(|name| !name.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cmdline(text: &str) -> KernelCommandLine {
        KernelCommandLine::new(text)
    }

    #[test]
    fn test_init_override_ignores_show_splash() {
        assert!(cmdline("ro init=/bin/sh").should_ignore_show_splash_calls(Mode::Boot));
        assert!(cmdline("init=/bin/sh quiet").should_ignore_show_splash_calls(Mode::Boot));
        assert!(!cmdline("ro init=/bin/sh").should_ignore_show_splash_calls(Mode::Shutdown));
        assert!(!cmdline("ro init=/bin/sh plymouth:force-splash")
            .should_ignore_show_splash_calls(Mode::Boot));
        assert!(!cmdline("ro quiet rhgb").should_ignore_show_splash_calls(Mode::Boot));
    }

    #[test]
    fn test_default_splash_selection() {
        assert!(cmdline("ro quiet rhgb").should_show_default_splash(false));
        assert!(cmdline("ro quiet splash").should_show_default_splash(false));
        assert!(!cmdline("ro quiet splash=verbose").should_show_default_splash(false));
        assert!(!cmdline("ro quiet").should_show_default_splash(false));
        assert!(!cmdline("ro rhgb").should_show_default_splash(true));
    }

    #[test]
    fn test_single_user_shows_details() {
        assert!(!cmdline("ro rhgb single quiet").should_show_default_splash(false));
        assert!(!cmdline("ro rhgb S\n").should_show_default_splash(false));
        assert!(!cmdline("1 ro rhgb").should_show_default_splash(false));
        assert!(!cmdline("ro -s rhgb").should_show_default_splash(false));
        // only whole words count
        assert!(cmdline("ro rhgb root=/dev/sda1 quiet").should_show_default_splash(false));
    }

    #[test]
    fn test_consoles() {
        let line = cmdline("ro console=ttyS0,115200n8 console=tty0 quiet");
        assert_eq!(line.consoles("tty1"), vec!["ttyS0".to_string(), "tty1".to_string()]);
        assert_eq!(line.console_tty("tty1"), Some("tty1".to_string()));
        assert!(cmdline("ro quiet").consoles("tty1").is_empty());
    }

    #[test]
    fn test_logging_and_debug_options() {
        assert!(cmdline("ro plymouth:nolog").no_boot_log());
        assert!(!cmdline("ro").no_boot_log());

        assert_eq!(
            cmdline("ro plymouth:debug").debug(),
            Some(DebugRequest { file: None })
        );
        assert_eq!(
            cmdline("ro plymouth:debug=file:/tmp/trace.log quiet").debug(),
            Some(DebugRequest {
                file: Some(PathBuf::from("/tmp/trace.log"))
            })
        );
        assert_eq!(cmdline("ro quiet").debug(), None);
    }

    #[test]
    fn test_splash_override() {
        assert_eq!(
            cmdline("ro plymouth:splash=spinner quiet").splash_override(),
            Some("spinner")
        );
        assert_eq!(cmdline("ro quiet").splash_override(), None);
    }
}
