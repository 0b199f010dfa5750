//! Keyboard Input
//!
//! Raw bytes from the console (or from the renderer's input device) are
//! split into [`KeyEvent`]s. The parser keeps its own line buffer so that
//! [`KeyEvent::Enter`] can carry the line typed since the last Enter, and
//! so that Ctrl-U can erase it one character at a time.
//!
//! Multi-byte UTF-8 characters are never split: an incomplete trailing
//! sequence is held back until the rest of it arrives.

use std::os::unix::io::RawFd;

use tracing::{debug, trace};

use crate::event_loop::{EventLoop, FdInterest, WatchId};

/// Longest UTF-8 encoded character
pub const MAX_CHARACTER_SIZE: usize = 4;

const KEY_ESCAPE: u8 = 0x1b;
const KEY_DELETE: u8 = 0x7f;
const KEY_BACKSPACE: u8 = 0x08;
const KEY_CTRL_U: u8 = 0x15;

/// A decoded keystroke
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyEvent {
    /// One character (possibly a control byte such as Ctrl-C)
    Input(Vec<u8>),
    /// Erase the previous character
    Backspace,
    /// Return pressed; carries the line typed since the previous Enter
    Enter(String),
    /// Escape pressed
    Escape,
}

/// Length of the UTF-8 character introduced by `lead`, or 0 if `lead`
/// cannot start a character
#[must_use]
pub fn character_len(lead: u8) -> usize {
    match lead {
        0x00..=0x7f => 1,
        0xc0..=0xdf => 2,
        0xe0..=0xef => 3,
        0xf0..=0xf7 => 4,
        _ => 0,
    }
}

/// Number of bytes occupied by the last character of `bytes`
///
/// Scans backwards over at most [`MAX_CHARACTER_SIZE`] bytes for a lead byte
/// whose character reaches the end of the buffer. A trailing byte that
/// belongs to no character is reported as a single byte.
#[must_use]
pub fn last_character_len(bytes: &[u8]) -> usize {
    let size = bytes.len();
    let mut window = size.min(MAX_CHARACTER_SIZE);

    while window > 0 {
        let len = character_len(bytes[size - window]);
        if len >= window {
            return window;
        }
        window -= len.max(1);
    }

    usize::from(size > 0)
}

/// Number of characters in `bytes`, counting stray bytes as one each
#[must_use]
pub fn character_count(bytes: &[u8]) -> usize {
    let mut count = 0;
    let mut at = 0;
    while at < bytes.len() {
        at += character_len(bytes[at]).max(1);
        count += 1;
    }
    count
}

// =============================================================================
// Parser
// =============================================================================

/// Splits raw bytes into key events
#[derive(Debug, Default)]
pub struct KeyParser {
    pending: Vec<u8>,
    line: Vec<u8>,
}

impl KeyParser {
    /// Create an empty parser
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes read from the device
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<KeyEvent> {
        self.pending.extend_from_slice(bytes);

        let mut events = Vec::new();
        let mut at = 0;
        while at < self.pending.len() {
            match self.pending[at] {
                KEY_ESCAPE => events.push(KeyEvent::Escape),
                KEY_DELETE | KEY_BACKSPACE => {
                    let len = last_character_len(&self.line);
                    self.line.truncate(self.line.len() - len);
                    events.push(KeyEvent::Backspace);
                }
                KEY_CTRL_U => {
                    for _ in 0..character_count(&self.line) {
                        events.push(KeyEvent::Backspace);
                    }
                    self.line.clear();
                }
                b'\r' | b'\n' => {
                    let line = String::from_utf8_lossy(&self.line).into_owned();
                    self.line.clear();
                    events.push(KeyEvent::Enter(line));
                }
                lead => {
                    let len = character_len(lead).max(1);
                    if at + len > self.pending.len() {
                        break;
                    }
                    let character = self.pending[at..at + len].to_vec();
                    self.line.extend_from_slice(&character);
                    events.push(KeyEvent::Input(character));
                    at += len;
                    continue;
                }
            }
            at += 1;
        }

        self.pending.drain(..at);
        events
    }

    /// Forget buffered bytes and the current line
    pub fn reset(&mut self) {
        self.pending.clear();
        self.line.clear();
    }
}

// =============================================================================
// Keyboard
// =============================================================================

/// Where keystrokes are read from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyboardSource {
    /// The console terminal
    Terminal,
    /// The renderer's input device
    Renderer,
}

/// A keystroke source watched through the event loop
#[derive(Debug)]
pub struct Keyboard {
    source: KeyboardSource,
    watch: Option<WatchId>,
    parser: KeyParser,
}

impl Keyboard {
    /// Keyboard reading from a console terminal
    #[must_use]
    pub fn for_terminal() -> Self {
        Self::new(KeyboardSource::Terminal)
    }

    /// Keyboard reading from the renderer's input device
    #[must_use]
    pub fn for_renderer() -> Self {
        Self::new(KeyboardSource::Renderer)
    }

    fn new(source: KeyboardSource) -> Self {
        Self {
            source,
            watch: None,
            parser: KeyParser::new(),
        }
    }

    /// Where this keyboard reads from
    #[must_use]
    pub fn source(&self) -> KeyboardSource {
        self.source
    }

    /// Whether input is currently being watched
    #[must_use]
    pub fn is_watching(&self) -> bool {
        self.watch.is_some()
    }

    /// Whether `watch` is this keyboard's input watch
    #[must_use]
    pub fn owns(&self, watch: WatchId) -> bool {
        self.watch == Some(watch)
    }

    /// Start reading keystrokes from `fd`
    ///
    /// Returns `false` if there is no descriptor to watch. Already watching
    /// keyboards keep their existing watch.
    pub fn watch_for_input(&mut self, event_loop: &mut dyn EventLoop, fd: Option<RawFd>) -> bool {
        if self.watch.is_some() {
            return true;
        }
        let Some(fd) = fd else {
            debug!(source = ?self.source, "no input device to watch");
            return false;
        };
        self.watch = Some(event_loop.watch_fd(fd, FdInterest::Input));
        trace!(source = ?self.source, fd, "listening for keystrokes");
        true
    }

    /// Stop reading keystrokes
    pub fn stop_watching_for_input(&mut self, event_loop: &mut dyn EventLoop) {
        if let Some(watch) = self.watch.take() {
            event_loop.stop_watching_fd(watch);
            self.parser.reset();
        }
    }

    /// Forget a watch the loop reported as hung up
    pub fn watch_closed(&mut self, watch: WatchId) -> bool {
        if self.owns(watch) {
            self.watch = None;
            self.parser.reset();
            true
        } else {
            false
        }
    }

    /// Decode bytes read on the input watch
    pub fn process(&mut self, bytes: &[u8]) -> Vec<KeyEvent> {
        self.parser.feed(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingLoop;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parser_splits_characters() {
        let mut parser = KeyParser::new();
        let events = parser.feed("aé\u{3}".as_bytes());
        assert_eq!(
            events,
            vec![
                KeyEvent::Input(b"a".to_vec()),
                KeyEvent::Input("é".as_bytes().to_vec()),
                KeyEvent::Input(vec![3]),
            ]
        );
    }

    #[test]
    fn test_parser_holds_incomplete_sequence() {
        let mut parser = KeyParser::new();
        let euro = "€".as_bytes();

        assert!(parser.feed(&euro[..2]).is_empty());
        assert_eq!(parser.feed(&euro[2..]), vec![KeyEvent::Input(euro.to_vec())]);
    }

    #[test]
    fn test_enter_carries_line() {
        let mut parser = KeyParser::new();
        let events = parser.feed(b"ok\x7fk\r");
        assert_eq!(events.last(), Some(&KeyEvent::Enter("ok".to_string())));

        let events = parser.feed(b"\n");
        assert_eq!(events, vec![KeyEvent::Enter(String::new())]);
    }

    #[test]
    fn test_control_keys() {
        let mut parser = KeyParser::new();
        assert_eq!(parser.feed(&[0x1b]), vec![KeyEvent::Escape]);
        assert_eq!(parser.feed(&[0x08]), vec![KeyEvent::Backspace]);
    }

    #[test]
    fn test_ctrl_u_erases_line_by_character() {
        let mut parser = KeyParser::new();
        parser.feed("hé".as_bytes());
        assert_eq!(
            parser.feed(&[0x15]),
            vec![KeyEvent::Backspace, KeyEvent::Backspace]
        );
        assert_eq!(parser.feed(b"\r"), vec![KeyEvent::Enter(String::new())]);
    }

    #[test]
    fn test_last_character_len() {
        assert_eq!(last_character_len(b""), 0);
        assert_eq!(last_character_len(b"ab"), 1);
        assert_eq!(last_character_len("aé".as_bytes()), 2);
        assert_eq!(last_character_len("x€".as_bytes()), 3);
        assert_eq!(last_character_len("😀".as_bytes()), 4);
        // stray continuation byte
        assert_eq!(last_character_len(&[b'a', 0x80]), 1);
    }

    #[test]
    fn test_character_count() {
        assert_eq!(character_count("pässwörd".as_bytes()), 8);
        assert_eq!(character_count(&[0x80, 0x80]), 2);
    }

    #[test]
    fn test_keyboard_watch_lifecycle() {
        let mut event_loop = RecordingLoop::new();
        let mut keyboard = Keyboard::for_terminal();

        assert!(!keyboard.watch_for_input(&mut event_loop, None));
        assert!(keyboard.watch_for_input(&mut event_loop, Some(5)));
        assert!(keyboard.watch_for_input(&mut event_loop, Some(5)));
        assert_eq!(event_loop.watch_count(), 1);

        keyboard.stop_watching_for_input(&mut event_loop);
        assert!(!keyboard.is_watching());
        assert_eq!(event_loop.watch_count(), 0);
    }
}
