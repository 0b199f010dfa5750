//! Test Doubles
//!
//! In-memory stand-ins for the kernel console, the event loop and the
//! platform collaborators. Every double shares its state through `Rc`, so a
//! test can keep a handle for inspection after moving the double into the
//! code under test.
//!
//! ```
//! use splash_core::test_utils::{FakeConsole, RecordingLoop};
//! use splash_core::Terminal;
//!
//! let console = FakeConsole::vt(2);
//! let mut event_loop = RecordingLoop::new();
//! let mut terminal = Terminal::new("tty2", console.opener());
//! terminal.open(&mut event_loop).unwrap();
//! assert!(terminal.is_active());
//! ```

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::termios::{
    ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg, Termios,
};

use crate::daemon::Mode;
use crate::error::{SessionError, SplashError, SwitchRootError};
use crate::event_loop::{EventLoop, FdInterest, LoopEvent, WatchId};
use crate::platform::{
    LogSession, PixelDisplay, Platform, Renderer, RendererHead, Splash, TextDisplay,
};
use crate::terminal::{
    ColorPalette, ConsoleMode, Terminal, TtyDevice, TtyOpener, VtAck, VtMode, WindowSize,
};

// =============================================================================
// Termios helpers
// =============================================================================

/// Line-oriented attributes like a freshly booted console
#[must_use]
pub fn cooked_termios() -> Termios {
    // SAFETY: termios is plain old data; all-zero is a valid value.
    let raw: libc::termios = unsafe { std::mem::zeroed() };
    let mut attributes = Termios::from(raw);
    attributes.input_flags = InputFlags::ICRNL | InputFlags::IXON;
    attributes.output_flags = OutputFlags::OPOST | OutputFlags::ONLCR;
    attributes.control_flags = ControlFlags::CS8 | ControlFlags::CREAD;
    attributes.local_flags =
        LocalFlags::ECHO | LocalFlags::ICANON | LocalFlags::ISIG | LocalFlags::IEXTEN;
    attributes
}

/// Whether two attribute sets have the same flags and control characters
#[must_use]
pub fn same_attributes(a: &Termios, b: &Termios) -> bool {
    a.input_flags == b.input_flags
        && a.output_flags == b.output_flags
        && a.control_flags == b.control_flags
        && a.local_flags == b.local_flags
        && a.control_chars == b.control_chars
}

// =============================================================================
// Fake console
// =============================================================================

/// A kernel call that changes console state
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KernelCall {
    /// tcsetattr; whether the new attributes are canonical
    SetAttributes {
        /// ICANON in the new attributes
        canonical: bool,
    },
    /// PIO_CMAP
    SetPalette,
    /// VT_ACTIVATE
    ActivateVt(u32),
    /// VT_DISALLOCATE
    DeallocateVt(u32),
    /// VT_SETMODE
    SetVtMode(VtMode),
    /// VT_RELDISP
    Acknowledge(VtAck),
    /// KDSETMODE
    SetConsoleMode(ConsoleMode),
}

#[derive(Debug)]
struct ConsoleState {
    vt_number: Option<u32>,
    active_vt: u32,
    attributes: Termios,
    palette: Option<ColorPalette>,
    window_size: Option<WindowSize>,
    vt_mode: VtMode,
    fail_open: bool,
    open_count: usize,
    calls: Vec<KernelCall>,
    written: Vec<u8>,
}

/// A simulated console device shared by every terminal opened on it
///
/// Reads are never recorded; only calls that change state show up in
/// [`FakeConsole::calls`].
#[derive(Clone, Debug)]
pub struct FakeConsole {
    state: Rc<RefCell<ConsoleState>>,
}

impl FakeConsole {
    fn with(vt_number: Option<u32>, active_vt: u32) -> Self {
        let is_vt = vt_number.is_some();
        Self {
            state: Rc::new(RefCell::new(ConsoleState {
                vt_number,
                active_vt,
                attributes: cooked_termios(),
                palette: is_vt.then(ColorPalette::default),
                window_size: is_vt.then_some(WindowSize {
                    rows: 25,
                    columns: 80,
                }),
                vt_mode: VtMode::Auto,
                fail_open: false,
                open_count: 0,
                calls: Vec::new(),
                written: Vec::new(),
            })),
        }
    }

    /// Virtual terminal `vt_number`, currently on screen
    #[must_use]
    pub fn vt(vt_number: u32) -> Self {
        Self::with(Some(vt_number), vt_number)
    }

    /// Virtual terminal `vt_number` while `active_vt` is on screen
    #[must_use]
    pub fn vt_behind(vt_number: u32, active_vt: u32) -> Self {
        Self::with(Some(vt_number), active_vt)
    }

    /// A serial console: no VT, no color map, no window size
    #[must_use]
    pub fn serial() -> Self {
        Self::with(None, 1)
    }

    /// Opener handing out devices backed by this console
    #[must_use]
    pub fn opener(&self) -> Box<dyn TtyOpener> {
        Box::new(FakeOpener {
            console: self.clone(),
        })
    }

    /// State-changing calls made so far
    #[must_use]
    pub fn calls(&self) -> Vec<KernelCall> {
        self.state.borrow().calls.clone()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    /// Make the next opens fail
    pub fn set_fail_open(&self, fail: bool) {
        self.state.borrow_mut().fail_open = fail;
    }

    /// Make the color map ioctls fail from now on
    pub fn remove_palette(&self) {
        self.state.borrow_mut().palette = None;
    }

    /// Change what TIOCGWINSZ reports; `None` makes it fail
    pub fn set_window_size(&self, size: Option<WindowSize>) {
        self.state.borrow_mut().window_size = size;
    }

    /// Replace the line discipline settings
    pub fn set_attributes(&self, attributes: Termios) {
        self.state.borrow_mut().attributes = attributes;
    }

    /// Current line discipline settings
    #[must_use]
    pub fn attributes(&self) -> Termios {
        self.state.borrow().attributes.clone()
    }

    /// Whether input is line oriented
    #[must_use]
    pub fn is_canonical(&self) -> bool {
        self.state
            .borrow()
            .attributes
            .local_flags
            .contains(LocalFlags::ICANON)
    }

    /// Color map held by the device, if it has one
    #[must_use]
    pub fn palette(&self) -> Option<ColorPalette> {
        self.state.borrow().palette
    }

    /// VT on screen
    #[must_use]
    pub fn active_vt(&self) -> u32 {
        self.state.borrow().active_vt
    }

    /// Put another VT on screen, as a user switching would
    pub fn set_active_vt(&self, vt_number: u32) {
        self.state.borrow_mut().active_vt = vt_number;
    }

    /// Switch mode last set
    #[must_use]
    pub fn vt_mode(&self) -> VtMode {
        self.state.borrow().vt_mode
    }

    /// Number of successful opens
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.state.borrow().open_count
    }

    /// Bytes written to the console
    #[must_use]
    pub fn written(&self) -> Vec<u8> {
        self.state.borrow().written.clone()
    }

    fn record(&self, call: KernelCall) {
        self.state.borrow_mut().calls.push(call);
    }
}

struct FakeOpener {
    console: FakeConsole,
}

impl TtyOpener for FakeOpener {
    fn open(&mut self, path: &Path) -> io::Result<Box<dyn TtyDevice>> {
        let mut state = self.console.state.borrow_mut();
        if state.fail_open {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is gone", path.display()),
            ));
        }
        state.open_count += 1;
        let fd = RawFd::try_from(100 + state.open_count).unwrap_or(RawFd::MAX);
        Ok(Box::new(FakeTty {
            console: self.console.clone(),
            fd,
        }))
    }
}

/// One open of a [`FakeConsole`]
#[derive(Debug)]
pub struct FakeTty {
    console: FakeConsole,
    fd: RawFd,
}

impl TtyDevice for FakeTty {
    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    fn device_number(&self) -> io::Result<Option<(u64, u64)>> {
        let minor = self
            .console
            .state
            .borrow()
            .vt_number
            .map_or(64, u64::from);
        Ok(Some((crate::terminal::device::TTY_MAJOR, minor)))
    }

    fn attributes(&self) -> nix::Result<Termios> {
        Ok(self.console.attributes())
    }

    fn set_attributes(&self, _when: SetArg, attributes: &Termios) -> nix::Result<()> {
        let canonical = attributes.local_flags.contains(LocalFlags::ICANON);
        self.console.state.borrow_mut().attributes = attributes.clone();
        self.console.record(KernelCall::SetAttributes { canonical });
        Ok(())
    }

    fn window_size(&self) -> nix::Result<WindowSize> {
        self.console.state.borrow().window_size.ok_or(Errno::ENOTTY)
    }

    fn color_palette(&self) -> nix::Result<ColorPalette> {
        self.console.state.borrow().palette.ok_or(Errno::EINVAL)
    }

    fn set_color_palette(&self, palette: &ColorPalette) -> nix::Result<()> {
        let mut state = self.console.state.borrow_mut();
        if state.palette.is_none() {
            return Err(Errno::EINVAL);
        }
        state.palette = Some(*palette);
        state.calls.push(KernelCall::SetPalette);
        Ok(())
    }

    fn active_vt(&self) -> nix::Result<u32> {
        let state = self.console.state.borrow();
        if state.vt_number.is_none() {
            return Err(Errno::ENOTTY);
        }
        Ok(state.active_vt)
    }

    fn activate_vt(&self, vt_number: u32) -> nix::Result<()> {
        let mut state = self.console.state.borrow_mut();
        state.active_vt = vt_number;
        state.calls.push(KernelCall::ActivateVt(vt_number));
        Ok(())
    }

    fn deallocate_vt(&self, vt_number: u32) -> nix::Result<()> {
        self.console.record(KernelCall::DeallocateVt(vt_number));
        Ok(())
    }

    fn set_vt_mode(&self, mode: VtMode) -> nix::Result<()> {
        let mut state = self.console.state.borrow_mut();
        state.vt_mode = mode;
        state.calls.push(KernelCall::SetVtMode(mode));
        Ok(())
    }

    fn acknowledge_vt(&self, ack: VtAck) -> nix::Result<()> {
        self.console.record(KernelCall::Acknowledge(ack));
        Ok(())
    }

    fn set_console_mode(&self, mode: ConsoleMode) -> nix::Result<()> {
        self.console.record(KernelCall::SetConsoleMode(mode));
        Ok(())
    }

    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        self.console
            .state
            .borrow_mut()
            .written
            .extend_from_slice(bytes);
        Ok(())
    }
}

// =============================================================================
// Recording event loop
// =============================================================================

/// Event loop that records registrations and queues deferred events
#[derive(Debug, Default)]
pub struct RecordingLoop {
    signals: Vec<Signal>,
    watches: BTreeMap<WatchId, (RawFd, FdInterest)>,
    next_watch: u64,
    deferred: VecDeque<LoopEvent>,
    exit_code: Option<i32>,
}

impl RecordingLoop {
    /// Create an empty loop
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `signal` is being delivered
    #[must_use]
    pub fn is_watching_signal(&self, signal: Signal) -> bool {
        self.signals.contains(&signal)
    }

    /// Number of live descriptor watches
    #[must_use]
    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }

    /// Live watches with `interest`, oldest first
    #[must_use]
    pub fn watches_for_interest(&self, interest: FdInterest) -> Vec<WatchId> {
        self.watches
            .iter()
            .filter(|(_, (_, watched))| *watched == interest)
            .map(|(watch, _)| *watch)
            .collect()
    }

    /// Descriptor behind a live watch
    #[must_use]
    pub fn fd_for(&self, watch: WatchId) -> Option<RawFd> {
        self.watches.get(&watch).map(|(fd, _)| *fd)
    }

    /// Forget a watch as the loop does when its descriptor hangs up
    pub fn drop_watch(&mut self, watch: WatchId) {
        self.watches.remove(&watch);
    }

    /// Next deferred event
    pub fn pop_deferred(&mut self) -> Option<LoopEvent> {
        self.deferred.pop_front()
    }

    /// Number of deferred events waiting
    #[must_use]
    pub fn deferred_count(&self) -> usize {
        self.deferred.len()
    }

    /// Exit code, once asked to exit
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }
}

impl EventLoop for RecordingLoop {
    fn watch_signal(&mut self, signal: Signal) {
        if !self.signals.contains(&signal) {
            self.signals.push(signal);
        }
    }

    fn stop_watching_signal(&mut self, signal: Signal) {
        self.signals.retain(|watched| *watched != signal);
    }

    fn watch_fd(&mut self, fd: RawFd, interest: FdInterest) -> WatchId {
        self.next_watch += 1;
        let watch = WatchId(self.next_watch);
        self.watches.insert(watch, (fd, interest));
        watch
    }

    fn stop_watching_fd(&mut self, watch: WatchId) {
        self.watches.remove(&watch);
    }

    fn defer(&mut self, event: LoopEvent) {
        self.deferred.push_back(event);
    }

    fn exit(&mut self, code: i32) {
        self.exit_code = Some(code);
    }
}

// =============================================================================
// Fake platform
// =============================================================================

#[derive(Debug)]
struct PlatformState {
    journal: Vec<String>,
    broken_themes: Vec<String>,
    show_fails: bool,
    auto_idle: bool,
    renderer_heads: Option<Vec<RendererHead>>,
    session_fails: bool,
    session_fd: Option<RawFd>,
    session_log: Vec<u8>,
}

/// Platform whose collaborators record into one shared journal
///
/// Splash entries are prefixed with the theme name (`details: show boot`),
/// renderer entries with `renderer:` and session entries with `session:`.
#[derive(Clone, Debug)]
pub struct FakePlatform {
    console: FakeConsole,
    state: Rc<RefCell<PlatformState>>,
}

impl FakePlatform {
    /// Platform whose terminals open `console`
    ///
    /// Every theme loads, no renderer is available, and splashes become
    /// idle as soon as they are asked to.
    #[must_use]
    pub fn new(console: FakeConsole) -> Self {
        Self {
            console,
            state: Rc::new(RefCell::new(PlatformState {
                journal: Vec::new(),
                broken_themes: Vec::new(),
                show_fails: false,
                auto_idle: true,
                renderer_heads: None,
                session_fails: false,
                session_fd: Some(300),
                session_log: Vec::new(),
            })),
        }
    }

    /// Boxed handle for [`crate::Daemon::new`]
    #[must_use]
    pub fn boxed(&self) -> Box<dyn Platform> {
        Box::new(self.clone())
    }

    /// Console behind every terminal
    #[must_use]
    pub fn console(&self) -> &FakeConsole {
        &self.console
    }

    /// Everything recorded so far
    #[must_use]
    pub fn journal(&self) -> Vec<String> {
        self.state.borrow().journal.clone()
    }

    /// Number of journal entries equal to `entry`
    #[must_use]
    pub fn count(&self, entry: &str) -> usize {
        self.state
            .borrow()
            .journal
            .iter()
            .filter(|recorded| *recorded == entry)
            .count()
    }

    /// Forget the journal
    pub fn clear_journal(&self) {
        self.state.borrow_mut().journal.clear();
    }

    /// Make theme `name` fail to load
    pub fn break_theme(&self, name: &str) {
        self.state.borrow_mut().broken_themes.push(name.to_string());
    }

    /// Make every splash fail to show
    pub fn set_show_fails(&self, fails: bool) {
        self.state.borrow_mut().show_fails = fails;
    }

    /// Whether splashes defer [`LoopEvent::SplashIdle`] when asked to idle
    pub fn set_auto_idle(&self, auto_idle: bool) {
        self.state.borrow_mut().auto_idle = auto_idle;
    }

    /// Offer a renderer with `heads`; `None` makes opening fail
    pub fn set_renderer(&self, heads: Option<Vec<RendererHead>>) {
        self.state.borrow_mut().renderer_heads = heads;
    }

    /// Make session attach fail
    pub fn set_session_fails(&self, fails: bool) {
        self.state.borrow_mut().session_fails = fails;
    }

    /// Output recorded by the session's log
    #[must_use]
    pub fn session_log(&self) -> Vec<u8> {
        self.state.borrow().session_log.clone()
    }

    fn record(&self, entry: String) {
        self.state.borrow_mut().journal.push(entry);
    }
}

impl Platform for FakePlatform {
    fn new_terminal(&mut self, tty: &str) -> Terminal {
        Terminal::new(tty, self.console.opener())
    }

    fn open_renderer(&mut self, _terminal: &Terminal) -> Option<Box<dyn Renderer>> {
        let heads = self.state.borrow().renderer_heads.clone()?;
        self.record("renderer: open".to_string());
        Some(Box::new(FakeRenderer {
            platform: self.clone(),
            heads,
        }))
    }

    fn load_splash(
        &mut self,
        theme: &Path,
        _boot_output: &[u8],
    ) -> Result<Box<dyn Splash>, SplashError> {
        let name = theme
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        if self.state.borrow().broken_themes.contains(&name) {
            return Err(SplashError::Load {
                path: theme.to_path_buf(),
                reason: "broken theme".to_string(),
            });
        }
        self.record(format!("{name}: load"));
        Ok(Box::new(FakeSplash {
            platform: self.clone(),
            name,
            theme: theme.to_path_buf(),
        }))
    }

    fn new_session(&mut self) -> Box<dyn LogSession> {
        Box::new(FakeSession {
            platform: self.clone(),
        })
    }

    fn switch_root(&mut self, path: &Path) -> Result<(), SwitchRootError> {
        self.record(format!("root: switch {}", path.display()));
        Ok(())
    }
}

struct FakeSplash {
    platform: FakePlatform,
    name: String,
    theme: PathBuf,
}

impl FakeSplash {
    fn record(&self, what: &str) {
        self.platform.record(format!("{}: {what}", self.name));
    }
}

impl Splash for FakeSplash {
    fn theme(&self) -> &Path {
        &self.theme
    }

    fn add_pixel_display(&mut self, display: &PixelDisplay) {
        self.record(&format!("pixel display {}", display.head.index));
    }

    fn add_text_display(&mut self, display: &TextDisplay) {
        self.record(&format!("text display {}", display.tty.display()));
    }

    fn show(&mut self, mode: Mode) -> Result<(), SplashError> {
        if self.platform.state.borrow().show_fails {
            return Err(SplashError::Show("refused".to_string()));
        }
        self.record(&format!("show {mode}"));
        Ok(())
    }

    fn hide(&mut self) {
        self.record("hide");
    }

    fn update_status(&mut self, status: &str) {
        self.record(&format!("status {status}"));
    }

    fn update_output(&mut self, output: &[u8]) {
        self.record(&format!("output {}", String::from_utf8_lossy(output)));
    }

    fn display_message(&mut self, message: &str) {
        self.record(&format!("message {message}"));
    }

    fn display_normal(&mut self) {
        self.record("normal");
    }

    fn display_password(&mut self, prompt: &str, bullets: usize) {
        self.record(&format!("password {prompt} {bullets}"));
    }

    fn display_question(&mut self, prompt: &str, entry_text: &str) {
        self.record(&format!("question {prompt} {entry_text}"));
    }

    fn root_mounted(&mut self) {
        self.record("root mounted");
    }

    fn become_idle(&mut self, event_loop: &mut dyn EventLoop) {
        self.record("become idle");
        if self.platform.state.borrow().auto_idle {
            event_loop.defer(LoopEvent::SplashIdle);
        }
    }
}

struct FakeRenderer {
    platform: FakePlatform,
    heads: Vec<RendererHead>,
}

impl Renderer for FakeRenderer {
    fn heads(&self) -> Vec<RendererHead> {
        self.heads.clone()
    }

    fn activate(&mut self) {
        self.platform.record("renderer: activate".to_string());
    }

    fn deactivate(&mut self) {
        self.platform.record("renderer: deactivate".to_string());
    }

    fn close(&mut self) {
        self.platform.record("renderer: close".to_string());
    }

    fn input_fd(&self) -> Option<RawFd> {
        Some(200)
    }
}

struct FakeSession {
    platform: FakePlatform,
}

impl LogSession for FakeSession {
    fn attach(&mut self, redirect: bool) -> Result<Option<RawFd>, SessionError> {
        let (fails, fd) = {
            let state = self.platform.state.borrow();
            (state.session_fails, state.session_fd)
        };
        if fails {
            return Err(SessionError::Attach(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "no console",
            )));
        }
        self.platform
            .record(format!("session: attach redirect={redirect}"));
        Ok(fd)
    }

    fn detach(&mut self) {
        self.platform.record("session: detach".to_string());
    }

    fn open_log(&mut self, path: &Path) -> Result<(), SessionError> {
        self.platform
            .record(format!("session: open log {}", path.display()));
        Ok(())
    }

    fn close_log(&mut self) {
        self.platform.record("session: close log".to_string());
    }

    fn log_output(&mut self, output: &[u8]) {
        self.platform
            .state
            .borrow_mut()
            .session_log
            .extend_from_slice(output);
    }
}
