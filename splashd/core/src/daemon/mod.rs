//! Daemon Lifecycle State Machine
//!
//! One [`Daemon`] value owns everything the splash needs for the lifetime of
//! the process: the console [`Terminal`], the keyboard, the displays, the
//! loaded [`Splash`], the pixel [`Renderer`], the boot log session, and the
//! queues of client requests waiting on the user.
//!
//! # States
//!
//! ```text
//!                     ShowSplash                 Escape
//!   ┌──────────┐ ─────────────────► ┌─────────┐ ◄──────► ┌──────────┐
//!   │ no splash│                    │ default │          │ detailed │
//!   └──────────┘ ◄───────────────── └────┬────┘          └────┬─────┘
//!                     HideSplash         │ Deactivate         │
//!                                        ▼                    ▼
//!                                 ┌──────────────┐  splash  ┌──────────┐
//!                                 │ deactivating │ ───────► │ inactive │
//!                                 └──────────────┘   idle   └────┬─────┘
//!                                                                │ Reactivate
//!                                                                ▼
//!                                                           (previous view)
//!
//!   any state ── Quit ──► quitting ── splash idle ──► terminated (loop exit)
//! ```
//!
//! Teardown that has to wait for the splash (deactivate, quit) asks the
//! splash to become idle and returns; the work happens when
//! [`LoopEvent::SplashIdle`] is dispatched. When both are pending, quit wins
//! and the deactivate trigger is pulled as the daemon exits.

mod request;

pub use request::{BootRequest, DaemonOptions, Mode, BOOT_TTY, SHUTDOWN_TTY};

use std::cell::Cell;
use std::fmt;
use std::fs;
use std::io;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::{debug, error, info, trace, warn};

use crate::entry::{Answer, EntryKind, EntryQueue, KeystrokeWatches};
use crate::error::SessionError;
use crate::event_loop::{EventLoop, FdInterest, LoopEvent, WatchId};
use crate::keyboard::{KeyEvent, Keyboard, KeyboardSource};
use crate::platform::{LogSession, PixelDisplay, Platform, Renderer, Splash, TextDisplay};
use crate::progress::Progress;
use crate::terminal::{ConsoleMode, Terminal, VtChange, VtChangeListener};
use crate::trigger::Trigger;

const KEY_CTRL_C: u8 = 0x03;
const KEY_CTRL_D: u8 = 0x04;

const DETAILS_THEME: &str = "details";
const TEXT_THEME: &str = "text";

/// Flags a redraw once the daemon's VT is handed back
struct RedrawOnAcquire {
    pending: Rc<Cell<bool>>,
}

impl VtChangeListener for RedrawOnAcquire {
    fn vt_changed(&self, change: VtChange) {
        if change.active {
            self.pending.set(true);
        }
    }
}

/// The boot splash daemon
pub struct Daemon {
    options: DaemonOptions,
    platform: Box<dyn Platform>,
    kernel_console_tty: Option<String>,

    pixel_displays: Vec<PixelDisplay>,
    text_displays: Vec<TextDisplay>,
    keyboard: Option<Keyboard>,
    splash: Option<Box<dyn Splash>>,
    terminal: Option<Terminal>,
    renderer: Option<Box<dyn Renderer>>,
    session: Option<Box<dyn LogSession>>,
    session_watch: Option<WatchId>,

    boot_buffer: Vec<u8>,
    progress: Progress,

    keystroke_watches: KeystrokeWatches,
    entries: EntryQueue,

    deactivate_trigger: Option<Trigger>,
    quit_trigger: Option<Trigger>,
    should_retain_splash: bool,

    is_inactive: bool,
    showing_details: bool,
    system_initialized: bool,
    is_attached: bool,
    is_redirected: bool,
    should_be_attached: bool,
    number_of_errors: u32,

    vt_reacquired: Rc<Cell<bool>>,
    vt_listener: Rc<dyn VtChangeListener>,
}

impl Daemon {
    /// Create the daemon; nothing is opened until a client asks for it
    #[must_use]
    pub fn new(options: DaemonOptions, platform: Box<dyn Platform>) -> Self {
        let kernel_console_tty = options
            .kernel_command_line
            .console_tty(&options.default_tty);
        if let Some(tty) = &kernel_console_tty {
            debug!(tty = %tty, "kernel console configured");
        }

        let mut progress = Progress::new();
        progress.load_cache(&options.cache_file());

        let vt_reacquired = Rc::new(Cell::new(false));
        let vt_listener: Rc<dyn VtChangeListener> = Rc::new(RedrawOnAcquire {
            pending: Rc::clone(&vt_reacquired),
        });

        Self {
            options,
            platform,
            kernel_console_tty,
            pixel_displays: Vec::new(),
            text_displays: Vec::new(),
            keyboard: None,
            splash: None,
            terminal: None,
            renderer: None,
            session: None,
            session_watch: None,
            boot_buffer: Vec::new(),
            progress,
            keystroke_watches: KeystrokeWatches::new(),
            entries: EntryQueue::new(),
            deactivate_trigger: None,
            quit_trigger: None,
            should_retain_splash: false,
            is_inactive: false,
            showing_details: false,
            system_initialized: false,
            is_attached: false,
            is_redirected: false,
            should_be_attached: false,
            number_of_errors: 0,
            vt_reacquired,
            vt_listener,
        }
    }

    /// Attach the boot log session if configured to
    ///
    /// # Errors
    ///
    /// Returns the session error if console output cannot be captured.
    pub fn start(&mut self, event_loop: &mut dyn EventLoop) -> Result<(), SessionError> {
        info!(mode = %self.options.mode, tty = %self.options.default_tty, "starting");
        if self.options.should_attach_to_session {
            self.should_be_attached = true;
            self.attach_to_running_session(event_loop)?;
        }
        Ok(())
    }

    /// Save the progress cache and release the splash and session
    ///
    /// Called once the loop has exited.
    pub fn shutdown(&mut self) {
        let cache = self.options.cache_file();
        if let Err(error) = self.progress.save_cache(&cache) {
            warn!(path = %cache.display(), %error, "could not save duration cache");
        }
        self.splash = None;
        self.session = None;
        self.session_watch = None;
        info!("daemon shut down");
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Boot or shutdown
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.options.mode
    }

    /// Console the kernel command line named, if any
    #[must_use]
    pub fn kernel_console_tty(&self) -> Option<&str> {
        self.kernel_console_tty.as_deref()
    }

    /// Whether the console has been handed to someone else
    #[must_use]
    pub fn is_inactive(&self) -> bool {
        self.is_inactive
    }

    /// Whether the detailed splash is (or was last) selected
    #[must_use]
    pub fn is_showing_details(&self) -> bool {
        self.showing_details
    }

    /// Whether a splash is loaded
    #[must_use]
    pub fn has_splash(&self) -> bool {
        self.splash.is_some()
    }

    /// Whether a pixel renderer is open
    #[must_use]
    pub fn has_renderer(&self) -> bool {
        self.renderer.is_some()
    }

    /// The owned console, if any
    #[must_use]
    pub fn terminal(&self) -> Option<&Terminal> {
        self.terminal.as_ref()
    }

    /// The keyboard, if any
    #[must_use]
    pub fn keyboard(&self) -> Option<&Keyboard> {
        self.keyboard.as_ref()
    }

    /// Text displays in creation order
    #[must_use]
    pub fn text_displays(&self) -> &[TextDisplay] {
        &self.text_displays
    }

    /// Pixel displays in creation order
    #[must_use]
    pub fn pixel_displays(&self) -> &[PixelDisplay] {
        &self.pixel_displays
    }

    /// Prompts waiting for an answer
    #[must_use]
    pub fn pending_entries(&self) -> usize {
        self.entries.len()
    }

    /// Text typed for the head prompt
    #[must_use]
    pub fn entry_text(&self) -> String {
        self.entries.text()
    }

    /// Keystroke watches waiting for a key
    #[must_use]
    pub fn pending_keystroke_watches(&self) -> usize {
        self.keystroke_watches.len()
    }

    /// Whether a deactivate is waiting for the splash
    #[must_use]
    pub fn is_deactivate_pending(&self) -> bool {
        self.deactivate_trigger.is_some()
    }

    /// Whether a quit is waiting for the splash
    #[must_use]
    pub fn is_quit_pending(&self) -> bool {
        self.quit_trigger.is_some()
    }

    /// Whether console output is being captured
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.is_attached
    }

    /// Whether the kernel console is redirected into the session
    #[must_use]
    pub fn is_redirected(&self) -> bool {
        self.is_redirected
    }

    /// Errors reported by clients
    #[must_use]
    pub fn number_of_errors(&self) -> u32 {
        self.number_of_errors
    }

    /// Boot progress
    #[must_use]
    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    /// Console output captured so far
    #[must_use]
    pub fn boot_output(&self) -> &[u8] {
        &self.boot_buffer
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Handle one event from the loop
    pub fn dispatch(&mut self, event: LoopEvent, event_loop: &mut dyn EventLoop) {
        match event {
            LoopEvent::Signal(signal) => {
                let handled = self
                    .terminal
                    .as_mut()
                    .is_some_and(|terminal| terminal.handle_signal(signal));
                if !handled {
                    trace!(?signal, "signal not handled by terminal");
                }
                if self.vt_reacquired.replace(false) {
                    debug!("VT reacquired, redrawing");
                    self.update_display();
                }
            }
            LoopEvent::Input { watch, bytes } => {
                if self.session_watch == Some(watch) {
                    self.on_session_output(&bytes);
                } else if self.keyboard.as_ref().is_some_and(|k| k.owns(watch)) {
                    self.on_keyboard_bytes(&bytes, event_loop);
                } else {
                    trace!(%watch, "input on unknown watch");
                }
            }
            LoopEvent::Hangup(watch) => self.on_hangup(watch, event_loop),
            LoopEvent::SplashIdle => self.on_boot_splash_idle(event_loop),
            LoopEvent::Request(request) => self.handle_request(request, event_loop),
        }
    }

    /// Handle one boot client request
    pub fn handle_request(&mut self, request: BootRequest, event_loop: &mut dyn EventLoop) {
        debug!(request = request.name(), "handling request");
        match request {
            BootRequest::Update { status } => self.on_update(&status),
            BootRequest::AskForPassword { prompt, answer } => {
                self.on_ask_for_password(prompt, answer);
            }
            BootRequest::AskQuestion { prompt, answer } => self.on_ask_question(prompt, answer),
            BootRequest::DisplayMessage { message } => self.on_display_message(&message),
            BootRequest::WatchKeystroke { keys, trigger } => {
                trace!(?keys, "watching for keystroke");
                self.keystroke_watches.add(keys, trigger);
            }
            BootRequest::IgnoreKeystroke { keys } => {
                trace!(?keys, "ignoring keystroke");
                self.keystroke_watches.ignore(keys.as_deref());
            }
            BootRequest::PauseProgress => {
                trace!("pausing progress");
                self.progress.pause();
            }
            BootRequest::UnpauseProgress => {
                trace!("unpausing progress");
                self.progress.unpause();
            }
            BootRequest::ShowSplash => self.on_show_splash(event_loop),
            BootRequest::HideSplash => self.on_hide_splash(event_loop),
            BootRequest::NewRoot { path } => self.on_newroot(&path),
            BootRequest::SystemInitialized => self.on_system_initialized(),
            BootRequest::Error => self.on_error(),
            BootRequest::Deactivate { done } => self.on_deactivate(done, event_loop),
            BootRequest::Reactivate => self.on_reactivate(event_loop),
            BootRequest::Quit {
                retain_splash,
                done,
            } => self.on_quit(retain_splash, done, event_loop),
            BootRequest::HasActiveVt { reply } => {
                let active = self.terminal.as_ref().is_some_and(Terminal::is_active);
                reply.pull(Some(&active));
            }
        }
    }

    fn on_hangup(&mut self, watch: WatchId, event_loop: &mut dyn EventLoop) {
        if self.session_watch == Some(watch) {
            debug!("got hang up on terminal session fd");
            self.session_watch = None;
            return;
        }

        if let Some(keyboard) = self.keyboard.as_mut() {
            if keyboard.watch_closed(watch) {
                trace!(%watch, "keyboard input hung up");
                return;
            }
        }

        let reopened = self
            .terminal
            .as_mut()
            .is_some_and(|terminal| terminal.handle_hangup(event_loop, watch));
        if !reopened {
            trace!(%watch, "hangup on unknown watch");
            return;
        }

        // the terminal has a new descriptor; keystrokes must follow it
        let reads_terminal = self
            .keyboard
            .as_ref()
            .is_some_and(|k| k.source() == KeyboardSource::Terminal);
        if reads_terminal {
            if let Some(keyboard) = self.keyboard.as_mut() {
                keyboard.stop_watching_for_input(event_loop);
            }
            if !self.is_inactive {
                self.watch_keyboard(event_loop);
            }
        }
    }

    // =========================================================================
    // Status, messages, progress
    // =========================================================================

    fn on_update(&mut self, status: &str) {
        trace!(status, "updating status");
        self.progress.status_update(status);
        if let Some(splash) = self.splash.as_mut() {
            splash.update_status(status);
        }
    }

    fn on_display_message(&mut self, message: &str) {
        trace!(message, "displaying message");
        if let Some(splash) = self.splash.as_mut() {
            splash.display_message(message);
        }
    }

    fn on_session_output(&mut self, output: &[u8]) {
        self.boot_buffer.extend_from_slice(output);
        if let Some(session) = self.session.as_mut() {
            session.log_output(output);
        }
        if let Some(splash) = self.splash.as_mut() {
            splash.update_output(output);
        }
    }

    fn on_newroot(&mut self, root: &Path) {
        if self.options.mode != Mode::Boot {
            debug!("new root is only supported in boot mode");
            return;
        }

        info!(root = %root.display(), "new root mounted, switching to it");
        if let Err(error) = self.platform.switch_root(root) {
            warn!(%error, "could not switch root");
        }
        self.progress
            .load_cache(&self.options.cache_file_for(Mode::Boot));
        if let Some(splash) = self.splash.as_mut() {
            splash.root_mounted();
        }
    }

    // =========================================================================
    // Boot log
    // =========================================================================

    fn on_system_initialized(&mut self) {
        debug!("system now initialized, opening log");
        self.system_initialized = true;
        self.prepare_logging();
    }

    fn on_error(&mut self) {
        debug!("encountered error during boot up");
        if self.system_initialized && self.number_of_errors == 0 {
            self.spool_error();
        } else {
            trace!(errors = self.number_of_errors, "not spooling");
        }
        self.number_of_errors += 1;
    }

    fn prepare_logging(&mut self) {
        if !self.system_initialized {
            trace!("not preparing logging yet, system not initialized");
            return;
        }
        let Some(session) = self.session.as_mut() else {
            trace!("not preparing logging, no session");
            return;
        };
        let Some(log) = self.options.boot_log.as_deref() else {
            return;
        };

        debug!(log = %log.display(), "opening boot log");
        if let Err(error) = session.open_log(log) {
            warn!(%error, "could not open boot log");
        }
        if self.number_of_errors > 0 {
            self.spool_error();
        }
    }

    fn spool_error(&self) {
        let (Some(log), Some(spool)) = (
            self.options.boot_log.as_deref(),
            self.options.spool_log.as_deref(),
        ) else {
            return;
        };

        debug!(log = %log.display(), spool = %spool.display(), "spooling error for viewer");
        if let Err(error) = link_log(log, spool) {
            warn!(%error, "could not spool boot log");
        }
    }

    fn attach_to_running_session(
        &mut self,
        event_loop: &mut dyn EventLoop,
    ) -> Result<(), SessionError> {
        let should_be_redirected = !self.options.kernel_command_line.no_boot_log();

        let mut session = match self.session.take() {
            Some(session) => session,
            None => {
                trace!("creating new terminal session");
                self.platform.new_session()
            }
        };

        match session.attach(should_be_redirected) {
            Ok(fd) => {
                if let Some(fd) = fd {
                    if let Some(watch) = self.session_watch.take() {
                        event_loop.stop_watching_fd(watch);
                    }
                    self.session_watch = Some(event_loop.watch_fd(fd, FdInterest::Input));
                }
                self.is_redirected = should_be_redirected;
                self.is_attached = true;
                self.session = Some(session);
                debug!(redirected = should_be_redirected, "attached to session");
                Ok(())
            }
            Err(error) => {
                self.is_redirected = false;
                self.is_attached = false;
                Err(error)
            }
        }
    }

    fn detach_session(&mut self, event_loop: &mut dyn EventLoop) {
        if let Some(session) = self.session.as_mut() {
            debug!("detaching session");
            session.detach();
        }
        if let Some(watch) = self.session_watch.take() {
            event_loop.stop_watching_fd(watch);
        }
        self.is_redirected = false;
        self.is_attached = false;
    }

    // =========================================================================
    // Displays
    // =========================================================================

    fn add_displays_and_keyboard(&mut self, event_loop: &mut dyn EventLoop) {
        if !self.text_displays.is_empty() || !self.pixel_displays.is_empty() {
            trace!(
                text = self.text_displays.len(),
                pixel = self.pixel_displays.len(),
                "displays already present"
            );
            return;
        }

        let consoles = self
            .options
            .kernel_command_line
            .consoles(&self.options.default_tty);
        let Some((last, others)) = consoles.split_last() else {
            self.add_default_displays_and_keyboard(event_loop);
            return;
        };

        for tty in others {
            debug!(tty = %tty, "adding text display for console");
            self.text_displays.push(TextDisplay {
                tty: device_path(tty),
            });
        }
        self.add_display_and_keyboard_for_terminal(last, event_loop);
    }

    fn add_display_and_keyboard_for_terminal(&mut self, tty: &str, event_loop: &mut dyn EventLoop) {
        debug!(tty, "adding display and keyboard");
        let terminal = self.open_terminal(tty, event_loop);
        self.text_displays.push(TextDisplay::for_terminal(&terminal));
        self.terminal = Some(terminal);
        self.keyboard = Some(Keyboard::for_terminal());
    }

    fn add_default_displays_and_keyboard(&mut self, event_loop: &mut dyn EventLoop) {
        debug!("adding default displays and keyboard");
        let tty = self.options.default_tty.clone();
        let mut terminal = self.open_terminal(&tty, event_loop);

        let Some(renderer) = self.platform.open_renderer(&terminal) else {
            debug!("could not open renderer, using text display");
            self.text_displays.push(TextDisplay::for_terminal(&terminal));
            self.terminal = Some(terminal);
            self.keyboard = Some(Keyboard::for_terminal());
            return;
        };

        terminal.set_mode(ConsoleMode::Graphics);

        let heads = renderer.heads();
        debug!(heads = heads.len(), "adding pixel displays");
        self.pixel_displays
            .extend(heads.into_iter().map(|head| PixelDisplay { head }));
        self.text_displays.push(TextDisplay::for_terminal(&terminal));

        self.terminal = Some(terminal);
        self.renderer = Some(renderer);
        self.keyboard = Some(Keyboard::for_renderer());
    }

    fn open_terminal(&mut self, tty: &str, event_loop: &mut dyn EventLoop) -> Terminal {
        let mut terminal = self.platform.new_terminal(tty);
        match terminal.open(event_loop) {
            Ok(()) => terminal.add_vt_change_listener(Rc::clone(&self.vt_listener)),
            Err(error) => warn!(%error, "could not open terminal"),
        }
        terminal
    }

    fn remove_displays_and_keyboard(&mut self, event_loop: &mut dyn EventLoop) {
        trace!("removing displays and keyboard");
        self.pixel_displays.clear();
        self.text_displays.clear();
        if let Some(mut keyboard) = self.keyboard.take() {
            keyboard.stop_watching_for_input(event_loop);
        }
    }

    fn keyboard_fd(&self) -> Option<RawFd> {
        match self.keyboard.as_ref()?.source() {
            KeyboardSource::Terminal => self.terminal.as_ref()?.raw_fd(),
            KeyboardSource::Renderer => self.renderer.as_ref()?.input_fd(),
        }
    }

    fn watch_keyboard(&mut self, event_loop: &mut dyn EventLoop) {
        let fd = self.keyboard_fd();
        if let Some(keyboard) = self.keyboard.as_mut() {
            keyboard.watch_for_input(event_loop, fd);
        }
    }

    // =========================================================================
    // Splash selection
    // =========================================================================

    fn on_show_splash(&mut self, event_loop: &mut dyn EventLoop) {
        if self.is_inactive {
            debug!("show splash called while inactive");
            return;
        }

        if self
            .options
            .kernel_command_line
            .should_ignore_show_splash_calls(self.options.mode)
        {
            debug!("show splash called while ignoring show splash calls");
            self.dump_details_and_quit_splash(event_loop);
            return;
        }

        self.add_displays_and_keyboard(event_loop);

        let has_display = !self.pixel_displays.is_empty() || !self.text_displays.is_empty();

        if !self.is_attached && self.should_be_attached && has_display {
            if let Err(error) = self.attach_to_running_session(event_loop) {
                warn!(%error, "could not attach to session");
            }
        }

        if !has_display && self.is_attached {
            debug!("no open seats, detaching session");
            self.detach_session(event_loop);
        }

        if self
            .options
            .kernel_command_line
            .should_show_default_splash(self.kernel_console_tty.is_some())
        {
            self.show_default_splash(event_loop);
            self.showing_details = false;
        } else {
            self.show_detailed_splash(event_loop);
            self.showing_details = true;
        }
    }

    fn show_default_splash(&mut self, event_loop: &mut dyn EventLoop) {
        if self.splash.is_some() {
            return;
        }
        debug!("showing splash screen");

        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(name) = self.options.kernel_command_line.splash_override() {
            candidates.push(self.options.theme_path(name));
        }
        if let Some(name) = &self.options.theme {
            candidates.push(self.options.theme_path(name));
        }
        if let Some(name) = &self.options.distribution_theme {
            candidates.push(self.options.theme_path(name));
        }
        candidates.push(self.options.default_theme_link());
        candidates.push(self.options.theme_path(TEXT_THEME));

        for theme in candidates {
            trace!(theme = %theme.display(), "trying splash");
            self.splash = self.start_boot_splash(&theme, event_loop);
            if self.splash.is_some() {
                break;
            }
        }

        if self.splash.is_none() {
            error!("could not start boot splash");
            return;
        }
        self.update_display();
    }

    fn show_detailed_splash(&mut self, event_loop: &mut dyn EventLoop) {
        if self.splash.is_some() {
            return;
        }
        debug!("showing detailed splash screen");

        let theme = self.options.theme_path(DETAILS_THEME);
        self.splash = self.start_boot_splash(&theme, event_loop);
        if self.splash.is_none() {
            error!(theme = %theme.display(), "could not start detailed splash screen");
            return;
        }
        self.update_display();
    }

    fn start_boot_splash(
        &mut self,
        theme: &Path,
        event_loop: &mut dyn EventLoop,
    ) -> Option<Box<dyn Splash>> {
        debug!(theme = %theme.display(), "loading boot splash theme");
        let mut splash = match self.platform.load_splash(theme, &self.boot_buffer) {
            Ok(splash) => splash,
            Err(error) => {
                debug!(%error, "could not load splash");
                return None;
            }
        };

        for display in &self.pixel_displays {
            splash.add_pixel_display(display);
        }
        for display in &self.text_displays {
            splash.add_text_display(display);
        }

        if let Err(error) = splash.show(self.options.mode) {
            debug!(%error, "could not show splash");
            return None;
        }

        self.watch_keyboard(event_loop);
        Some(splash)
    }

    fn toggle_between_splash_and_details(&mut self, event_loop: &mut dyn EventLoop) {
        debug!("toggling between splash and details");
        if let Some(mut splash) = self.splash.take() {
            trace!("hiding and freeing current splash");
            splash.hide();
        }

        if self.showing_details {
            self.show_default_splash(event_loop);
            self.showing_details = false;
        } else {
            self.show_detailed_splash(event_loop);
            self.showing_details = true;
        }
        self.update_display();
    }

    fn update_display(&mut self) {
        let Some(splash) = self.splash.as_mut() else {
            return;
        };

        match self.entries.head() {
            Some(head) if head.kind == EntryKind::Password => {
                splash.display_password(&head.prompt, self.entries.character_count());
            }
            Some(head) => splash.display_question(&head.prompt, &self.entries.text()),
            None => splash.display_normal(),
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    fn on_hide_splash(&mut self, event_loop: &mut dyn EventLoop) {
        if self.is_inactive || self.splash.is_none() {
            return;
        }
        debug!("hiding boot splash");
        self.dump_details_and_quit_splash(event_loop);
    }

    fn dump_details_and_quit_splash(&mut self, event_loop: &mut dyn EventLoop) {
        self.showing_details = false;
        self.toggle_between_splash_and_details(event_loop);

        if let Some(renderer) = self.renderer.as_mut() {
            renderer.deactivate();
        }
        if let Some(splash) = self.splash.as_mut() {
            splash.hide();
        }
        self.quit_splash(event_loop);
    }

    fn quit_splash(&mut self, event_loop: &mut dyn EventLoop) {
        debug!("quitting splash");
        self.splash = None;

        self.remove_displays_and_keyboard(event_loop);

        if let Some(mut renderer) = self.renderer.take() {
            renderer.close();
            if let Some(terminal) = self.terminal.as_mut() {
                terminal.set_mode(ConsoleMode::Text);
            }
        }

        if let Some(mut terminal) = self.terminal.take() {
            if !self.should_retain_splash {
                debug!("not retaining splash, deallocating VT");
                if let Err(error) = terminal.deactivate_vt(event_loop) {
                    debug!(%error, "VT left allocated");
                }
            }
            terminal.remove_vt_change_listener(&self.vt_listener);
            terminal.close(event_loop);
        }

        if self.session.is_some() {
            self.detach_session(event_loop);
        }
    }

    fn quit_program(&mut self, event_loop: &mut dyn EventLoop) {
        info!("exiting event loop");
        event_loop.exit(0);

        if let Some(trigger) = self.deactivate_trigger.take() {
            trigger.pull(None);
        }
        if let Some(trigger) = self.quit_trigger.take() {
            trigger.pull(None);
        }
    }

    // =========================================================================
    // Deactivate / reactivate / quit
    // =========================================================================

    fn on_deactivate(&mut self, trigger: Trigger, event_loop: &mut dyn EventLoop) {
        if let Some(pending) = self.deactivate_trigger.as_mut() {
            trace!("deactivate already pending, chaining");
            pending.chain(trigger);
            return;
        }
        if self.is_inactive {
            trace!("already inactive");
            trigger.pull(None);
            return;
        }

        self.deactivate_trigger = Some(trigger);

        debug!("deactivating");
        match self.splash.as_mut() {
            Some(splash) => splash.become_idle(event_loop),
            None => self.deactivate_splash(event_loop),
        }
    }

    fn deactivate_splash(&mut self, event_loop: &mut dyn EventLoop) {
        if !self.is_inactive {
            if let Some(renderer) = self.renderer.as_mut() {
                trace!("deactivating renderer");
                renderer.deactivate();
            }

            if let Some(keyboard) = self.keyboard.as_mut() {
                trace!("deactivating keyboard");
                keyboard.stop_watching_for_input(event_loop);
            }

            if self.session.is_some() && self.is_attached {
                trace!("deactivating terminal session");
                self.detach_session(event_loop);
            }

            if let Some(terminal) = self.terminal.as_mut() {
                trace!("deactivating terminal");
                terminal.stop_watching_for_vt_changes(event_loop);
                if let Err(error) = terminal.set_buffered_input() {
                    warn!(%error, "could not restore buffered input");
                }
                terminal.ignore_mode_changes(true);
            }

            self.is_inactive = true;
            info!("deactivated");
        }

        if let Some(trigger) = self.deactivate_trigger.take() {
            trigger.pull(None);
        }
    }

    fn on_reactivate(&mut self, event_loop: &mut dyn EventLoop) {
        if !self.is_inactive {
            return;
        }

        if let Some(terminal) = self.terminal.as_mut() {
            terminal.watch_for_vt_changes(event_loop);
            if let Err(error) = terminal.set_unbuffered_input() {
                warn!(%error, "could not restore raw input");
            }
            terminal.ignore_mode_changes(false);
        }

        if self.session.is_some() && self.should_be_attached {
            trace!("reactivating terminal session");
            if let Err(error) = self.attach_to_running_session(event_loop) {
                warn!(%error, "could not reattach session");
            }
        }

        self.watch_keyboard(event_loop);

        if let Some(renderer) = self.renderer.as_mut() {
            trace!("activating renderer");
            renderer.activate();
        }

        self.is_inactive = false;
        info!("reactivated");
        self.update_display();
    }

    fn on_quit(&mut self, retain_splash: bool, trigger: Trigger, event_loop: &mut dyn EventLoop) {
        if let Some(pending) = self.quit_trigger.as_mut() {
            trace!("quit already pending, chaining");
            pending.chain(trigger);
            return;
        }

        self.quit_trigger = Some(trigger);
        self.should_retain_splash = retain_splash;

        debug!(retain_splash, "time to quit, closing log");
        if let Some(session) = self.session.as_mut() {
            session.close_log();
        }

        if self.is_inactive && !retain_splash {
            // deactivated and whoever took the console failed to start
            self.dump_details_and_quit_splash(event_loop);
            self.quit_program(event_loop);
        } else if let Some(splash) = self.splash.as_mut() {
            splash.become_idle(event_loop);
        } else {
            self.quit_program(event_loop);
        }
    }

    fn on_boot_splash_idle(&mut self, event_loop: &mut dyn EventLoop) {
        debug!("boot splash idle");

        if self.quit_trigger.is_some() {
            if !self.should_retain_splash {
                trace!("hiding splash");
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.deactivate();
                }
                if let Some(splash) = self.splash.as_mut() {
                    splash.hide();
                }
            }
            self.quit_splash(event_loop);
            self.quit_program(event_loop);
        } else if self.deactivate_trigger.is_some() {
            self.deactivate_splash(event_loop);
        } else {
            trace!("nothing waiting on splash idle");
        }
    }

    // =========================================================================
    // Prompts and keystrokes
    // =========================================================================

    fn on_ask_for_password(&mut self, prompt: String, answer: Trigger<Answer>) {
        if self.splash.is_none() {
            debug!("no splash loaded, replying immediately with no password");
            answer.pull(None);
            return;
        }
        trace!("queuing password request with boot splash");
        self.entries.push(EntryKind::Password, prompt, answer);
        self.update_display();
    }

    fn on_ask_question(&mut self, prompt: String, answer: Trigger<Answer>) {
        trace!("queuing question with boot splash");
        self.entries.push(EntryKind::Question, prompt, answer);
        self.update_display();
    }

    fn on_keyboard_bytes(&mut self, bytes: &[u8], event_loop: &mut dyn EventLoop) {
        let Some(keyboard) = self.keyboard.as_mut() else {
            return;
        };
        for key in keyboard.process(bytes) {
            match key {
                KeyEvent::Input(character) => self.on_keyboard_input(&character),
                KeyEvent::Backspace => self.on_backspace(),
                KeyEvent::Enter(line) => self.on_enter(&line),
                KeyEvent::Escape => {
                    debug!("escape key pressed");
                    self.toggle_between_splash_and_details(event_loop);
                }
            }
        }
    }

    fn on_keyboard_input(&mut self, character: &[u8]) {
        if self.entries.is_empty() {
            let input = String::from_utf8_lossy(character).into_owned();
            let answer = Answer::Text(input.clone());
            self.keystroke_watches.match_input(&input, &answer);
            return;
        }

        if matches!(character, [KEY_CTRL_C] | [KEY_CTRL_D]) {
            debug!("entry cancelled");
            self.entries.cancel_head();
        } else {
            self.entries.append(character);
        }
        self.update_display();
    }

    fn on_backspace(&mut self) {
        if self.entries.backspace() {
            self.update_display();
        }
    }

    fn on_enter(&mut self, line: &str) {
        if self.entries.is_empty() {
            let answer = Answer::Text(line.to_string());
            self.keystroke_watches.match_input("\n", &answer);
            return;
        }
        self.entries.complete_head();
        self.update_display();
    }
}

impl fmt::Debug for Daemon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Daemon")
            .field("mode", &self.options.mode)
            .field("terminal", &self.terminal)
            .field("has_splash", &self.splash.is_some())
            .field("has_renderer", &self.renderer.is_some())
            .field("is_inactive", &self.is_inactive)
            .field("showing_details", &self.showing_details)
            .field("entries", &self.entries.len())
            .field("keystroke_watches", &self.keystroke_watches.len())
            .finish_non_exhaustive()
    }
}

fn device_path(tty: &str) -> PathBuf {
    if tty.starts_with("/dev/") {
        PathBuf::from(tty)
    } else {
        Path::new("/dev").join(tty)
    }
}

/// Replace `spool` with a hard link to `log`
fn link_log(log: &Path, spool: &Path) -> io::Result<()> {
    match fs::remove_file(spool) {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => return Err(error),
    }
    if let Some(parent) = spool.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::hard_link(log, spool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeConsole, FakePlatform, RecordingLoop};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_device_path() {
        assert_eq!(device_path("ttyS0"), PathBuf::from("/dev/ttyS0"));
        assert_eq!(device_path("/dev/hvc0"), PathBuf::from("/dev/hvc0"));
    }

    #[test]
    fn test_link_log_replaces_stale_spool() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("boot.log");
        let spool = dir.path().join("spool").join("boot.log");
        fs::write(&log, "new").unwrap();
        fs::create_dir_all(spool.parent().unwrap()).unwrap();
        fs::write(&spool, "stale").unwrap();

        link_log(&log, &spool).unwrap();

        assert_eq!(fs::read_to_string(&spool).unwrap(), "new");
    }

    #[test]
    fn test_redraw_flag_set_only_on_acquire() {
        let pending = Rc::new(Cell::new(false));
        let listener = RedrawOnAcquire {
            pending: Rc::clone(&pending),
        };

        listener.vt_changed(VtChange {
            vt_number: 1,
            active: false,
        });
        assert!(!pending.get());

        listener.vt_changed(VtChange {
            vt_number: 1,
            active: true,
        });
        assert!(pending.get());
    }

    #[test]
    fn test_kernel_console_from_command_line() {
        let options = DaemonOptions::new(Mode::Boot)
            .with_kernel_command_line("ro console=tty0 console=ttyS1,9600");
        let platform = FakePlatform::new(FakeConsole::serial());
        let daemon = Daemon::new(options, platform.boxed());

        assert_eq!(daemon.kernel_console_tty(), Some("ttyS1"));
        assert!(!daemon.has_splash());
    }

    #[test]
    fn test_start_without_session_attaches_nothing() {
        let platform = FakePlatform::new(FakeConsole::vt(1));
        let mut daemon = Daemon::new(DaemonOptions::new(Mode::Boot), platform.boxed());
        let mut event_loop = RecordingLoop::new();

        daemon.start(&mut event_loop).unwrap();

        assert!(!daemon.is_attached());
        assert_eq!(event_loop.watch_count(), 0);
        assert!(platform.journal().is_empty());
    }
}
