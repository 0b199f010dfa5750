//! Terminal Manager
//!
//! A [`Terminal`] owns one console device for as long as the splash needs
//! it: the line discipline, the text color map, the window geometry and,
//! when the device is a virtual terminal, the kernel's VT switch handshake.
//!
//! # VT Switch Handshake
//!
//! ```text
//!   kernel                     event loop                  Terminal
//!     │  VT_SETMODE(PROCESS)  ◄──────────────────────────────  │ watch_for_vt_changes
//!     │                            │                           │
//!     │ ── SIGUSR1 (release) ────► │ ── LoopEvent::Signal ───► │ VT_RELDISP 1
//!     │                            │                           │ is_active = false
//!     │                            │                           │ notify listeners
//!     │ ── SIGUSR2 (acquire) ────► │ ── LoopEvent::Signal ───► │ VT_RELDISP VT_ACKACQ
//!     │                            │                           │ is_active = true
//!     │                            │                           │ notify listeners
//!     │  VT_SETMODE(AUTO)     ◄──────────────────────────────  │ stop_watching_for_vt_changes
//! ```
//!
//! The acknowledgement is always issued before listeners run. While the
//! handshake is armed the kernel will not complete a switch without it, so
//! leaving process mode behind would stall VT switching system-wide; the
//! terminal restores `VT_AUTO` on close, on deactivation and on drop.
//!
//! # Lifecycle
//!
//! ```text
//!   new ──► open ──► (raw input, handshake armed) ──► close ──► closed
//!             ▲                │ hangup
//!             └── reopen ◄─────┘
//! ```

pub mod device;
pub mod palette;

use std::fmt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use nix::sys::signal::Signal;
use nix::sys::termios::{self, InputFlags, LocalFlags, OutputFlags, SetArg, Termios};
use tracing::{debug, info, trace, warn};

pub use device::{
    vt_number_for, ConsoleMode, LinuxTty, LinuxTtyOpener, TtyDevice, TtyOpener, VtAck, VtMode,
    WindowSize,
};
pub use palette::{ColorPalette, TerminalColor, PALETTE_SIZE};

use crate::error::TerminalError;
use crate::event_loop::{EventLoop, FdInterest, WatchId};

/// Signal the kernel raises when another VT wants the display
pub const RELEASE_SIGNAL: Signal = Signal::SIGUSR1;

/// Signal the kernel raises when the display is handed back
pub const ACQUIRE_SIGNAL: Signal = Signal::SIGUSR2;

/// Geometry assumed when the console cannot report its own
pub const DEFAULT_GEOMETRY: WindowSize = WindowSize {
    rows: 24,
    columns: 80,
};

// =============================================================================
// VT change listeners
// =============================================================================

/// Snapshot passed to listeners after a handshake transition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VtChange {
    /// The terminal's VT
    pub vt_number: u32,
    /// Whether that VT is now on screen
    pub active: bool,
}

/// Observer of handshake-driven VT switches
///
/// Listeners are identified by `Rc` pointer identity. They have no error
/// path: whatever they do, the kernel has already been acknowledged.
pub trait VtChangeListener {
    /// Called after this terminal's VT was switched away from or back to
    fn vt_changed(&self, change: VtChange);
}

// =============================================================================
// Terminal
// =============================================================================

/// One console device and the state needed to give it back intact
pub struct Terminal {
    name: PathBuf,
    opener: Box<dyn TtyOpener>,
    device: Option<Box<dyn TtyDevice>>,
    hangup_watch: Option<WatchId>,

    vt_number: Option<u32>,
    initial_vt_number: Option<u32>,

    /// Saved once per terminal and never overwritten
    original_attributes: Option<Termios>,

    palette: ColorPalette,
    original_palette: ColorPalette,
    supports_color: bool,

    geometry: WindowSize,

    is_open: bool,
    is_active: bool,
    is_unbuffered: bool,
    is_watching_for_vt_changes: bool,
    should_ignore_mode_changes: bool,

    listeners: Vec<Rc<dyn VtChangeListener>>,
}

impl Terminal {
    /// Create an unopened terminal for `device_name`
    ///
    /// Names without a `/dev/` prefix (`tty1`) are resolved under `/dev`.
    #[must_use]
    pub fn new(device_name: &str, opener: Box<dyn TtyOpener>) -> Self {
        let name = if device_name.starts_with("/dev/") {
            PathBuf::from(device_name)
        } else {
            Path::new("/dev").join(device_name)
        };

        Self {
            name,
            opener,
            device: None,
            hangup_watch: None,
            vt_number: None,
            initial_vt_number: None,
            original_attributes: None,
            palette: ColorPalette::default(),
            original_palette: ColorPalette::default(),
            supports_color: false,
            geometry: DEFAULT_GEOMETRY,
            is_open: false,
            is_active: false,
            is_unbuffered: false,
            is_watching_for_vt_changes: false,
            should_ignore_mode_changes: false,
            listeners: Vec::new(),
        }
    }

    /// Device path
    #[must_use]
    pub fn name(&self) -> &Path {
        &self.name
    }

    /// Whether [`Terminal::open`] succeeded and [`Terminal::close`] has not run
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.is_open
    }

    /// Whether this terminal's VT is the one on screen
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.is_active
    }

    /// Whether the device is a virtual terminal
    #[must_use]
    pub fn is_vt(&self) -> bool {
        self.vt_number.is_some()
    }

    /// VT number, if the device is a VT
    #[must_use]
    pub fn vt_number(&self) -> Option<u32> {
        self.vt_number
    }

    /// VT that was on screen when this terminal first asked
    #[must_use]
    pub fn initial_vt_number(&self) -> Option<u32> {
        self.initial_vt_number
    }

    /// Whether input is currently raw
    #[must_use]
    pub fn is_unbuffered(&self) -> bool {
        self.is_unbuffered
    }

    /// Whether the VT switch handshake is armed
    #[must_use]
    pub fn is_watching_for_vt_changes(&self) -> bool {
        self.is_watching_for_vt_changes
    }

    /// Whether the device exposes a color map
    #[must_use]
    pub fn supports_color(&self) -> bool {
        self.supports_color
    }

    /// Text rows
    #[must_use]
    pub fn rows(&self) -> u16 {
        self.geometry.rows
    }

    /// Text columns
    #[must_use]
    pub fn columns(&self) -> u16 {
        self.geometry.columns
    }

    /// Descriptor of the open device, for keyboard watches
    #[must_use]
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.device.as_ref().map(|device| device.raw_fd())
    }

    // -------------------------------------------------------------------------
    // Open / close
    // -------------------------------------------------------------------------

    /// Acquire the device and take over the console
    ///
    /// Already open terminals succeed immediately.
    ///
    /// # Errors
    ///
    /// Returns [`TerminalError::Open`] if the device node cannot be opened;
    /// the terminal stays closed and the call may be retried.
    pub fn open(&mut self, event_loop: &mut dyn EventLoop) -> Result<(), TerminalError> {
        if self.is_open {
            trace!(terminal = %self.name.display(), "terminal is already open");
            return Ok(());
        }

        debug!(terminal = %self.name.display(), "opening terminal");
        self.open_device(event_loop)?;

        self.look_up_geometry();
        self.look_up_color_palette();
        if self.supports_color {
            self.original_palette = self.palette;
        }

        event_loop.watch_signal(Signal::SIGWINCH);

        if let Some(vt_number) = self.vt_number {
            self.watch_for_vt_changes(event_loop);
            self.is_active = self.query_active_vt() == Some(vt_number);
        }

        self.is_open = true;
        info!(
            terminal = %self.name.display(),
            vt = ?self.vt_number,
            active = self.is_active,
            "terminal opened"
        );
        Ok(())
    }

    fn open_device(&mut self, event_loop: &mut dyn EventLoop) -> Result<(), TerminalError> {
        let device = self
            .opener
            .open(&self.name)
            .map_err(|source| TerminalError::Open {
                path: self.name.clone(),
                source,
            })?;

        self.hangup_watch = Some(event_loop.watch_fd(device.raw_fd(), FdInterest::Hangup));

        match device.device_number() {
            Ok(Some((major, minor))) => self.vt_number = vt_number_for(major, minor),
            Ok(None) => self.vt_number = None,
            Err(error) => debug!(%error, "could not stat terminal"),
        }
        self.device = Some(device);

        if let Err(error) = self.set_unbuffered_input() {
            debug!(terminal = %self.name.display(), %error, "terminal will be line buffered");
        }
        Ok(())
    }

    /// Hand the console back and release the device
    ///
    /// No-op on a terminal that is not open.
    pub fn close(&mut self, event_loop: &mut dyn EventLoop) {
        if !self.is_open {
            trace!(terminal = %self.name.display(), "terminal is already closed");
            return;
        }
        self.is_open = false;

        self.stop_watching_for_vt_changes(event_loop);

        trace!("restoring color palette");
        self.reset_colors();

        if let Some(watch) = self.hangup_watch.take() {
            trace!(%watch, "stop watching tty fd");
            event_loop.stop_watching_fd(watch);
        }

        event_loop.stop_watching_signal(Signal::SIGWINCH);

        if let Err(error) = self.set_buffered_input() {
            warn!(terminal = %self.name.display(), %error, "could not restore buffered input");
        }

        self.device = None;
        info!(terminal = %self.name.display(), "terminal closed");
    }

    /// Handle a disconnect reported on the hangup watch
    ///
    /// Returns `false` if `watch` does not belong to this terminal. The same
    /// terminal reopens the same device and re-arms the handshake if it was
    /// armed before the disconnect. If the reopen fails the terminal is left
    /// unopened.
    pub fn handle_hangup(&mut self, event_loop: &mut dyn EventLoop, watch: WatchId) -> bool {
        if self.hangup_watch != Some(watch) {
            return false;
        }
        self.hangup_watch = None;

        warn!(terminal = %self.name.display(), "tty disconnected");

        let was_watching = self.is_watching_for_vt_changes;
        if was_watching {
            event_loop.stop_watching_signal(RELEASE_SIGNAL);
            event_loop.stop_watching_signal(ACQUIRE_SIGNAL);
            self.is_watching_for_vt_changes = false;
        }
        self.device = None;
        self.is_unbuffered = false;

        debug!(terminal = %self.name.display(), "trying to reopen terminal");
        match self.open_device(event_loop) {
            Ok(()) => {
                if was_watching {
                    self.watch_for_vt_changes(event_loop);
                }
                if let Some(vt_number) = self.vt_number {
                    self.is_active = self.query_active_vt() == Some(vt_number);
                }
            }
            Err(error) => {
                // back to unopened so a later open() retries the device
                warn!(%error, "could not reopen terminal");
                event_loop.stop_watching_signal(Signal::SIGWINCH);
                self.is_open = false;
                self.is_active = false;
            }
        }
        true
    }

    /// Route a loop signal to the terminal
    ///
    /// Returns `true` if the signal was consumed.
    pub fn handle_signal(&mut self, signal: Signal) -> bool {
        match signal {
            Signal::SIGWINCH if self.device.is_some() => {
                self.look_up_geometry();
                true
            }
            RELEASE_SIGNAL if self.is_watching_for_vt_changes => {
                self.on_leave_vt();
                true
            }
            ACQUIRE_SIGNAL if self.is_watching_for_vt_changes => {
                self.on_enter_vt();
                true
            }
            _ => false,
        }
    }

    // -------------------------------------------------------------------------
    // Line discipline
    // -------------------------------------------------------------------------

    /// Switch to raw input: no echo, no line editing, bytes as typed
    ///
    /// The first attributes ever read are kept for [`Terminal::set_buffered_input`].
    ///
    /// # Errors
    ///
    /// Fails if the device is not open or the attributes cannot be read or set.
    pub fn set_unbuffered_input(&mut self) -> Result<(), TerminalError> {
        let device = self.device.as_ref().ok_or(TerminalError::NotOpen)?;

        let mut attributes = device.attributes()?;
        if self.original_attributes.is_none() {
            self.original_attributes = Some(attributes.clone());
        }

        termios::cfmakeraw(&mut attributes);
        // keep \n returning to column zero
        attributes.output_flags |= OutputFlags::ONLCR;

        device.set_attributes(SetArg::TCSANOW, &attributes)?;
        self.is_unbuffered = true;
        Ok(())
    }

    /// Return to line-oriented input
    ///
    /// Attributes someone else already made canonical are left alone. If the
    /// saved original was not canonical either, sane cooked settings are
    /// invented instead of restoring it.
    ///
    /// # Errors
    ///
    /// Fails if the device is not open or the attributes cannot be read or set.
    pub fn set_buffered_input(&mut self) -> Result<(), TerminalError> {
        if !self.is_unbuffered {
            return Ok(());
        }
        let device = self.device.as_ref().ok_or(TerminalError::NotOpen)?;

        let mut attributes = device.attributes()?;
        if attributes.local_flags.contains(LocalFlags::ICANON) {
            self.is_unbuffered = false;
            return Ok(());
        }

        match &self.original_attributes {
            Some(original) if original.local_flags.contains(LocalFlags::ICANON) => {
                device.set_attributes(SetArg::TCSAFLUSH, original)?;
            }
            _ => {
                attributes.input_flags |= InputFlags::BRKINT
                    | InputFlags::IGNPAR
                    | InputFlags::ISTRIP
                    | InputFlags::ICRNL
                    | InputFlags::IXON;
                attributes.output_flags |= OutputFlags::OPOST;
                attributes.local_flags |=
                    LocalFlags::ECHO | LocalFlags::ICANON | LocalFlags::ISIG | LocalFlags::IEXTEN;
                device.set_attributes(SetArg::TCSAFLUSH, &attributes)?;
            }
        }

        self.is_unbuffered = false;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Geometry and colors
    // -------------------------------------------------------------------------

    /// Refresh rows and columns; falls back to 80x24
    pub fn look_up_geometry(&mut self) {
        trace!("looking up terminal text geometry");
        let size = self.device.as_ref().map(|device| device.window_size());
        self.geometry = match size {
            Some(Ok(size)) => size,
            Some(Err(error)) => {
                debug!(%error, "could not read terminal text geometry");
                DEFAULT_GEOMETRY
            }
            None => DEFAULT_GEOMETRY,
        };
        trace!(
            columns = self.geometry.columns,
            rows = self.geometry.rows,
            "terminal text geometry"
        );
    }

    fn look_up_color_palette(&mut self) {
        let Some(device) = self.device.as_ref() else {
            self.supports_color = false;
            return;
        };
        match device.color_palette() {
            Ok(palette) => {
                self.palette = palette;
                self.supports_color = true;
            }
            Err(error) => {
                trace!(%error, "terminal has no color map");
                self.supports_color = false;
            }
        }
    }

    fn push_color_palette(&self) {
        if !self.supports_color {
            return;
        }
        if let Some(device) = self.device.as_ref() {
            if let Err(error) = device.set_color_palette(&self.palette) {
                warn!(%error, "could not change color palette");
            }
        }
    }

    /// Packed `0xRRGGBB` value of `color` in the current palette
    #[must_use]
    pub fn color_hex_value(&self, color: TerminalColor) -> u32 {
        self.palette.hex_value(color)
    }

    /// Change one palette entry and push the palette to the device
    pub fn set_color_hex_value(&mut self, color: TerminalColor, hex_value: u32) {
        self.palette.set_hex_value(color, hex_value);
        self.push_color_palette();
    }

    /// Restore the palette captured at open
    pub fn reset_colors(&mut self) {
        if !self.supports_color {
            return;
        }
        self.palette = self.original_palette;
        self.push_color_palette();
    }

    // -------------------------------------------------------------------------
    // Console mode
    // -------------------------------------------------------------------------

    /// Switch the VT between kernel text rendering and graphics
    pub fn set_mode(&mut self, mode: ConsoleMode) {
        if !self.is_vt() || self.should_ignore_mode_changes {
            return;
        }
        if let Some(device) = self.device.as_ref() {
            if let Err(error) = device.set_console_mode(mode) {
                warn!(?mode, %error, "could not change console mode");
            }
        }
    }

    /// Suppress [`Terminal::set_mode`] while another process owns the VT
    pub fn ignore_mode_changes(&mut self, should_ignore: bool) {
        if !self.is_vt() {
            return;
        }
        self.should_ignore_mode_changes = should_ignore;
    }

    // -------------------------------------------------------------------------
    // VT handshake
    // -------------------------------------------------------------------------

    /// Arm the VT switch handshake
    ///
    /// No-op without a device, on a non-VT, or when already armed.
    pub fn watch_for_vt_changes(&mut self, event_loop: &mut dyn EventLoop) {
        if !self.is_vt() || self.is_watching_for_vt_changes {
            return;
        }
        let Some(device) = self.device.as_ref() else {
            return;
        };

        let mode = VtMode::Process {
            release: RELEASE_SIGNAL,
            acquire: ACQUIRE_SIGNAL,
        };
        if let Err(error) = device.set_vt_mode(mode) {
            warn!(%error, "could not take over VT switching");
            return;
        }

        event_loop.watch_signal(RELEASE_SIGNAL);
        event_loop.watch_signal(ACQUIRE_SIGNAL);
        self.is_watching_for_vt_changes = true;
        debug!(vt = ?self.vt_number, "watching for VT changes");
    }

    /// Disarm the handshake and hand VT switching back to the kernel
    pub fn stop_watching_for_vt_changes(&mut self, event_loop: &mut dyn EventLoop) {
        if !self.is_vt() || !self.is_watching_for_vt_changes {
            return;
        }
        self.is_watching_for_vt_changes = false;

        event_loop.stop_watching_signal(RELEASE_SIGNAL);
        event_loop.stop_watching_signal(ACQUIRE_SIGNAL);

        if let Some(device) = self.device.as_ref() {
            if let Err(error) = device.set_vt_mode(VtMode::Auto) {
                warn!(%error, "could not restore automatic VT switching");
            }
        }
        debug!(vt = ?self.vt_number, "stopped watching for VT changes");
    }

    fn on_leave_vt(&mut self) {
        trace!(vt = ?self.vt_number, "kernel requested VT release");
        self.acknowledge(VtAck::Release);
        self.is_active = false;
        self.notify_vt_changed();
    }

    fn on_enter_vt(&mut self) {
        trace!(vt = ?self.vt_number, "kernel handed VT back");
        self.acknowledge(VtAck::Acquire);
        self.is_active = true;
        self.notify_vt_changed();
    }

    fn acknowledge(&self, ack: VtAck) {
        if let Some(device) = self.device.as_ref() {
            if let Err(error) = device.acknowledge_vt(ack) {
                warn!(?ack, %error, "could not acknowledge VT switch");
            }
        }
    }

    fn query_active_vt(&mut self) -> Option<u32> {
        let device = self.device.as_ref()?;
        match device.active_vt() {
            Ok(active) => {
                if self.initial_vt_number.is_none() {
                    self.initial_vt_number = Some(active);
                }
                Some(active)
            }
            Err(error) => {
                debug!(%error, "could not query active VT");
                None
            }
        }
    }

    /// Bring this terminal's VT on screen
    ///
    /// # Errors
    ///
    /// [`TerminalError::NotAVt`] on a non-VT (no kernel call is made), or the
    /// device error if the switch fails.
    pub fn activate_vt(&mut self) -> Result<(), TerminalError> {
        let vt_number = self
            .vt_number
            .ok_or_else(|| TerminalError::NotAVt(self.name.clone()))?;

        if self.is_active {
            return Ok(());
        }

        let device = self.device.as_ref().ok_or(TerminalError::NotOpen)?;
        device.activate_vt(vt_number)?;
        Ok(())
    }

    /// Switch back to the VT that was on screen at first open and free ours
    ///
    /// The handshake is disarmed first so the release that the switch
    /// triggers is not handled against a terminal being torn down.
    ///
    /// # Errors
    ///
    /// Rejected without any kernel call when the device is not a VT, when the
    /// initial VT is unknown, or when this terminal *is* the initial VT.
    pub fn deactivate_vt(&mut self, event_loop: &mut dyn EventLoop) -> Result<(), TerminalError> {
        let vt_number = self
            .vt_number
            .ok_or_else(|| TerminalError::NotAVt(self.name.clone()))?;
        let initial = self
            .initial_vt_number
            .ok_or(TerminalError::UnknownInitialVt)?;
        if initial == vt_number {
            return Err(TerminalError::InitialVt(vt_number));
        }

        self.stop_watching_for_vt_changes(event_loop);

        let device = self.device.as_ref().ok_or(TerminalError::NotOpen)?;
        if self.is_active {
            device.activate_vt(initial)?;
            self.is_active = false;
        }

        device.deallocate_vt(vt_number)?;
        info!(vt = vt_number, initial, "deallocated VT");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Listeners
    // -------------------------------------------------------------------------

    /// Register a listener; duplicates are allowed. Ignored on a non-VT.
    pub fn add_vt_change_listener(&mut self, listener: Rc<dyn VtChangeListener>) {
        if !self.is_vt() {
            return;
        }
        self.listeners.push(listener);
    }

    /// Remove every registration of `listener`. Ignored on a non-VT.
    pub fn remove_vt_change_listener(&mut self, listener: &Rc<dyn VtChangeListener>) {
        if !self.is_vt() {
            return;
        }
        self.listeners
            .retain(|registered| !Rc::ptr_eq(registered, listener));
    }

    /// Number of registered listeners
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn notify_vt_changed(&self) {
        let Some(vt_number) = self.vt_number else {
            return;
        };
        let change = VtChange {
            vt_number,
            active: self.is_active,
        };
        for listener in &self.listeners {
            listener.vt_changed(change);
        }
    }

    // -------------------------------------------------------------------------
    // Output
    // -------------------------------------------------------------------------

    /// Write text to the console
    ///
    /// # Errors
    ///
    /// Fails if the device is not open or the write fails.
    pub fn write(&self, text: &str) -> Result<(), TerminalError> {
        let device = self.device.as_ref().ok_or(TerminalError::NotOpen)?;
        device.write(text.as_bytes())?;
        Ok(())
    }
}

impl Drop for Terminal {
    fn drop(&mut self) {
        let Some(device) = self.device.as_ref() else {
            return;
        };
        if self.is_watching_for_vt_changes {
            if let Err(error) = device.set_vt_mode(VtMode::Auto) {
                warn!(%error, "could not restore automatic VT switching");
            }
        }
        if self.supports_color {
            if let Err(error) = device.set_color_palette(&self.original_palette) {
                warn!(%error, "could not restore color palette");
            }
        }
        if let Err(error) = self.set_buffered_input() {
            warn!(%error, "could not restore buffered input");
        }
    }
}

impl fmt::Debug for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Terminal")
            .field("name", &self.name)
            .field("vt_number", &self.vt_number)
            .field("initial_vt_number", &self.initial_vt_number)
            .field("is_open", &self.is_open)
            .field("is_active", &self.is_active)
            .field("is_unbuffered", &self.is_unbuffered)
            .field("is_watching_for_vt_changes", &self.is_watching_for_vt_changes)
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}
