//! Console device access
//!
//! Every kernel call the terminal manager makes goes through [`TtyDevice`].
//! [`LinuxTty`] issues the real termios and VT ioctls; tests substitute a
//! recording fake (see [`crate::test_utils::FakeConsole`]).

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt};
use std::os::unix::io::RawFd;
use std::path::Path;

use nix::errno::Errno;
use nix::sys::termios::{self, SetArg, Termios};

use super::palette::{ColorPalette, PALETTE_SIZE};

/// Rows and columns of a text console
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowSize {
    /// Number of text rows
    pub rows: u16,
    /// Number of text columns
    pub columns: u16,
}

/// How the kernel switches away from a VT
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VtMode {
    /// Kernel switches on its own
    Auto,
    /// Kernel asks the owning process first, signalling `release` and `acquire`
    Process {
        /// Signal raised when another VT wants the display
        release: nix::sys::signal::Signal,
        /// Signal raised once the display is handed back
        acquire: nix::sys::signal::Signal,
    },
}

/// Acknowledgement sent in response to a handshake signal
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VtAck {
    /// Allow the pending switch away from this VT
    Release,
    /// Confirm this VT has been switched to
    Acquire,
}

/// KDSETMODE display mode
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsoleMode {
    /// Kernel renders text
    Text,
    /// A process owns the framebuffer
    Graphics,
}

/// An open console device
pub trait TtyDevice {
    /// Raw descriptor, for event loop registration
    fn raw_fd(&self) -> RawFd;

    /// `(major, minor)` if the device is a character device
    fn device_number(&self) -> io::Result<Option<(u64, u64)>>;

    /// Current line discipline settings
    fn attributes(&self) -> nix::Result<Termios>;

    /// Apply line discipline settings
    fn set_attributes(&self, when: SetArg, attributes: &Termios) -> nix::Result<()>;

    /// TIOCGWINSZ
    fn window_size(&self) -> nix::Result<WindowSize>;

    /// GIO_CMAP
    fn color_palette(&self) -> nix::Result<ColorPalette>;

    /// PIO_CMAP
    fn set_color_palette(&self, palette: &ColorPalette) -> nix::Result<()>;

    /// VT_GETSTATE; number of the VT currently on screen
    fn active_vt(&self) -> nix::Result<u32>;

    /// VT_ACTIVATE
    fn activate_vt(&self, vt_number: u32) -> nix::Result<()>;

    /// VT_DISALLOCATE
    fn deallocate_vt(&self, vt_number: u32) -> nix::Result<()>;

    /// VT_SETMODE
    fn set_vt_mode(&self, mode: VtMode) -> nix::Result<()>;

    /// VT_RELDISP
    fn acknowledge_vt(&self, ack: VtAck) -> nix::Result<()>;

    /// KDSETMODE
    fn set_console_mode(&self, mode: ConsoleMode) -> nix::Result<()>;

    /// Write bytes to the console
    fn write(&self, bytes: &[u8]) -> io::Result<()>;
}

/// Opens console devices by path
pub trait TtyOpener {
    /// Open `path` for reading and writing without acquiring it as the
    /// controlling terminal
    ///
    /// # Errors
    ///
    /// Returns the I/O error from opening the device node.
    fn open(&mut self, path: &Path) -> io::Result<Box<dyn TtyDevice>>;
}

// =============================================================================
// Linux implementation
// =============================================================================

/// `TTY_MAJOR` from `<linux/major.h>`
pub const TTY_MAJOR: u64 = 4;

/// `MAX_NR_CONSOLES` from `<linux/vt.h>`
pub const MAX_NR_CONSOLES: u64 = 63;

const VT_AUTO: libc::c_char = 0;
const VT_PROCESS: libc::c_char = 1;
const VT_ACKACQ: libc::c_int = 2;
const KD_TEXT: libc::c_int = 0;
const KD_GRAPHICS: libc::c_int = 1;

fn vt_argument(vt_number: u32) -> nix::Result<libc::c_int> {
    libc::c_int::try_from(vt_number).map_err(|_| Errno::EINVAL)
}

mod ioctl {
    use super::PALETTE_SIZE;

    /// `struct vt_stat`
    #[repr(C)]
    #[derive(Default)]
    #[allow(dead_code)]
    pub struct VtStat {
        pub v_active: libc::c_ushort,
        pub v_signal: libc::c_ushort,
        pub v_state: libc::c_ushort,
    }

    /// `struct vt_mode`
    #[repr(C)]
    #[allow(dead_code)]
    pub struct VtModeRaw {
        pub mode: libc::c_char,
        pub waitv: libc::c_char,
        pub relsig: libc::c_short,
        pub acqsig: libc::c_short,
        pub frsig: libc::c_short,
    }

    nix::ioctl_read_bad!(vt_getstate, 0x5603, VtStat);
    nix::ioctl_write_int_bad!(vt_activate, 0x5606);
    nix::ioctl_write_int_bad!(vt_disallocate, 0x5608);
    nix::ioctl_write_ptr_bad!(vt_setmode, 0x5602, VtModeRaw);
    nix::ioctl_write_int_bad!(vt_reldisp, 0x5605);
    nix::ioctl_write_int_bad!(kd_setmode, 0x4B3A);
    nix::ioctl_read_bad!(gio_cmap, 0x4B70, [u8; PALETTE_SIZE]);
    nix::ioctl_write_ptr_bad!(pio_cmap, 0x4B71, [u8; PALETTE_SIZE]);
    nix::ioctl_read_bad!(tiocgwinsz, libc::TIOCGWINSZ, libc::winsize);
}

use ioctl::{VtModeRaw, VtStat};

/// A console device node opened on Linux
#[derive(Debug)]
pub struct LinuxTty {
    file: File,
}

impl LinuxTty {
    /// Wrap an already opened device
    #[must_use]
    pub fn new(file: File) -> Self {
        Self { file }
    }
}

impl TtyDevice for LinuxTty {
    fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn device_number(&self) -> io::Result<Option<(u64, u64)>> {
        let metadata = self.file.metadata()?;
        if !metadata.file_type().is_char_device() {
            return Ok(None);
        }
        let rdev = metadata.rdev();
        Ok(Some((
            nix::sys::stat::major(rdev),
            nix::sys::stat::minor(rdev),
        )))
    }

    fn attributes(&self) -> nix::Result<Termios> {
        termios::tcgetattr(&self.file)
    }

    fn set_attributes(&self, when: SetArg, attributes: &Termios) -> nix::Result<()> {
        termios::tcsetattr(&self.file, when, attributes)
    }

    fn window_size(&self) -> nix::Result<WindowSize> {
        let mut size = libc::winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: `size` is a valid, writable winsize for the duration of the call.
        unsafe { ioctl::tiocgwinsz(self.raw_fd(), &mut size) }?;
        Ok(WindowSize {
            rows: size.ws_row,
            columns: size.ws_col,
        })
    }

    fn color_palette(&self) -> nix::Result<ColorPalette> {
        let mut palette = ColorPalette::default();
        // SAFETY: the kernel writes exactly PALETTE_SIZE bytes into the array.
        unsafe { ioctl::gio_cmap(self.raw_fd(), &mut palette.0) }?;
        Ok(palette)
    }

    fn set_color_palette(&self, palette: &ColorPalette) -> nix::Result<()> {
        // SAFETY: the kernel reads exactly PALETTE_SIZE bytes from the array.
        unsafe { ioctl::pio_cmap(self.raw_fd(), &palette.0) }?;
        Ok(())
    }

    fn active_vt(&self) -> nix::Result<u32> {
        let mut state = VtStat::default();
        // SAFETY: `state` matches `struct vt_stat` and outlives the call.
        unsafe { ioctl::vt_getstate(self.raw_fd(), &mut state) }?;
        Ok(u32::from(state.v_active))
    }

    fn activate_vt(&self, vt_number: u32) -> nix::Result<()> {
        let vt = vt_argument(vt_number)?;
        // SAFETY: integer argument, no memory is shared with the kernel.
        unsafe { ioctl::vt_activate(self.raw_fd(), vt) }?;
        Ok(())
    }

    fn deallocate_vt(&self, vt_number: u32) -> nix::Result<()> {
        let vt = vt_argument(vt_number)?;
        // SAFETY: integer argument, no memory is shared with the kernel.
        unsafe { ioctl::vt_disallocate(self.raw_fd(), vt) }?;
        Ok(())
    }

    fn set_vt_mode(&self, mode: VtMode) -> nix::Result<()> {
        let raw = match mode {
            VtMode::Auto => VtModeRaw {
                mode: VT_AUTO,
                waitv: 0,
                relsig: 0,
                acqsig: 0,
                frsig: 0,
            },
            #[allow(clippy::cast_possible_truncation)]
            VtMode::Process { release, acquire } => VtModeRaw {
                mode: VT_PROCESS,
                waitv: 0,
                relsig: release as libc::c_short,
                acqsig: acquire as libc::c_short,
                frsig: 0,
            },
        };
        // SAFETY: `raw` matches `struct vt_mode` and outlives the call.
        unsafe { ioctl::vt_setmode(self.raw_fd(), &raw) }?;
        Ok(())
    }

    fn acknowledge_vt(&self, ack: VtAck) -> nix::Result<()> {
        let value = match ack {
            VtAck::Release => 1,
            VtAck::Acquire => VT_ACKACQ,
        };
        // SAFETY: integer argument, no memory is shared with the kernel.
        unsafe { ioctl::vt_reldisp(self.raw_fd(), value) }?;
        Ok(())
    }

    fn set_console_mode(&self, mode: ConsoleMode) -> nix::Result<()> {
        let value = match mode {
            ConsoleMode::Text => KD_TEXT,
            ConsoleMode::Graphics => KD_GRAPHICS,
        };
        // SAFETY: integer argument, no memory is shared with the kernel.
        unsafe { ioctl::kd_setmode(self.raw_fd(), value) }?;
        Ok(())
    }

    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        (&self.file).write_all(bytes)
    }
}

/// Opens real device nodes with `O_RDWR | O_NOCTTY`
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxTtyOpener;

impl TtyOpener for LinuxTtyOpener {
    fn open(&mut self, path: &Path) -> io::Result<Box<dyn TtyDevice>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(path)?;
        Ok(Box::new(LinuxTty::new(file)))
    }
}

/// VT number for a console device, if it is one
///
/// Only `TTY_MAJOR` minors 1 through `MAX_NR_CONSOLES` are VTs; minor 0 is
/// `/dev/tty0`, an alias for whichever VT is current.
#[must_use]
pub fn vt_number_for(major: u64, minor: u64) -> Option<u32> {
    if major == TTY_MAJOR && (1..=MAX_NR_CONSOLES).contains(&minor) {
        u32::try_from(minor).ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vt_number_for_console_minors() {
        assert_eq!(vt_number_for(TTY_MAJOR, 1), Some(1));
        assert_eq!(vt_number_for(TTY_MAJOR, 63), Some(63));
    }

    #[test]
    fn test_vt_argument_fits_ioctl_int() {
        assert_eq!(vt_argument(7), Ok(7));
        assert_eq!(vt_argument(u32::MAX), Err(Errno::EINVAL));
    }

    #[test]
    fn test_vt_number_rejects_non_consoles() {
        // tty0 aliases the current VT
        assert_eq!(vt_number_for(TTY_MAJOR, 0), None);
        // ttyS0 shares the major but sits above the console range
        assert_eq!(vt_number_for(TTY_MAJOR, 64), None);
        // /dev/null
        assert_eq!(vt_number_for(1, 3), None);
    }

    #[test]
    fn test_open_missing_device_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = LinuxTtyOpener.open(&dir.path().join("tty-missing"));
        assert!(result.is_err());
    }

    #[test]
    fn test_regular_file_has_no_device_number() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let tty = LinuxTty::new(file.reopen().unwrap());
        assert_eq!(tty.device_number().unwrap(), None);
        assert!(tty.active_vt().is_err());
    }
}
