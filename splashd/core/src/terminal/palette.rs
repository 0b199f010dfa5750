//! Console text color palette
//!
//! The kernel exposes the VT color map as 16 RGB triples (48 bytes). Splash
//! themes address entries by [`TerminalColor`] and exchange colors as packed
//! `0xRRGGBB` values.

/// Number of bytes in the kernel color map (16 entries, 3 bytes each)
pub const PALETTE_SIZE: usize = 48;

/// Text colors addressable by splash themes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum TerminalColor {
    Black = 0,
    Red,
    Green,
    Brown,
    Blue,
    Magenta,
    Cyan,
    White,
}

impl TerminalColor {
    fn offset(self) -> usize {
        3 * self as usize
    }
}

/// A 16-entry RGB color map as read from or written to the console
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColorPalette(pub [u8; PALETTE_SIZE]);

impl Default for ColorPalette {
    fn default() -> Self {
        Self([0; PALETTE_SIZE])
    }
}

impl ColorPalette {
    /// Packed `0xRRGGBB` value for `color`
    #[must_use]
    pub fn hex_value(&self, color: TerminalColor) -> u32 {
        let at = color.offset();
        u32::from(self.0[at]) << 16 | u32::from(self.0[at + 1]) << 8 | u32::from(self.0[at + 2])
    }

    /// Store a packed `0xRRGGBB` value for `color`; bits above 24 are ignored
    pub fn set_hex_value(&mut self, color: TerminalColor, hex_value: u32) {
        let at = color.offset();
        let [_, red, green, blue] = hex_value.to_be_bytes();
        self.0[at] = red;
        self.0[at + 1] = green;
        self.0[at + 2] = blue;
    }
}
