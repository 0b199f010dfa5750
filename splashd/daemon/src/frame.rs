//! Frame Protocol
//!
//! Wire format between boot clients and the daemon: length-prefixed JSON
//! with a CRC32 checksum.
//!
//! # Frame Format
//!
//! ```text
//! +----------------+----------------+------------------------------------------+
//! | Length (4)     | Checksum (4)   | JSON Payload (variable)                  |
//! | big-endian u32 | CRC32 BE       | ClientRequest or Reply                   |
//! +----------------+----------------+------------------------------------------+
//! ```
//!
//! The length covers the payload only. Frames larger than [`MAX_FRAME_SIZE`]
//! are rejected before any buffer is allocated for them.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Maximum payload size (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Frame header size: 4 bytes length + 4 bytes checksum
pub const HEADER_SIZE: usize = 8;

const MIN_BUFFER_CAPACITY: usize = 1024;

/// Errors from encoding or decoding frames
#[derive(Debug, Error)]
pub enum FrameError {
    /// Payload exceeds [`MAX_FRAME_SIZE`]
    #[error("frame too large: {size} bytes (max: {max})")]
    TooLarge {
        /// Announced or actual payload size
        size: usize,
        /// Limit
        max: usize,
    },

    /// Payload does not match its checksum
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried in the header
        expected: u32,
        /// Checksum of the received payload
        actual: u32,
    },

    /// Payload is not the expected JSON
    #[error("invalid frame payload: {0}")]
    Json(#[from] serde_json::Error),
}

#[inline]
fn compute_checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// Encode a message as `[Length][Checksum][JSON]`
///
/// # Errors
///
/// Returns [`FrameError::Json`] if serialization fails, or
/// [`FrameError::TooLarge`] if the payload exceeds the limit.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameError> {
    let json = serde_json::to_vec(msg)?;
    let len = u32::try_from(json.len())
        .ok()
        .filter(|_| json.len() <= MAX_FRAME_SIZE)
        .ok_or(FrameError::TooLarge {
            size: json.len(),
            max: MAX_FRAME_SIZE,
        })?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&compute_checksum(&json).to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Buffers incoming bytes and yields complete messages
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    read_pos: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
        }
    }

    /// Append bytes read from the socket
    pub fn push(&mut self, data: &[u8]) {
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet decoded
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Decode the next complete frame
    ///
    /// Returns `Ok(None)` when more data is needed.
    ///
    /// # Errors
    ///
    /// Oversized frames, checksum mismatches and malformed JSON are errors;
    /// the connection should be dropped since the stream cannot be resynced.
    pub fn decode<T: DeserializeOwned>(&mut self) -> Result<Option<T>, FrameError> {
        let available = self.available();
        if available < HEADER_SIZE {
            return Ok(None);
        }

        let header = &self.buffer[self.read_pos..self.read_pos + HEADER_SIZE];
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

        if len > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }
        if available < HEADER_SIZE + len {
            return Ok(None);
        }

        let payload_start = self.read_pos + HEADER_SIZE;
        let payload_end = payload_start + len;
        let payload = &self.buffer[payload_start..payload_end];

        let actual = compute_checksum(payload);
        if actual != expected {
            return Err(FrameError::ChecksumMismatch { expected, actual });
        }

        let msg = serde_json::from_slice(payload)?;
        self.read_pos = payload_end;
        Ok(Some(msg))
    }

    /// Drop everything buffered
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
    }
}
