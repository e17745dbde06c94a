//! Low-level field codec for the Edgehop wire protocol.
//!
//! Every frame payload is a flat sequence of big-endian fields:
//!
//! - integers: `i8`/`u8` (1 byte), `i16`/`u16` (2 bytes), `i32`/`u32` (4 bytes)
//! - strings and raw blobs: `u32` length followed by that many bytes
//! - lists: `u32` element count followed by the elements
//!
//! [`PayloadReader`] and [`PayloadWriter`] are the only places byte order and
//! length prefixes are dealt with; the message catalog in
//! [`super::messages`] composes them per message.
//!
//! Decoding is strict: a payload with bytes left over after the last expected
//! field is malformed, not "extensible".  A peer that appends fields we do not
//! know about is speaking a different protocol version and must say so in the
//! handshake instead.

use thiserror::Error;

/// Hard ceiling on a single frame's payload length.
///
/// Anything larger is rejected before allocation so one misbehaving peer
/// cannot take the whole process down with it (the offending session is
/// closed instead).  Chunked transfers keep well below this: data chunks are
/// capped at 32 KiB.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Errors produced while encoding or decoding frame payloads.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The payload ended before the expected field.
    #[error("truncated payload: need {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    /// Bytes were left over after the last field of the message.
    #[error("malformed payload: {remaining} trailing byte(s) after last field")]
    TrailingBytes { remaining: usize },

    /// A field value was out of range, not valid UTF-8, or otherwise bogus.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// The 4-byte message code is not in the catalog.
    #[error("unknown message code: {0:?}")]
    UnknownCode([u8; 4]),

    /// A declared length exceeds [`MAX_FRAME_LEN`].
    #[error("oversized frame: {len} bytes exceeds limit of {max}")]
    Oversized { len: usize, max: usize },

    /// The handshake header did not begin with the protocol magic.
    #[error("bad handshake magic")]
    BadMagic,
}

// ── Reader ────────────────────────────────────────────────────────────────────

/// Sequential reader over one frame payload.
///
/// Call the `read_*` methods in field order, then [`PayloadReader::finish`]
/// to assert the payload is fully consumed.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FrameError> {
        if self.remaining() < n {
            return Err(FrameError::Truncated {
                needed: n,
                available: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, FrameError> {
        Ok(self.take(1)?[0] as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16, FrameError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_i16(&mut self) -> Result<i16, FrameError> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, FrameError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, FrameError> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a `u32` length prefix and that many raw bytes.
    pub fn read_blob(&mut self) -> Result<Vec<u8>, FrameError> {
        let len = self.read_u32()? as usize;
        if len > MAX_FRAME_LEN {
            return Err(FrameError::Oversized {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        Ok(self.take(len)?.to_vec())
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, FrameError> {
        let bytes = self.read_blob()?;
        String::from_utf8(bytes)
            .map_err(|e| FrameError::Malformed(format!("invalid UTF-8 in string field: {e}")))
    }

    /// Reads a `u32` count followed by that many `u32` elements.
    pub fn read_u32_list(&mut self) -> Result<Vec<u32>, FrameError> {
        let count = self.read_u32()? as usize;
        if count > MAX_FRAME_LEN / 4 {
            return Err(FrameError::Oversized {
                len: count * 4,
                max: MAX_FRAME_LEN,
            });
        }
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.read_u32()?);
        }
        Ok(out)
    }

    /// Asserts the payload is fully consumed.
    pub fn finish(self) -> Result<(), FrameError> {
        if self.remaining() != 0 {
            return Err(FrameError::TrailingBytes {
                remaining: self.remaining(),
            });
        }
        Ok(())
    }
}

// ── Writer ────────────────────────────────────────────────────────────────────

/// Composes one frame payload in memory.
///
/// The write path is single-copy: the payload is built here, the frame layer
/// prepends the length prefix, and the whole buffer goes to the stream in one
/// write call.
#[derive(Default)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a payload with the given 4-byte message code.
    pub fn with_code(code: [u8; 4]) -> Self {
        let mut w = Self::default();
        w.buf.extend_from_slice(&code);
        w
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn write_i8(&mut self, v: i8) -> &mut Self {
        self.buf.push(v as u8);
        self
    }

    pub fn write_u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_i16(&mut self, v: i16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_blob(&mut self, bytes: &[u8]) -> &mut Self {
        self.write_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn write_string(&mut self, s: &str) -> &mut Self {
        self.write_blob(s.as_bytes())
    }

    pub fn write_u32_list(&mut self, items: &[u32]) -> &mut Self {
        self.write_u32(items.len() as u32);
        for item in items {
            self.write_u32(*item);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
