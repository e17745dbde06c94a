//! Length-prefixed framing over a byte stream.
//!
//! Wire format: `u32` big-endian payload length, then exactly that many
//! payload bytes.  [`frame_bytes`] is the write half; [`FrameBuffer`] is the
//! read half, built for non-blocking streams that deliver data in arbitrary
//! slices — feed it whatever arrived, pop complete frames as they form.

use super::wire::{FrameError, MAX_FRAME_LEN};

/// Prepends the length prefix so the whole frame goes out in one write.
pub fn frame_bytes(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Incremental frame reassembly buffer.
///
/// Bytes go in via [`FrameBuffer::feed`]; complete frames come out via
/// [`FrameBuffer::next_frame`].  A short read at stream end simply leaves an
/// incomplete frame in the buffer — the session layer treats the stream as
/// closed and discards it.
#[derive(Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw stream bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes currently buffered (complete or not).
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Discards `n` buffered bytes from the front.  Used by the handshake,
    /// which is parsed raw rather than as a frame.
    pub fn consume(&mut self, n: usize) {
        self.buf.drain(..n);
    }

    /// True when at least one complete frame is buffered.
    pub fn has_frame(&self) -> bool {
        if self.buf.len() < 4 {
            return false;
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        len <= MAX_FRAME_LEN && self.buf.len() >= 4 + len
    }

    /// Pops the next complete frame payload, or `None` if one has not fully
    /// arrived yet.
    ///
    /// # Errors
    ///
    /// [`FrameError::Oversized`] when the declared length exceeds
    /// [`MAX_FRAME_LEN`]; the caller must close the stream — the buffer
    /// cannot resynchronise past a bogus length.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(FrameError::Oversized {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        let payload = self.buf[4..4 + len].to_vec();
        self.buf.drain(..4 + len);
        Ok(Some(payload))
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_bytes_prepends_length() {
        let framed = frame_bytes(b"CNOP");
        assert_eq!(&framed[..4], &4u32.to_be_bytes());
        assert_eq!(&framed[4..], b"CNOP");
    }

    #[test]
    fn test_single_frame_round_trip() {
        let mut fb = FrameBuffer::new();
        fb.feed(&frame_bytes(b"hello"));
        assert_eq!(fb.next_frame().unwrap(), Some(b"hello".to_vec()));
        assert_eq!(fb.next_frame().unwrap(), None);
    }

    #[test]
    fn test_frame_split_across_feeds() {
        let framed = frame_bytes(b"split me");
        let mut fb = FrameBuffer::new();
        for byte in &framed[..framed.len() - 1] {
            fb.feed(std::slice::from_ref(byte));
            assert_eq!(fb.next_frame().unwrap(), None);
        }
        fb.feed(&framed[framed.len() - 1..]);
        assert_eq!(fb.next_frame().unwrap(), Some(b"split me".to_vec()));
    }

    #[test]
    fn test_multiple_frames_in_one_feed_pop_in_order() {
        let mut bytes = frame_bytes(b"one");
        bytes.extend_from_slice(&frame_bytes(b"two"));
        bytes.extend_from_slice(&frame_bytes(b"three"));
        let mut fb = FrameBuffer::new();
        fb.feed(&bytes);
        assert_eq!(fb.next_frame().unwrap(), Some(b"one".to_vec()));
        assert_eq!(fb.next_frame().unwrap(), Some(b"two".to_vec()));
        assert_eq!(fb.next_frame().unwrap(), Some(b"three".to_vec()));
        assert_eq!(fb.next_frame().unwrap(), None);
    }

    #[test]
    fn test_empty_frame_is_legal() {
        let mut fb = FrameBuffer::new();
        fb.feed(&frame_bytes(b""));
        assert_eq!(fb.next_frame().unwrap(), Some(Vec::new()));
    }

    #[test]
    fn test_oversized_length_is_rejected() {
        let mut fb = FrameBuffer::new();
        fb.feed(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes());
        assert!(matches!(
            fb.next_frame(),
            Err(FrameError::Oversized { .. })
        ));
    }

    #[test]
    fn test_consume_supports_raw_handshake_bytes() {
        let mut fb = FrameBuffer::new();
        fb.feed(b"RAWHDR");
        fb.feed(&frame_bytes(b"framed"));
        assert_eq!(&fb.buffered()[..6], b"RAWHDR");
        fb.consume(6);
        assert_eq!(fb.next_frame().unwrap(), Some(b"framed".to_vec()));
    }
}
