//! Byte-stream capability and the framed stream built on top of it.
//!
//! [`DataStream`] is the session core's view of a connected transport.  The
//! contract is the non-blocking one:
//!
//! - `read` returns `Ok(0)` when the peer closed, `ErrorKind::WouldBlock`
//!   when nothing is buffered, `Ok(n)` otherwise.
//! - `write` may accept fewer bytes than offered and returns `WouldBlock`
//!   when the send buffer is full.
//!
//! TLS, certificate checks, and socket options all live behind this trait;
//! a production build wraps its secure socket here, tests wrap an in-memory
//! [`PipeStream`].
//!
//! [`FrameStream`] couples a `DataStream` with frame reassembly on the read
//! side and a pending-write queue on the write side, so dispatcher handlers
//! never block: a short write parks the remainder and raises write interest
//! for the multiplexer.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::protocol::frame::{frame_bytes, FrameBuffer};
use crate::protocol::wire::FrameError;

/// A connected, non-blocking byte stream.
pub trait DataStream: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
    /// Closes both directions.  Idempotent.
    fn close(&mut self);
}

impl DataStream for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Write::write(self, buf)
    }

    fn close(&mut self) {
        let _ = self.shutdown(std::net::Shutdown::Both);
    }
}

// ── In-memory pipe ────────────────────────────────────────────────────────────

struct PipeBuf {
    data: VecDeque<u8>,
    closed: bool,
    capacity: usize,
}

impl PipeBuf {
    fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::new(),
            closed: false,
            capacity,
        }
    }
}

/// One end of an in-memory duplex stream with the same `WouldBlock`
/// semantics as a non-blocking socket.  Clones share the same buffers, so a
/// clone can serve as a readiness probe while the original is owned by a
/// [`FrameStream`].
#[derive(Clone)]
pub struct PipeStream {
    incoming: Arc<Mutex<PipeBuf>>,
    outgoing: Arc<Mutex<PipeBuf>>,
}

impl PipeStream {
    /// Creates a connected pair with effectively unbounded buffers.
    pub fn pair() -> (PipeStream, PipeStream) {
        Self::pair_with_capacity(usize::MAX)
    }

    /// Creates a connected pair whose per-direction buffer is capped, for
    /// exercising write backpressure.
    pub fn pair_with_capacity(capacity: usize) -> (PipeStream, PipeStream) {
        let a_to_b = Arc::new(Mutex::new(PipeBuf::new(capacity)));
        let b_to_a = Arc::new(Mutex::new(PipeBuf::new(capacity)));
        let a = PipeStream {
            incoming: Arc::clone(&b_to_a),
            outgoing: Arc::clone(&a_to_b),
        };
        let b = PipeStream {
            incoming: a_to_b,
            outgoing: b_to_a,
        };
        (a, b)
    }

    /// True when a read would make progress (data buffered or peer closed).
    pub fn poll_readable(&self) -> bool {
        let buf = self.incoming.lock().unwrap();
        !buf.data.is_empty() || buf.closed
    }

    /// True when a write would make progress.
    pub fn poll_writable(&self) -> bool {
        let buf = self.outgoing.lock().unwrap();
        buf.closed || buf.data.len() < buf.capacity
    }
}

impl DataStream for PipeStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.incoming.lock().unwrap();
        if inner.data.is_empty() {
            if inner.closed {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(inner.data.len());
        for slot in buf.iter_mut().take(n) {
            *slot = inner.data.pop_front().unwrap();
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.outgoing.lock().unwrap();
        if inner.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let room = inner.capacity - inner.data.len();
        if room == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(room);
        inner.data.extend(&buf[..n]);
        Ok(n)
    }

    fn close(&mut self) {
        self.incoming.lock().unwrap().closed = true;
        self.outgoing.lock().unwrap().closed = true;
    }
}

// ── Framed stream ─────────────────────────────────────────────────────────────

/// Outcome of pulling buffered bytes off the transport.
#[derive(Debug, PartialEq, Eq)]
pub enum FillOutcome {
    /// Drained everything currently available; connection still up.
    Drained,
    /// The peer closed the stream (possibly after delivering bytes).
    Closed,
}

/// A [`DataStream`] with length-prefix framing and non-blocking writes.
pub struct FrameStream {
    stream: Box<dyn DataStream>,
    rbuf: FrameBuffer,
    wpending: VecDeque<u8>,
}

impl FrameStream {
    pub fn new(stream: Box<dyn DataStream>) -> Self {
        Self {
            stream,
            rbuf: FrameBuffer::new(),
            wpending: VecDeque::new(),
        }
    }

    /// Reads until `WouldBlock` or EOF, feeding the frame buffer.
    ///
    /// # Errors
    ///
    /// Propagates transport errors other than `WouldBlock`; the caller
    /// treats those as a dead stream.
    pub fn fill(&mut self) -> io::Result<FillOutcome> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(FillOutcome::Closed),
                Ok(n) => self.rbuf.feed(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FillOutcome::Drained)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Pops the next complete frame payload, if one has arrived.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        self.rbuf.next_frame()
    }

    /// True when at least one full frame is buffered.
    pub fn has_frame(&self) -> bool {
        self.rbuf.has_frame()
    }

    /// Raw buffered bytes; used only while parsing the unframed hello.
    pub fn buffered(&self) -> &[u8] {
        self.rbuf.buffered()
    }

    /// Discards `n` buffered bytes consumed by the hello parser.
    pub fn consume(&mut self, n: usize) {
        self.rbuf.consume(n);
    }

    /// Queues one frame (length prefix + payload) and flushes as much as
    /// the transport will take.
    pub fn write_frame(&mut self, payload: &[u8]) -> io::Result<()> {
        self.wpending.extend(frame_bytes(payload));
        self.flush().map(|_| ())
    }

    /// Queues raw bytes (the unframed hello) and flushes.
    pub fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.wpending.extend(bytes);
        self.flush().map(|_| ())
    }

    /// Pushes pending bytes into the transport.  Returns `true` when the
    /// queue fully drained; `false` means the socket pushed back and write
    /// interest should stay raised.
    pub fn flush(&mut self) -> io::Result<bool> {
        while !self.wpending.is_empty() {
            let (front, _) = self.wpending.as_slices();
            match self.stream.write(front) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.wpending.drain(..n);
                    trace!(flushed = n, pending = self.wpending.len(), "stream write");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// True while unflushed output is parked.
    pub fn wants_write(&self) -> bool {
        !self.wpending.is_empty()
    }

    pub fn close(&mut self) {
        self.stream.close();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_carries_bytes_between_ends() {
        let (mut a, mut b) = PipeStream::pair();
        a.write(b"ping").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(b.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
    }

    #[test]
    fn test_pipe_empty_read_is_would_block() {
        let (_a, mut b) = PipeStream::pair();
        let mut buf = [0u8; 4];
        assert_eq!(
            b.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
    }

    #[test]
    fn test_pipe_read_after_close_returns_zero() {
        let (mut a, mut b) = PipeStream::pair();
        a.write(b"last").unwrap();
        a.close();
        let mut buf = [0u8; 16];
        assert_eq!(b.read(&mut buf).unwrap(), 4);
        assert_eq!(b.read(&mut buf).unwrap(), 0, "EOF after buffered bytes drain");
    }

    #[test]
    fn test_pipe_capacity_causes_would_block() {
        let (mut a, _b) = PipeStream::pair_with_capacity(4);
        assert_eq!(a.write(b"123456").unwrap(), 4, "partial write up to capacity");
        assert_eq!(
            a.write(b"x").unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
    }

    #[test]
    fn test_frame_stream_round_trip() {
        let (a, b) = PipeStream::pair();
        let mut tx = FrameStream::new(Box::new(a));
        let mut rx = FrameStream::new(Box::new(b));

        tx.write_frame(b"DMMV rest").unwrap();
        assert_eq!(rx.fill().unwrap(), FillOutcome::Drained);
        assert_eq!(rx.next_frame().unwrap(), Some(b"DMMV rest".to_vec()));
    }

    #[test]
    fn test_frame_stream_parks_writes_under_backpressure() {
        let (a, b) = PipeStream::pair_with_capacity(8);
        let mut tx = FrameStream::new(Box::new(a));
        let mut rx = FrameStream::new(Box::new(b));

        tx.write_frame(b"a long payload that will not fit").unwrap();
        assert!(tx.wants_write(), "unflushed tail must be parked");

        // receiver drains, sender flushes the rest
        while tx.wants_write() {
            rx.fill().unwrap();
            tx.flush().unwrap();
        }
        rx.fill().unwrap();
        assert_eq!(
            rx.next_frame().unwrap(),
            Some(b"a long payload that will not fit".to_vec())
        );
    }

    #[test]
    fn test_frame_stream_reports_peer_close() {
        let (mut a, b) = PipeStream::pair();
        let mut rx = FrameStream::new(Box::new(b));
        a.close();
        assert_eq!(rx.fill().unwrap(), FillOutcome::Closed);
    }

    #[test]
    fn test_frame_stream_raw_then_framed() {
        // the handshake writes raw bytes before framing starts
        let (a, b) = PipeStream::pair();
        let mut tx = FrameStream::new(Box::new(a));
        let mut rx = FrameStream::new(Box::new(b));

        tx.write_raw(b"HELLOHDR").unwrap();
        tx.write_frame(b"framed").unwrap();

        rx.fill().unwrap();
        assert_eq!(&rx.buffered()[..8], b"HELLOHDR");
        rx.consume(8);
        assert_eq!(rx.next_frame().unwrap(), Some(b"framed".to_vec()));
    }
}
