//! Chunked transfer pipeline for clipboard blobs and dragged files.
//!
//! Large payloads travel as a `Start / Data* / End` stream of sub-frames so
//! they never monopolise the single TCP stream that also carries input
//! events.  Data chunks are capped at 32 KiB, which bounds both peak buffer
//! use and head-of-line blocking.
//!
//! The send side ([`Chunker`]) is a producer loop that runs on its own
//! thread and talks to the session exclusively through dispatcher events —
//! the session's handler turns each event into one frame on the wire, so
//! the producer is naturally paced by how fast the dispatcher drains.  The
//! receive side ([`ChunkAssembler`]) runs on the dispatcher thread and
//! rebuilds the payload.
//!
//! The interrupt flag is owned by the [`Chunker`] instance, i.e. it is
//! per-session: one session aborting its file send can never abort a
//! transfer belonging to a different session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::event::{Event, EventData, EventSink, EventType, Target};
use crate::protocol::messages::Message;

/// Ceiling for one data chunk.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Sub-frame marks within a chunked transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkMark {
    Start = 0x01,
    Data = 0x02,
    End = 0x03,
}

impl TryFrom<u8> for ChunkMark {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0x01 => Ok(ChunkMark::Start),
            0x02 => Ok(ChunkMark::Data),
            0x03 => Ok(ChunkMark::End),
            other => Err(other),
        }
    }
}

// ── Chunk builders ────────────────────────────────────────────────────────────

/// One sub-frame of a clipboard transfer: `{ id, sequence, mark, payload }`.
///
/// `sequence` is the grab sequence of the clipboard snapshot; it is chosen
/// by the sender and increases monotonically per `(id, direction)` so a
/// receiver can discard chunks of a superseded snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipboardChunk {
    pub id: u8,
    pub sequence: u32,
    pub mark: ChunkMark,
    pub payload: Vec<u8>,
}

impl ClipboardChunk {
    /// The opening chunk; its payload is the total size in ASCII decimal.
    pub fn start(id: u8, sequence: u32, total_size: usize) -> Self {
        Self {
            id,
            sequence,
            mark: ChunkMark::Start,
            payload: total_size.to_string().into_bytes(),
        }
    }

    pub fn data(id: u8, sequence: u32, payload: Vec<u8>) -> Self {
        Self {
            id,
            sequence,
            mark: ChunkMark::Data,
            payload,
        }
    }

    pub fn end(id: u8, sequence: u32) -> Self {
        Self {
            id,
            sequence,
            mark: ChunkMark::End,
            payload: Vec::new(),
        }
    }

    /// The wire message for this chunk.
    pub fn to_message(&self) -> Message {
        Message::ClipboardChunk {
            id: self.id,
            seq: self.sequence,
            mark: self.mark as u8,
            payload: self.payload.clone(),
        }
    }
}

/// One sub-frame of a file transfer: `{ mark, payload }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub mark: ChunkMark,
    pub payload: Vec<u8>,
}

impl FileChunk {
    pub fn start(total_size: usize) -> Self {
        Self {
            mark: ChunkMark::Start,
            payload: total_size.to_string().into_bytes(),
        }
    }

    pub fn data(payload: Vec<u8>) -> Self {
        Self {
            mark: ChunkMark::Data,
            payload,
        }
    }

    pub fn end() -> Self {
        Self {
            mark: ChunkMark::End,
            payload: Vec::new(),
        }
    }

    pub fn to_message(&self) -> Message {
        Message::FileChunk {
            mark: self.mark as u8,
            payload: self.payload.clone(),
        }
    }
}

// ── Producer ──────────────────────────────────────────────────────────────────

/// Per-session chunk producer.
///
/// Cheap to clone; clones share the same in-flight and interrupt flags, so
/// the session keeps one and hands another to the producer thread.
#[derive(Clone, Default)]
pub struct Chunker {
    chunking_file: Arc<AtomicBool>,
    interrupt_file: Arc<AtomicBool>,
}

impl Chunker {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a file send loop is running.
    pub fn is_chunking_file(&self) -> bool {
        self.chunking_file.load(Ordering::Acquire)
    }

    /// Asks the in-flight file send, if any, to stop at its next chunk
    /// boundary.  The interrupted producer emits no `End` chunk, so the
    /// receiver sees the transfer as abandoned rather than complete.
    pub fn interrupt_file(&self) {
        if self.chunking_file.load(Ordering::Acquire) {
            debug!("interrupting in-flight file transfer");
            self.interrupt_file.store(true, Ordering::Release);
        }
    }

    /// Chunks `data` into `FileChunkSending` events on `target`, with a
    /// `FileKeepAlive` event before every data chunk.  Blocking; run it on a
    /// producer thread.  Returns `false` when the send was interrupted.
    pub fn send_file(&self, data: &[u8], sink: &EventSink, target: Target) -> bool {
        self.chunking_file.store(true, Ordering::Release);

        sink.add_event(Event::with_data(
            EventType::FileChunkSending,
            target,
            EventData::FileChunk(FileChunk::start(data.len())),
        ));

        let mut offset = 0;
        let mut interrupted = false;
        while offset < data.len() {
            if self.interrupt_file.swap(false, Ordering::AcqRel) {
                debug!("file transmission interrupted");
                interrupted = true;
                break;
            }

            sink.add_event(Event::new(EventType::FileKeepAlive, target));

            let end = (offset + CHUNK_SIZE).min(data.len());
            sink.add_event(Event::with_data(
                EventType::FileChunkSending,
                target,
                EventData::FileChunk(FileChunk::data(data[offset..end].to_vec())),
            ));
            offset = end;
        }

        if !interrupted {
            sink.add_event(Event::with_data(
                EventType::FileChunkSending,
                target,
                EventData::FileChunk(FileChunk::end()),
            ));
        }

        self.chunking_file.store(false, Ordering::Release);
        !interrupted
    }

    /// Chunks a marshalled clipboard snapshot into `ClipboardSending`
    /// events.  Clipboard sends are short and not interruptible; a newer
    /// grab simply supersedes them by sequence number.
    pub fn send_clipboard(
        &self,
        id: u8,
        sequence: u32,
        data: &[u8],
        sink: &EventSink,
        target: Target,
    ) {
        sink.add_event(Event::with_data(
            EventType::ClipboardSending,
            target,
            EventData::ClipboardChunk(ClipboardChunk::start(id, sequence, data.len())),
        ));

        let mut offset = 0;
        while offset < data.len() {
            sink.add_event(Event::new(EventType::FileKeepAlive, target));

            let end = (offset + CHUNK_SIZE).min(data.len());
            sink.add_event(Event::with_data(
                EventType::ClipboardSending,
                target,
                EventData::ClipboardChunk(ClipboardChunk::data(
                    id,
                    sequence,
                    data[offset..end].to_vec(),
                )),
            ));
            offset = end;
        }

        sink.add_event(Event::with_data(
            EventType::ClipboardSending,
            target,
            EventData::ClipboardChunk(ClipboardChunk::end(id, sequence)),
        ));
        debug!(id, sequence, size = data.len(), "clipboard chunked for send");
    }
}

// ── Receiver ──────────────────────────────────────────────────────────────────

/// Errors raised while reassembling a chunked transfer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    /// A `Start` chunk's size payload was not ASCII decimal.
    #[error("unparseable size in start chunk: {0}")]
    BadSizeHeader(String),

    /// A `Data` or `End` chunk arrived with no transfer in progress.
    #[error("chunk received outside a transfer")]
    NotStarted,

    /// More data arrived than the `Start` chunk announced.
    #[error("transfer overflow: expected {expected} bytes, received {received}")]
    Overflow { expected: usize, received: usize },

    /// `End` arrived before the announced byte count was reached.
    #[error("corrupted transfer: expected {expected} bytes, received {received}")]
    SizeMismatch { expected: usize, received: usize },

    /// The mark byte was not Start/Data/End.
    #[error("invalid chunk mark: 0x{0:02X}")]
    BadMark(u8),
}

/// Progress report from [`ChunkAssembler::handle`].
#[derive(Debug, PartialEq, Eq)]
pub enum AssembleProgress {
    Started { expected: usize },
    Continued { received: usize },
    /// The transfer completed and validated; here is the payload.
    Finished(Vec<u8>),
}

/// Per-transfer reassembly state: `{ expected, buffer }`.
///
/// A fresh `Start` always resets the assembler, so the receiver side of an
/// interrupted transfer recovers on the sender's next attempt.  Every error
/// also discards the partial buffer — a failed transfer never poisons the
/// next one.
#[derive(Default)]
pub struct ChunkAssembler {
    expected: usize,
    buffer: Vec<u8>,
    active: bool,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Feeds one chunk.  See [`AssembleProgress`] for outcomes.
    pub fn handle(
        &mut self,
        mark: ChunkMark,
        payload: &[u8],
    ) -> Result<AssembleProgress, ChunkError> {
        match mark {
            ChunkMark::Start => {
                let text = std::str::from_utf8(payload)
                    .map_err(|_| self.fail(ChunkError::BadSizeHeader("not UTF-8".into())))?;
                let expected: usize = text
                    .parse()
                    .map_err(|_| self.fail(ChunkError::BadSizeHeader(text.to_string())))?;
                self.buffer.clear();
                self.expected = expected;
                self.active = true;
                Ok(AssembleProgress::Started { expected })
            }
            ChunkMark::Data => {
                if !self.active {
                    return Err(ChunkError::NotStarted);
                }
                if self.buffer.len() + payload.len() > self.expected {
                    let err = ChunkError::Overflow {
                        expected: self.expected,
                        received: self.buffer.len() + payload.len(),
                    };
                    return Err(self.fail(err));
                }
                self.buffer.extend_from_slice(payload);
                Ok(AssembleProgress::Continued {
                    received: self.buffer.len(),
                })
            }
            ChunkMark::End => {
                if !self.active {
                    return Err(ChunkError::NotStarted);
                }
                if self.buffer.len() != self.expected {
                    let err = ChunkError::SizeMismatch {
                        expected: self.expected,
                        received: self.buffer.len(),
                    };
                    return Err(self.fail(err));
                }
                self.active = false;
                self.expected = 0;
                Ok(AssembleProgress::Finished(std::mem::take(&mut self.buffer)))
            }
        }
    }

    /// Feeds a raw mark byte as it came off the wire.
    pub fn handle_raw(
        &mut self,
        mark: u8,
        payload: &[u8],
    ) -> Result<AssembleProgress, ChunkError> {
        let mark = ChunkMark::try_from(mark).map_err(ChunkError::BadMark)?;
        self.handle(mark, payload)
    }

    fn fail(&mut self, err: ChunkError) -> ChunkError {
        self.buffer.clear();
        self.expected = 0;
        self.active = false;
        err
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Dispatcher;
    use std::sync::mpsc;

    /// Collects the chunk events a producer posted, in order.
    fn drain_file_chunks(d: &mut Dispatcher, target: Target) -> Vec<FileChunk> {
        let (tx, rx) = mpsc::channel();
        d.add_handler(EventType::FileChunkSending, target, move |_, ev| {
            if let EventData::FileChunk(c) = &ev.data {
                tx.send(c.clone()).unwrap();
            }
        });
        d.pump();
        rx.try_iter().collect()
    }

    #[test]
    fn test_file_chunks_slice_100kb_exactly_as_specified() {
        let mut d = Dispatcher::new();
        let target = d.next_target();
        let data = vec![0x5A; 100_000];

        let sent = Chunker::new().send_file(&data, &d.sink(), target);
        assert!(sent);

        let chunks = drain_file_chunks(&mut d, target);
        assert_eq!(chunks.len(), 6, "start + 4 data + end");
        assert_eq!(chunks[0].mark, ChunkMark::Start);
        assert_eq!(chunks[0].payload, b"100000");
        let data_sizes: Vec<usize> = chunks[1..5].iter().map(|c| c.payload.len()).collect();
        assert_eq!(data_sizes, vec![32768, 32768, 32768, 1696]);
        assert_eq!(chunks[5].mark, ChunkMark::End);
    }

    #[test]
    fn test_file_chunk_payloads_concatenate_to_input() {
        let mut d = Dispatcher::new();
        let target = d.next_target();
        let data: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();

        Chunker::new().send_file(&data, &d.sink(), target);

        let chunks = drain_file_chunks(&mut d, target);
        let mut reassembled = Vec::new();
        for c in &chunks {
            if c.mark == ChunkMark::Data {
                reassembled.extend_from_slice(&c.payload);
            }
        }
        assert_eq!(reassembled, data);
    }

    #[test]
    fn test_empty_file_sends_start_and_end_only() {
        let mut d = Dispatcher::new();
        let target = d.next_target();

        Chunker::new().send_file(&[], &d.sink(), target);

        let chunks = drain_file_chunks(&mut d, target);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].mark, ChunkMark::Start);
        assert_eq!(chunks[0].payload, b"0");
        assert_eq!(chunks[1].mark, ChunkMark::End);
    }

    #[test]
    fn test_keepalive_precedes_every_data_chunk() {
        let mut d = Dispatcher::new();
        let target = d.next_target();
        let keepalives = std::rc::Rc::new(std::cell::RefCell::new(0u32));

        let k = std::rc::Rc::clone(&keepalives);
        d.add_handler(EventType::FileKeepAlive, target, move |_, _| {
            *k.borrow_mut() += 1;
        });

        Chunker::new().send_file(&vec![1u8; CHUNK_SIZE * 2 + 1], &d.sink(), target);
        d.pump();

        assert_eq!(*keepalives.borrow(), 3, "one keepalive per data chunk");
    }

    #[test]
    fn test_interrupted_send_stops_without_end_chunk() {
        let mut d = Dispatcher::new();
        let target = d.next_target();
        let chunker = Chunker::new();

        // The producer checks the flag at each chunk boundary; setting it
        // while chunking_file is raised mimics an enter() arriving mid-send.
        chunker.chunking_file.store(true, Ordering::Release);
        chunker.interrupt_file();

        let completed = chunker.send_file(&vec![9u8; CHUNK_SIZE * 4], &d.sink(), target);
        assert!(!completed);

        let chunks = drain_file_chunks(&mut d, target);
        assert_eq!(chunks[0].mark, ChunkMark::Start);
        assert!(
            chunks.iter().all(|c| c.mark != ChunkMark::End),
            "interrupted transfer must not emit End"
        );
        // at most one data chunk may have slipped out before the check
        assert!(chunks.iter().filter(|c| c.mark == ChunkMark::Data).count() <= 1);
    }

    #[test]
    fn test_interrupt_is_ignored_when_nothing_in_flight() {
        let chunker = Chunker::new();
        chunker.interrupt_file();

        let mut d = Dispatcher::new();
        let target = d.next_target();
        let completed = chunker.send_file(&vec![7u8; 10], &d.sink(), target);
        assert!(completed, "stale interrupt must not cancel the next send");
    }

    #[test]
    fn test_send_after_interrupted_send_proceeds_normally() {
        let mut d = Dispatcher::new();
        let target = d.next_target();
        let chunker = Chunker::new();

        chunker.chunking_file.store(true, Ordering::Release);
        chunker.interrupt_file();
        chunker.send_file(&vec![1u8; CHUNK_SIZE * 2], &d.sink(), target);
        let _ = drain_file_chunks(&mut d, target);

        let completed = chunker.send_file(&vec![2u8; 100], &d.sink(), target);
        assert!(completed);
    }

    #[test]
    fn test_per_session_interrupt_does_not_cross_sessions() {
        let mut d = Dispatcher::new();
        let target = d.next_target();
        let session_a = Chunker::new();
        let session_b = Chunker::new();

        // a send is in flight on A; B gets interrupted
        session_a.chunking_file.store(true, Ordering::Release);
        session_b.interrupt_file();

        let completed = session_a.send_file(&vec![3u8; CHUNK_SIZE], &d.sink(), target);
        assert!(completed, "interrupting session B must not abort session A");
    }

    #[test]
    fn test_clipboard_chunk_stream_shape() {
        let mut d = Dispatcher::new();
        let target = d.next_target();
        let (tx, rx) = mpsc::channel();
        d.add_handler(EventType::ClipboardSending, target, move |_, ev| {
            if let EventData::ClipboardChunk(c) = &ev.data {
                tx.send(c.clone()).unwrap();
            }
        });

        Chunker::new().send_clipboard(1, 42, b"snapshot bytes", &d.sink(), target);
        d.pump();

        let chunks: Vec<ClipboardChunk> = rx.try_iter().collect();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.id == 1 && c.sequence == 42));
        assert_eq!(chunks[0].mark, ChunkMark::Start);
        assert_eq!(chunks[0].payload, b"14");
        assert_eq!(chunks[1].payload, b"snapshot bytes");
        assert_eq!(chunks[2].mark, ChunkMark::End);
    }

    // ── Assembler ─────────────────────────────────────────────────────────────

    #[test]
    fn test_assembler_round_trip() {
        let mut asm = ChunkAssembler::new();
        assert_eq!(
            asm.handle(ChunkMark::Start, b"11").unwrap(),
            AssembleProgress::Started { expected: 11 }
        );
        assert_eq!(
            asm.handle(ChunkMark::Data, b"hello ").unwrap(),
            AssembleProgress::Continued { received: 6 }
        );
        asm.handle(ChunkMark::Data, b"world").unwrap();
        assert_eq!(
            asm.handle(ChunkMark::End, b"").unwrap(),
            AssembleProgress::Finished(b"hello world".to_vec())
        );
        assert!(!asm.is_active());
    }

    #[test]
    fn test_assembler_empty_transfer() {
        let mut asm = ChunkAssembler::new();
        asm.handle(ChunkMark::Start, b"0").unwrap();
        assert_eq!(
            asm.handle(ChunkMark::End, b"").unwrap(),
            AssembleProgress::Finished(Vec::new())
        );
    }

    #[test]
    fn test_assembler_end_with_missing_bytes_is_size_mismatch() {
        let mut asm = ChunkAssembler::new();
        asm.handle(ChunkMark::Start, b"10").unwrap();
        asm.handle(ChunkMark::Data, b"abc").unwrap();
        assert_eq!(
            asm.handle(ChunkMark::End, b"").unwrap_err(),
            ChunkError::SizeMismatch {
                expected: 10,
                received: 3
            }
        );
        assert!(!asm.is_active(), "failed transfer must drop its partial buffer");
    }

    #[test]
    fn test_assembler_overflow_is_rejected() {
        let mut asm = ChunkAssembler::new();
        asm.handle(ChunkMark::Start, b"4").unwrap();
        assert!(matches!(
            asm.handle(ChunkMark::Data, b"too long"),
            Err(ChunkError::Overflow { .. })
        ));
    }

    #[test]
    fn test_assembler_data_before_start_is_rejected() {
        let mut asm = ChunkAssembler::new();
        assert_eq!(
            asm.handle(ChunkMark::Data, b"x").unwrap_err(),
            ChunkError::NotStarted
        );
    }

    #[test]
    fn test_assembler_new_start_resets_interrupted_transfer() {
        let mut asm = ChunkAssembler::new();
        asm.handle(ChunkMark::Start, b"100").unwrap();
        asm.handle(ChunkMark::Data, b"partial").unwrap();
        // sender was interrupted; a new transfer begins
        asm.handle(ChunkMark::Start, b"5").unwrap();
        asm.handle(ChunkMark::Data, b"fresh").unwrap();
        assert_eq!(
            asm.handle(ChunkMark::End, b"").unwrap(),
            AssembleProgress::Finished(b"fresh".to_vec())
        );
    }

    #[test]
    fn test_assembler_bad_size_header_is_rejected() {
        let mut asm = ChunkAssembler::new();
        assert!(matches!(
            asm.handle(ChunkMark::Start, b"not-a-number"),
            Err(ChunkError::BadSizeHeader(_))
        ));
    }

    #[test]
    fn test_assembler_rejects_unknown_mark_byte() {
        let mut asm = ChunkAssembler::new();
        assert_eq!(asm.handle_raw(0x09, b"").unwrap_err(), ChunkError::BadMark(0x09));
    }

    #[test]
    fn test_chunk_builders_produce_expected_marks() {
        let start = ClipboardChunk::start(0, 0, 10);
        assert_eq!(start.mark, ChunkMark::Start);
        assert_eq!(start.payload, b"10");

        let data = ClipboardChunk::data(0, 1, b"mock data".to_vec());
        assert_eq!(data.mark, ChunkMark::Data);
        assert_eq!(data.payload, b"mock data");

        let end = ClipboardChunk::end(1, 1);
        assert_eq!(end.mark, ChunkMark::End);
        assert!(end.payload.is_empty());
    }
}
