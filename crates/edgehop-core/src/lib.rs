//! # edgehop-core
//!
//! Shared session core for Edgehop, a networked keyboard, mouse, and
//! clipboard sharing service: one machine's physical input devices control
//! several others, with the active screen chosen by sliding the cursor
//! across configured virtual screen edges.
//!
//! This crate is used by both the server and client applications.  It has
//! zero dependencies on OS input APIs, UI frameworks, or TLS internals —
//! those live behind the `LocalScreen` and stream capabilities that the
//! application crates implement.
//!
//! What lives here:
//!
//! - **`protocol`** — the binary wire format: length-prefixed frames, the
//!   4-byte-code message catalog, the unframed version handshake, and the
//!   chunked transfer pipeline for clipboards and files.
//!
//! - **`event`** — the single-threaded cooperative dispatcher that
//!   schedules everything, plus the thread-safe [`event::EventSink`] that
//!   helper threads post through.
//!
//! - **`net`** — the non-blocking stream traits and the socket multiplexer
//!   service thread.
//!
//! - **`clipboard`** — the opaque clipboard snapshot type.

pub mod clipboard;
pub mod event;
pub mod net;
pub mod protocol;

pub use clipboard::{Clipboard, ClipboardFormat, ClipboardId, CLIPBOARD_COUNT};
pub use event::{Dispatcher, Event, EventData, EventSink, EventType, Target, TimerId};
pub use net::multiplexer::{
    Interest, JobStatus, MuxJob, Readiness, SocketId, SocketMultiplexer, SocketProbe,
};
pub use net::notify::{StreamNotifyJob, StreamSignals};
pub use net::stream::{DataStream, FillOutcome, FrameStream, PipeStream};
pub use protocol::chunk::{
    AssembleProgress, ChunkAssembler, ChunkError, ChunkMark, Chunker, ClipboardChunk, FileChunk,
    CHUNK_SIZE,
};
pub use protocol::hello::{ProtocolVersion, MIN_CLIENT_VERSION, MIN_SERVER_VERSION, PROTOCOL_VERSION};
pub use protocol::messages::{decode_message, encode_message, Message};
pub use protocol::wire::FrameError;
