//! Event plumbing shared by every component of the session core.
//!
//! An [`Event`] is a tagged value `{ type, target, data }`.  Targets are
//! opaque numeric handles handed out by the [`dispatcher::Dispatcher`]; the
//! dispatcher never dereferences them, it only uses `(type, target)` as the
//! handler lookup key.  Numeric handles sidestep the lifetime hazards of
//! keying handlers by object address.

pub mod dispatcher;

pub use dispatcher::{Dispatcher, EventSink, TimerId};

use crate::protocol::chunk::{ClipboardChunk, FileChunk};

/// Opaque handler-lookup identity.  Allotted by
/// [`Dispatcher::next_target`]; timer ids share the same handle space.
pub type Target = u64;

/// Everything the session core reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Stops the dispatch loop.
    Quit,
    /// A timer fired; the event target is the [`TimerId`].
    Timer,

    // transport
    SocketConnected,
    SocketConnectionFailed,
    SocketDisconnected,
    SocketError,
    /// The user or platform asked that connection retries stop.
    SocketStopRetry,
    StreamInputReady,
    StreamOutputReady,
    StreamInputShutdown,
    StreamOutputShutdown,
    StreamOutputError,

    // client session lifecycle
    ClientConnected,
    ClientDisconnected,
    ClientConnectionFailed,

    // platform screen
    ScreenSuspend,
    ScreenResume,
    ScreenShapeChanged,
    /// The local screen asserted clipboard ownership.
    ClipboardGrabbed,

    // chunked transfer pipeline
    ClipboardSending,
    FileChunkSending,
    FileKeepAlive,
    FileReceiveCompleted,
    FileTransferFailed,
    /// A complete remote clipboard snapshot was reassembled.
    ClipboardReceived,

    // server listener / proxies
    ClientConnecting,
    ClientListenerConnected,
    HandshakeSuccess,
    HandshakeFailure,
    ClientProxyDisconnected,
}

/// Typed event payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventData {
    None,
    /// Connection failure details; `retry` says whether the session may
    /// reconnect.
    Fail { msg: String, retry: bool },
    /// Identifies a clipboard by id and grab sequence number.
    ClipboardInfo { id: u8, sequence: u32 },
    /// A reassembled clipboard snapshot, still marshalled.
    ClipboardData { id: u8, bytes: Vec<u8> },
    ClipboardChunk(ClipboardChunk),
    FileChunk(FileChunk),
    Bytes(Vec<u8>),
}

/// A dispatched event.
#[derive(Debug, Clone)]
pub struct Event {
    pub etype: EventType,
    pub target: Target,
    pub data: EventData,
}

impl Event {
    pub fn new(etype: EventType, target: Target) -> Self {
        Self {
            etype,
            target,
            data: EventData::None,
        }
    }

    pub fn with_data(etype: EventType, target: Target, data: EventData) -> Self {
        Self {
            etype,
            target,
            data,
        }
    }
}
