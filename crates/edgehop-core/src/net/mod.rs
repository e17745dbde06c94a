//! Transport plumbing: the byte-stream capability, framed streams, and the
//! socket multiplexer that services every registered socket from one
//! background thread.

pub mod multiplexer;
pub mod notify;
pub mod stream;
