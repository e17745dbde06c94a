//! The Edgehop wire protocol.
//!
//! Layering, bottom up:
//!
//! - [`wire`] — big-endian field primitives and strict payload parsing.
//! - [`frame`] — `u32` length-prefix framing and incremental reassembly.
//! - [`messages`] — the 4-byte-code message catalog and typed [`messages::Message`].
//! - [`hello`] — the unframed version handshake.
//! - [`chunk`] — the `Start / Data* / End` transfer pipeline for clipboard
//!   blobs and files.

pub mod chunk;
pub mod frame;
pub mod hello;
pub mod messages;
pub mod wire;
