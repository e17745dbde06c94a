//! The version handshake: the one exception to uniform framing.
//!
//! Immediately after the transport connects, the server writes a fixed,
//! *non*-length-prefixed header: the 11-byte magic followed by its protocol
//! version.  The client answers with the same magic, its own version, and its
//! screen name.  Everything after that is length-prefixed frames.
//!
//! ```text
//! server → client   "Barrier\0\0\0\0"  i16 major  i16 minor
//! client → server   "Barrier\0\0\0\0"  i16 major  i16 minor  string name
//! ```
//!
//! The magic doubles as a cheap sanity check: a TLS-misconfigured peer or a
//! port scanner fails it immediately instead of producing a confusing frame
//! error later.

use super::wire::{FrameError, PayloadReader, PayloadWriter};

/// Handshake magic; the name is a protocol-family fossil.
pub const HELLO_MAGIC: &[u8; 11] = b"Barrier\0\0\0\0";

/// Upper bound on a screen name, in bytes of UTF-8.
pub const MAX_NAME_LEN: usize = 255;

/// A protocol version pair as exchanged in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion {
    pub major: i16,
    pub minor: i16,
}

/// The version this build speaks.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 6 };

/// The oldest server a client will accept.
pub const MIN_SERVER_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 4 };

/// The oldest client a server will accept.
pub const MIN_CLIENT_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 4 };

impl ProtocolVersion {
    pub const fn new(major: i16, minor: i16) -> Self {
        Self { major, minor }
    }

    /// Keepalives and chunked clipboard/file transfers arrived in 1.5.
    pub fn supports_chunked_transfers(&self) -> bool {
        *self >= ProtocolVersion::new(1, 5)
    }

    /// Event-driven clipboard sending arrived in 1.6.
    pub fn supports_clipboard_events(&self) -> bool {
        *self >= ProtocolVersion::new(1, 6)
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Outcome of parsing a handshake message from a partially filled buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum HelloParse<T> {
    /// Not enough bytes buffered yet; read more and retry.
    Incomplete,
    /// Parsed successfully; `consumed` bytes belong to the hello.
    Done { value: T, consumed: usize },
}

// ── Server hello ──────────────────────────────────────────────────────────────

/// Encodes the server's hello: magic + version.
pub fn encode_hello(version: ProtocolVersion) -> Vec<u8> {
    let mut w = PayloadWriter::new();
    w.write_i16(version.major).write_i16(version.minor);
    let mut out = HELLO_MAGIC.to_vec();
    out.extend_from_slice(&w.into_bytes());
    out
}

/// Parses the server's hello from the front of `buf`.
///
/// # Errors
///
/// Returns [`FrameError::BadMagic`] as soon as the buffered prefix diverges
/// from the magic — there is no point reading further from such a peer.
pub fn parse_hello(buf: &[u8]) -> Result<HelloParse<ProtocolVersion>, FrameError> {
    match check_magic(buf)? {
        None => return Ok(HelloParse::Incomplete),
        Some(()) => {}
    }
    let rest = &buf[HELLO_MAGIC.len()..];
    if rest.len() < 4 {
        return Ok(HelloParse::Incomplete);
    }
    let mut r = PayloadReader::new(&rest[..4]);
    let version = ProtocolVersion::new(r.read_i16()?, r.read_i16()?);
    Ok(HelloParse::Done {
        value: version,
        consumed: HELLO_MAGIC.len() + 4,
    })
}

// ── Client hello-back ─────────────────────────────────────────────────────────

/// Encodes the client's reply: magic + version + screen name.
pub fn encode_hello_back(version: ProtocolVersion, name: &str) -> Vec<u8> {
    let mut w = PayloadWriter::new();
    w.write_i16(version.major)
        .write_i16(version.minor)
        .write_string(name);
    let mut out = HELLO_MAGIC.to_vec();
    out.extend_from_slice(&w.into_bytes());
    out
}

/// Parses the client's reply from the front of `buf`.
///
/// # Errors
///
/// [`FrameError::BadMagic`] on a magic mismatch; [`FrameError::Malformed`]
/// when the name exceeds [`MAX_NAME_LEN`], is empty, or is not UTF-8.
pub fn parse_hello_back(
    buf: &[u8],
) -> Result<HelloParse<(ProtocolVersion, String)>, FrameError> {
    match check_magic(buf)? {
        None => return Ok(HelloParse::Incomplete),
        Some(()) => {}
    }
    let rest = &buf[HELLO_MAGIC.len()..];
    // version (4) + name length prefix (4)
    if rest.len() < 8 {
        return Ok(HelloParse::Incomplete);
    }
    let name_len =
        u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
    if name_len > MAX_NAME_LEN {
        return Err(FrameError::Malformed(format!(
            "screen name of {name_len} bytes exceeds limit of {MAX_NAME_LEN}"
        )));
    }
    if rest.len() < 8 + name_len {
        return Ok(HelloParse::Incomplete);
    }
    let mut r = PayloadReader::new(&rest[..8 + name_len]);
    let version = ProtocolVersion::new(r.read_i16()?, r.read_i16()?);
    let name = r.read_string()?;
    if name.is_empty() {
        return Err(FrameError::Malformed("empty screen name".into()));
    }
    Ok(HelloParse::Done {
        value: (version, name),
        consumed: HELLO_MAGIC.len() + 8 + name_len,
    })
}

/// Ok(Some(())) when the magic matches, Ok(None) when more bytes are needed.
fn check_magic(buf: &[u8]) -> Result<Option<()>, FrameError> {
    let prefix = buf.len().min(HELLO_MAGIC.len());
    if buf[..prefix] != HELLO_MAGIC[..prefix] {
        return Err(FrameError::BadMagic);
    }
    if buf.len() < HELLO_MAGIC.len() {
        return Ok(None);
    }
    Ok(Some(()))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
