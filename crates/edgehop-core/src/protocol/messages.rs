//! The Edgehop message catalog.
//!
//! Every frame payload begins with a 4-byte ASCII message code; the remaining
//! bytes are code-specific fields.  This module defines the code constants,
//! the typed [`Message`] enum, and the [`encode_message`] / [`decode_message`]
//! pair that maps between them.
//!
//! Code naming follows the historical convention of the protocol family this
//! implements: `C` prefix for control messages, `D` for data, `Q` for
//! queries, `E` for errors.
//!
//! The handshake hello is *not* in this catalog — it is the one message that
//! is not length-prefixed and lives in [`super::hello`].

use super::wire::{FrameError, PayloadReader, PayloadWriter};

/// A 4-byte ASCII message code.
pub type MsgCode = [u8; 4];

/// Option ids carried in `DSOP` option lists, as `(id, value)` pairs.
pub mod options {
    /// Enables or disables clipboard sharing for the session.
    pub const CLIPBOARD_SHARING: u32 = u32::from_be_bytes(*b"CLPS");
    /// Heartbeat interval in milliseconds; 0 disables.
    pub const HEARTBEAT: u32 = u32::from_be_bytes(*b"HART");
    /// Screensaver synchronisation toggle.
    pub const SCREENSAVER_SYNC: u32 = u32::from_be_bytes(*b"SSVR");
}

// ── Control ───────────────────────────────────────────────────────────────────

/// Keepalive no-op.
pub const CODE_NOOP: MsgCode = *b"CNOP";
/// File-transfer keepalive (protocol 1.5+).
pub const CODE_KEEP_ALIVE: MsgCode = *b"CALV";
/// Acknowledges a `QINF` reply.
pub const CODE_INFO_ACK: MsgCode = *b"CIAK";
/// Resets all options to defaults.
pub const CODE_RESET_OPTIONS: MsgCode = *b"CROP";
/// Enter screen: the client now owns the cursor.
pub const CODE_ENTER: MsgCode = *b"CINN";
/// Leave screen.
pub const CODE_LEAVE: MsgCode = *b"COUT";
/// Clipboard grabbed by the peer's screen.
pub const CODE_GRAB_CLIPBOARD: MsgCode = *b"CCLP";
/// Screensaver state change.
pub const CODE_SCREENSAVER: MsgCode = *b"CSEC";
/// Resynchronise request; carries no payload.
pub const CODE_SYNCHRONIZE: MsgCode = *b"CSYN";
/// Reset session state; carries no payload.
pub const CODE_RESET: MsgCode = *b"CRST";

// ── Data ──────────────────────────────────────────────────────────────────────

pub const CODE_KEY_DOWN: MsgCode = *b"DKDN";
pub const CODE_KEY_REPEAT: MsgCode = *b"DKRP";
pub const CODE_KEY_UP: MsgCode = *b"DKUP";
pub const CODE_MOUSE_DOWN: MsgCode = *b"DMDN";
pub const CODE_MOUSE_UP: MsgCode = *b"DMUP";
pub const CODE_MOUSE_MOVE: MsgCode = *b"DMMV";
pub const CODE_MOUSE_REL_MOVE: MsgCode = *b"DMRM";
pub const CODE_MOUSE_WHEEL: MsgCode = *b"DMWM";
/// Chunked clipboard transfer (protocol 1.5+ shape; see
/// [`encode_clipboard_data`] for the 1.4 single-frame shape).
pub const CODE_CLIPBOARD: MsgCode = *b"DCLP";
/// Screen geometry report.
pub const CODE_INFO: MsgCode = *b"DINF";
/// Option list.
pub const CODE_SET_OPTIONS: MsgCode = *b"DSOP";
/// Chunked file transfer (protocol 1.5+).
pub const CODE_FILE_TRANSFER: MsgCode = *b"DFTR";
/// Drag metadata preceding a file transfer (protocol 1.5+).
pub const CODE_DRAG_INFO: MsgCode = *b"DDRG";

// ── Query ─────────────────────────────────────────────────────────────────────

/// Asks the client to report its screen geometry.
pub const CODE_QUERY_INFO: MsgCode = *b"QINF";

// ── Errors ────────────────────────────────────────────────────────────────────

/// Incompatible protocol version; carries the rejecting side's version.
pub const CODE_INCOMPATIBLE: MsgCode = *b"EICV";
/// Screen name already in use.
pub const CODE_BUSY: MsgCode = *b"EBSY";
/// Unknown client name.
pub const CODE_UNKNOWN: MsgCode = *b"EUNK";
/// Protocol violation.
pub const CODE_BAD: MsgCode = *b"EBAD";

/// All framed Edgehop messages, discriminated by code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Noop,
    KeepAlive,
    InfoAck,
    ResetOptions,
    /// Cursor entered this screen at (x, y) with the given modifier mask.
    /// `seq` orders enter/leave pairs so a stale leave cannot cancel a
    /// newer enter.
    Enter {
        x: i16,
        y: i16,
        seq: u32,
        mask: i16,
    },
    Leave,
    /// The sending side's screen grabbed clipboard `id`.
    GrabClipboard {
        id: u8,
        seq: u32,
    },
    Screensaver {
        on: bool,
    },
    Synchronize,
    Reset,
    KeyDown {
        key: u16,
        mask: u16,
        button: u16,
    },
    KeyRepeat {
        key: u16,
        mask: u16,
        count: u16,
        button: u16,
    },
    KeyUp {
        key: u16,
        mask: u16,
        button: u16,
    },
    MouseDown {
        button: i8,
    },
    MouseUp {
        button: i8,
    },
    MouseMove {
        x: i16,
        y: i16,
    },
    MouseRelMove {
        dx: i16,
        dy: i16,
    },
    MouseWheel {
        x_delta: i16,
        y_delta: i16,
    },
    /// One chunk of a clipboard transfer (1.5+ shape).
    ClipboardChunk {
        id: u8,
        seq: u32,
        mark: u8,
        payload: Vec<u8>,
    },
    /// One chunk of a file transfer.
    FileChunk {
        mark: u8,
        payload: Vec<u8>,
    },
    /// Screen geometry: origin, size, and current cursor position.
    /// `zone` is an obsolete jump-zone width kept for wire compatibility.
    Info {
        x: i16,
        y: i16,
        w: i16,
        h: i16,
        zone: i16,
        mx: i16,
        my: i16,
    },
    /// Flat list of (option id, value) pairs.
    SetOptions {
        options: Vec<u32>,
    },
    DragInfo {
        file_count: u32,
        info: String,
    },
    QueryInfo,
    Incompatible {
        major: i16,
        minor: i16,
    },
    Busy,
    UnknownClient,
    Bad,
}

impl Message {
    /// Returns the wire code for this message.
    pub fn code(&self) -> MsgCode {
        match self {
            Message::Noop => CODE_NOOP,
            Message::KeepAlive => CODE_KEEP_ALIVE,
            Message::InfoAck => CODE_INFO_ACK,
            Message::ResetOptions => CODE_RESET_OPTIONS,
            Message::Enter { .. } => CODE_ENTER,
            Message::Leave => CODE_LEAVE,
            Message::GrabClipboard { .. } => CODE_GRAB_CLIPBOARD,
            Message::Screensaver { .. } => CODE_SCREENSAVER,
            Message::Synchronize => CODE_SYNCHRONIZE,
            Message::Reset => CODE_RESET,
            Message::KeyDown { .. } => CODE_KEY_DOWN,
            Message::KeyRepeat { .. } => CODE_KEY_REPEAT,
            Message::KeyUp { .. } => CODE_KEY_UP,
            Message::MouseDown { .. } => CODE_MOUSE_DOWN,
            Message::MouseUp { .. } => CODE_MOUSE_UP,
            Message::MouseMove { .. } => CODE_MOUSE_MOVE,
            Message::MouseRelMove { .. } => CODE_MOUSE_REL_MOVE,
            Message::MouseWheel { .. } => CODE_MOUSE_WHEEL,
            Message::ClipboardChunk { .. } => CODE_CLIPBOARD,
            Message::FileChunk { .. } => CODE_FILE_TRANSFER,
            Message::Info { .. } => CODE_INFO,
            Message::SetOptions { .. } => CODE_SET_OPTIONS,
            Message::DragInfo { .. } => CODE_DRAG_INFO,
            Message::QueryInfo => CODE_QUERY_INFO,
            Message::Incompatible { .. } => CODE_INCOMPATIBLE,
            Message::Busy => CODE_BUSY,
            Message::UnknownClient => CODE_UNKNOWN,
            Message::Bad => CODE_BAD,
        }
    }
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Encodes a [`Message`] into a frame payload (code + fields, no length
/// prefix — framing is the stream layer's job).
pub fn encode_message(msg: &Message) -> Vec<u8> {
    let mut w = PayloadWriter::with_code(msg.code());
    match msg {
        Message::Noop
        | Message::KeepAlive
        | Message::InfoAck
        | Message::ResetOptions
        | Message::Leave
        | Message::Synchronize
        | Message::Reset
        | Message::QueryInfo
        | Message::Busy
        | Message::UnknownClient
        | Message::Bad => {}
        Message::Enter { x, y, seq, mask } => {
            w.write_i16(*x).write_i16(*y).write_u32(*seq).write_i16(*mask);
        }
        Message::GrabClipboard { id, seq } => {
            w.write_u8(*id).write_u32(*seq);
        }
        Message::Screensaver { on } => {
            w.write_i8(i8::from(*on));
        }
        Message::KeyDown { key, mask, button } | Message::KeyUp { key, mask, button } => {
            w.write_u16(*key).write_u16(*mask).write_u16(*button);
        }
        Message::KeyRepeat {
            key,
            mask,
            count,
            button,
        } => {
            w.write_u16(*key)
                .write_u16(*mask)
                .write_u16(*count)
                .write_u16(*button);
        }
        Message::MouseDown { button } | Message::MouseUp { button } => {
            w.write_i8(*button);
        }
        Message::MouseMove { x, y } => {
            w.write_i16(*x).write_i16(*y);
        }
        Message::MouseRelMove { dx, dy } => {
            w.write_i16(*dx).write_i16(*dy);
        }
        Message::MouseWheel { x_delta, y_delta } => {
            w.write_i16(*x_delta).write_i16(*y_delta);
        }
        Message::ClipboardChunk {
            id,
            seq,
            mark,
            payload,
        } => {
            w.write_u8(*id).write_u32(*seq).write_u8(*mark).write_blob(payload);
        }
        Message::FileChunk { mark, payload } => {
            w.write_u8(*mark).write_blob(payload);
        }
        Message::Info {
            x,
            y,
            w: width,
            h,
            zone,
            mx,
            my,
        } => {
            w.write_i16(*x)
                .write_i16(*y)
                .write_i16(*width)
                .write_i16(*h)
                .write_i16(*zone)
                .write_i16(*mx)
                .write_i16(*my);
        }
        Message::SetOptions { options } => {
            w.write_u32_list(options);
        }
        Message::DragInfo { file_count, info } => {
            w.write_u32(*file_count).write_string(info);
        }
        Message::Incompatible { major, minor } => {
            w.write_i16(*major).write_i16(*minor);
        }
    }
    w.into_bytes()
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Decodes one frame payload (code + fields) into a [`Message`].
///
/// # Errors
///
/// Returns [`FrameError::UnknownCode`] for codes not in the catalog,
/// [`FrameError::Truncated`] for short fields, and
/// [`FrameError::TrailingBytes`] when bytes are left over after the last
/// field.
pub fn decode_message(payload: &[u8]) -> Result<Message, FrameError> {
    if payload.len() < 4 {
        return Err(FrameError::Truncated {
            needed: 4,
            available: payload.len(),
        });
    }
    let code: MsgCode = [payload[0], payload[1], payload[2], payload[3]];
    let mut r = PayloadReader::new(&payload[4..]);

    let msg = match code {
        CODE_NOOP => Message::Noop,
        CODE_KEEP_ALIVE => Message::KeepAlive,
        CODE_INFO_ACK => Message::InfoAck,
        CODE_RESET_OPTIONS => Message::ResetOptions,
        CODE_ENTER => Message::Enter {
            x: r.read_i16()?,
            y: r.read_i16()?,
            seq: r.read_u32()?,
            mask: r.read_i16()?,
        },
        CODE_LEAVE => Message::Leave,
        CODE_GRAB_CLIPBOARD => Message::GrabClipboard {
            id: r.read_u8()?,
            seq: r.read_u32()?,
        },
        CODE_SCREENSAVER => Message::Screensaver {
            on: r.read_i8()? != 0,
        },
        CODE_SYNCHRONIZE => Message::Synchronize,
        CODE_RESET => Message::Reset,
        CODE_KEY_DOWN => Message::KeyDown {
            key: r.read_u16()?,
            mask: r.read_u16()?,
            button: r.read_u16()?,
        },
        CODE_KEY_REPEAT => Message::KeyRepeat {
            key: r.read_u16()?,
            mask: r.read_u16()?,
            count: r.read_u16()?,
            button: r.read_u16()?,
        },
        CODE_KEY_UP => Message::KeyUp {
            key: r.read_u16()?,
            mask: r.read_u16()?,
            button: r.read_u16()?,
        },
        CODE_MOUSE_DOWN => Message::MouseDown { button: r.read_i8()? },
        CODE_MOUSE_UP => Message::MouseUp { button: r.read_i8()? },
        CODE_MOUSE_MOVE => Message::MouseMove {
            x: r.read_i16()?,
            y: r.read_i16()?,
        },
        CODE_MOUSE_REL_MOVE => Message::MouseRelMove {
            dx: r.read_i16()?,
            dy: r.read_i16()?,
        },
        CODE_MOUSE_WHEEL => Message::MouseWheel {
            x_delta: r.read_i16()?,
            y_delta: r.read_i16()?,
        },
        CODE_CLIPBOARD => Message::ClipboardChunk {
            id: r.read_u8()?,
            seq: r.read_u32()?,
            mark: r.read_u8()?,
            payload: r.read_blob()?,
        },
        CODE_FILE_TRANSFER => Message::FileChunk {
            mark: r.read_u8()?,
            payload: r.read_blob()?,
        },
        CODE_INFO => Message::Info {
            x: r.read_i16()?,
            y: r.read_i16()?,
            w: r.read_i16()?,
            h: r.read_i16()?,
            zone: r.read_i16()?,
            mx: r.read_i16()?,
            my: r.read_i16()?,
        },
        CODE_SET_OPTIONS => Message::SetOptions {
            options: r.read_u32_list()?,
        },
        CODE_DRAG_INFO => Message::DragInfo {
            file_count: r.read_u32()?,
            info: r.read_string()?,
        },
        CODE_QUERY_INFO => Message::QueryInfo,
        CODE_INCOMPATIBLE => Message::Incompatible {
            major: r.read_i16()?,
            minor: r.read_i16()?,
        },
        CODE_BUSY => Message::Busy,
        CODE_UNKNOWN => Message::UnknownClient,
        CODE_BAD => Message::Bad,
        other => return Err(FrameError::UnknownCode(other)),
    };

    r.finish()?;
    Ok(msg)
}

// ── Protocol 1.4 clipboard shape ──────────────────────────────────────────────

/// Encodes the pre-1.5 single-frame clipboard payload: `DCLP` + id + seq +
/// data, with no mark byte.  Version-1.4 peers never chunk, so the whole
/// marshalled snapshot travels in one frame.
pub fn encode_clipboard_data(id: u8, seq: u32, data: &[u8]) -> Vec<u8> {
    let mut w = PayloadWriter::with_code(CODE_CLIPBOARD);
    w.write_u8(id).write_u32(seq).write_blob(data);
    w.into_bytes()
}

/// Decodes the pre-1.5 single-frame clipboard payload.
///
/// Callers must route `DCLP` frames here (instead of [`decode_message`])
/// when the negotiated minor version is below 5 — the two shapes are
/// indistinguishable without that context.
pub fn decode_clipboard_data(payload: &[u8]) -> Result<(u8, u32, Vec<u8>), FrameError> {
    if payload.len() < 4 || payload[0..4] != CODE_CLIPBOARD {
        return Err(FrameError::Malformed("not a DCLP frame".into()));
    }
    let mut r = PayloadReader::new(&payload[4..]);
    let id = r.read_u8()?;
    let seq = r.read_u32()?;
    let data = r.read_blob()?;
    r.finish()?;
    Ok((id, seq, data))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
