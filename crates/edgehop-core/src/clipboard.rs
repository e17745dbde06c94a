//! Clipboard snapshots.
//!
//! The session core treats clipboard contents as an opaque marshalled blob
//! plus a monotonically increasing `time` assigned by the owning screen.
//! A remote snapshot whose `time` equals the last one seen is unchanged and
//! not re-applied.  The marshalled layout below is the platform adapter's
//! contract; the protocol never looks inside it.

use std::collections::BTreeMap;

use crate::protocol::wire::{FrameError, PayloadReader, PayloadWriter};

/// Index of a clipboard on a screen.
pub type ClipboardId = u8;

/// The primary clipboard.
pub const CLIPBOARD_CLIPBOARD: ClipboardId = 0;
/// The X11-style primary selection.
pub const CLIPBOARD_SELECTION: ClipboardId = 1;
/// Number of clipboards per screen; ids range over `0..CLIPBOARD_COUNT`.
pub const CLIPBOARD_COUNT: usize = 2;

/// Data formats a snapshot may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum ClipboardFormat {
    Text = 0,
    Html = 1,
    Bitmap = 2,
}

impl TryFrom<u32> for ClipboardFormat {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, u32> {
        match value {
            0 => Ok(ClipboardFormat::Text),
            1 => Ok(ClipboardFormat::Html),
            2 => Ok(ClipboardFormat::Bitmap),
            other => Err(other),
        }
    }
}

/// One clipboard snapshot: an ownership timestamp plus per-format payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Clipboard {
    time: u32,
    formats: BTreeMap<ClipboardFormat, Vec<u8>>,
}

impl Clipboard {
    pub fn new(time: u32) -> Self {
        Self {
            time,
            formats: BTreeMap::new(),
        }
    }

    /// Sequence assigned by the owner when it grabbed the clipboard.
    pub fn time(&self) -> u32 {
        self.time
    }

    pub fn set_time(&mut self, time: u32) {
        self.time = time;
    }

    pub fn add(&mut self, format: ClipboardFormat, data: Vec<u8>) {
        self.formats.insert(format, data);
    }

    pub fn get(&self, format: ClipboardFormat) -> Option<&[u8]> {
        self.formats.get(&format).map(Vec::as_slice)
    }

    pub fn has(&self, format: ClipboardFormat) -> bool {
        self.formats.contains_key(&format)
    }

    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }

    /// Serialises the snapshot to the opaque blob carried by `DCLP`
    /// transfers: `u32 time`, `u32 format count`, then per format a
    /// `u32 format id` and a length-prefixed payload.
    pub fn marshall(&self) -> Vec<u8> {
        let mut w = PayloadWriter::new();
        w.write_u32(self.time);
        w.write_u32(self.formats.len() as u32);
        for (format, data) in &self.formats {
            w.write_u32(*format as u32);
            w.write_blob(data);
        }
        w.into_bytes()
    }

    /// Parses a marshalled snapshot.  Unknown format ids are skipped, not
    /// fatal — a newer peer may know formats this build does not.
    pub fn unmarshall(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut r = PayloadReader::new(bytes);
        let time = r.read_u32()?;
        let count = r.read_u32()?;
        let mut clipboard = Clipboard::new(time);
        for _ in 0..count {
            let format_id = r.read_u32()?;
            let data = r.read_blob()?;
            if let Ok(format) = ClipboardFormat::try_from(format_id) {
                clipboard.formats.insert(format, data);
            }
        }
        r.finish()?;
        Ok(clipboard)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marshall_round_trip() {
        let mut c = Clipboard::new(7);
        c.add(ClipboardFormat::Text, b"hello".to_vec());
        c.add(ClipboardFormat::Html, b"<b>hello</b>".to_vec());

        let restored = Clipboard::unmarshall(&c.marshall()).unwrap();
        assert_eq!(restored, c);
        assert_eq!(restored.time(), 7);
        assert_eq!(restored.get(ClipboardFormat::Text), Some(b"hello".as_ref()));
    }

    #[test]
    fn test_empty_clipboard_round_trip() {
        let c = Clipboard::new(0);
        let restored = Clipboard::unmarshall(&c.marshall()).unwrap();
        assert!(restored.is_empty());
        assert_eq!(restored.time(), 0);
    }

    #[test]
    fn test_unknown_format_is_skipped() {
        let mut w = PayloadWriter::new();
        w.write_u32(3); // time
        w.write_u32(2); // two formats
        w.write_u32(0); // Text
        w.write_blob(b"keep");
        w.write_u32(99); // unknown format id
        w.write_blob(b"drop");

        let c = Clipboard::unmarshall(&w.into_bytes()).unwrap();
        assert_eq!(c.get(ClipboardFormat::Text), Some(b"keep".as_ref()));
        assert_eq!(c.formats.len(), 1);
    }

    #[test]
    fn test_truncated_blob_is_rejected() {
        let mut c = Clipboard::new(1);
        c.add(ClipboardFormat::Text, b"payload".to_vec());
        let bytes = c.marshall();
        assert!(Clipboard::unmarshall(&bytes[..bytes.len() - 2]).is_err());
    }

    #[test]
    fn test_trailing_garbage_is_rejected() {
        let mut bytes = Clipboard::new(1).marshall();
        bytes.push(0);
        assert!(matches!(
            Clipboard::unmarshall(&bytes),
            Err(FrameError::TrailingBytes { .. })
        ));
    }
}
