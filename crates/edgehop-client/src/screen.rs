//! The `LocalScreen` capability: everything the session asks of the
//! platform, and a recording mock for tests and headless runs.
//!
//! A production build implements [`LocalScreen`] with the native input
//! synthesis APIs (`SendInput` on Windows, XTest on X11, CoreGraphics event
//! taps on macOS) plus the platform clipboard.  The session core never sees
//! any of that — it calls this trait from the dispatcher thread and nothing
//! else.

use std::sync::Mutex;

use edgehop_core::{Clipboard, ClipboardId, CLIPBOARD_COUNT};

/// A screen rectangle in virtual-desktop coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i16,
    pub y: i16,
    pub w: i16,
    pub h: i16,
}

/// A cursor position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Point {
    pub x: i16,
    pub y: i16,
}

/// Platform screen capability consumed by the client session.
///
/// All calls arrive on the dispatcher thread.
pub trait LocalScreen: Send + Sync {
    /// The session reached `Active`; start delivering local events.
    fn enable(&self);
    /// The session is going away; stop delivering local events.
    fn disable(&self);

    /// The cursor entered this screen with the given modifier mask.
    fn enter(&self, mask: i16);
    /// The cursor left this screen.
    fn leave(&self);

    fn key_down(&self, key: u16, mask: u16, button: u16);
    fn key_repeat(&self, key: u16, mask: u16, count: u16, button: u16);
    fn key_up(&self, key: u16, mask: u16, button: u16);

    fn mouse_down(&self, button: i8);
    fn mouse_up(&self, button: i8);
    fn mouse_move(&self, x: i16, y: i16);
    fn mouse_relative_move(&self, dx: i16, dy: i16);
    fn mouse_wheel(&self, x_delta: i16, y_delta: i16);

    fn get_clipboard(&self, id: ClipboardId) -> Clipboard;
    fn set_clipboard(&self, id: ClipboardId, clipboard: &Clipboard);
    /// The remote side owns clipboard `id` now.
    fn grab_clipboard(&self, id: ClipboardId);

    fn shape(&self) -> Rect;
    fn cursor_pos(&self) -> Point;

    fn reset_options(&self);
    fn set_options(&self, options: &[u32]);
    fn screensaver(&self, on: bool);
}

// ── Recording mock ────────────────────────────────────────────────────────────

/// Every call a [`MockScreen`] records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScreenCall {
    Enable,
    Disable,
    Enter { mask: i16 },
    Leave,
    KeyDown { key: u16, mask: u16, button: u16 },
    KeyRepeat { key: u16, mask: u16, count: u16, button: u16 },
    KeyUp { key: u16, mask: u16, button: u16 },
    MouseDown { button: i8 },
    MouseUp { button: i8 },
    MouseMove { x: i16, y: i16 },
    MouseRelativeMove { dx: i16, dy: i16 },
    MouseWheel { x_delta: i16, y_delta: i16 },
    SetClipboard { id: ClipboardId, time: u32 },
    GrabClipboard { id: ClipboardId },
    ResetOptions,
    SetOptions { options: Vec<u32> },
    Screensaver { on: bool },
}

/// Records every call instead of synthesising OS input.  Used by the test
/// suites and by the binary's `--headless` mode; a production build swaps
/// in the platform implementation.
pub struct MockScreen {
    calls: Mutex<Vec<ScreenCall>>,
    clipboards: Mutex<[Clipboard; CLIPBOARD_COUNT]>,
    shape: Rect,
    cursor: Mutex<Point>,
}

impl MockScreen {
    pub fn new() -> Self {
        Self::with_shape(Rect {
            x: 0,
            y: 0,
            w: 1920,
            h: 1080,
        })
    }

    pub fn with_shape(shape: Rect) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            clipboards: Mutex::new(Default::default()),
            shape,
            cursor: Mutex::new(Point::default()),
        }
    }

    /// Snapshot of the recorded calls.
    pub fn calls(&self) -> Vec<ScreenCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Seeds a clipboard the next `get_clipboard` will return.
    pub fn put_clipboard(&self, id: ClipboardId, clipboard: Clipboard) {
        self.clipboards.lock().unwrap()[id as usize] = clipboard;
    }

    fn record(&self, call: ScreenCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Default for MockScreen {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalScreen for MockScreen {
    fn enable(&self) {
        self.record(ScreenCall::Enable);
    }

    fn disable(&self) {
        self.record(ScreenCall::Disable);
    }

    fn enter(&self, mask: i16) {
        self.record(ScreenCall::Enter { mask });
    }

    fn leave(&self) {
        self.record(ScreenCall::Leave);
    }

    fn key_down(&self, key: u16, mask: u16, button: u16) {
        self.record(ScreenCall::KeyDown { key, mask, button });
    }

    fn key_repeat(&self, key: u16, mask: u16, count: u16, button: u16) {
        self.record(ScreenCall::KeyRepeat {
            key,
            mask,
            count,
            button,
        });
    }

    fn key_up(&self, key: u16, mask: u16, button: u16) {
        self.record(ScreenCall::KeyUp { key, mask, button });
    }

    fn mouse_down(&self, button: i8) {
        self.record(ScreenCall::MouseDown { button });
    }

    fn mouse_up(&self, button: i8) {
        self.record(ScreenCall::MouseUp { button });
    }

    fn mouse_move(&self, x: i16, y: i16) {
        *self.cursor.lock().unwrap() = Point { x, y };
        self.record(ScreenCall::MouseMove { x, y });
    }

    fn mouse_relative_move(&self, dx: i16, dy: i16) {
        let mut cursor = self.cursor.lock().unwrap();
        cursor.x = cursor.x.saturating_add(dx);
        cursor.y = cursor.y.saturating_add(dy);
        drop(cursor);
        self.record(ScreenCall::MouseRelativeMove { dx, dy });
    }

    fn mouse_wheel(&self, x_delta: i16, y_delta: i16) {
        self.record(ScreenCall::MouseWheel { x_delta, y_delta });
    }

    fn get_clipboard(&self, id: ClipboardId) -> Clipboard {
        self.clipboards.lock().unwrap()[id as usize].clone()
    }

    fn set_clipboard(&self, id: ClipboardId, clipboard: &Clipboard) {
        self.clipboards.lock().unwrap()[id as usize] = clipboard.clone();
        self.record(ScreenCall::SetClipboard {
            id,
            time: clipboard.time(),
        });
    }

    fn grab_clipboard(&self, id: ClipboardId) {
        self.record(ScreenCall::GrabClipboard { id });
    }

    fn shape(&self) -> Rect {
        self.shape
    }

    fn cursor_pos(&self) -> Point {
        *self.cursor.lock().unwrap()
    }

    fn reset_options(&self) {
        self.record(ScreenCall::ResetOptions);
    }

    fn set_options(&self, options: &[u32]) {
        self.record(ScreenCall::SetOptions {
            options: options.to_vec(),
        });
    }

    fn screensaver(&self, on: bool) {
        self.record(ScreenCall::Screensaver { on });
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
