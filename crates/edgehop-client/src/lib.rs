//! # edgehop-client
//!
//! The outbound half of Edgehop: resolves the server address, connects,
//! performs the version handshake, and from then on drives the local
//! screen from the server's input, clipboard, and file messages.
//!
//! - **`session`** — the [`session::ClientSession`] state machine.
//! - **`screen`** — the [`screen::LocalScreen`] platform capability and the
//!   recording [`screen::MockScreen`] used by tests and headless runs.

pub mod screen;
pub mod session;

pub use screen::{LocalScreen, MockScreen, Point, Rect, ScreenCall};
pub use session::{ClientConfig, ClientSession, SessionState};
