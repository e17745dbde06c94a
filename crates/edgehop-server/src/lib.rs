//! # edgehop-server
//!
//! The inbound half of Edgehop: listens for clients, negotiates the
//! protocol version per connection, and routes input, clipboard, and file
//! traffic to whichever client screen currently owns the cursor.
//!
//! - **`listener`** — accept loop and handshake shepherding.
//! - **`proxy`** — the per-connection [`proxy::UnknownProxy`] →
//!   [`proxy::ClientProxy`] pipeline with version-driven behaviour.
//! - **`server`** — the client registry and routing core.
//! - **`config`** — TOML configuration persistence.

pub mod config;
pub mod listener;
pub mod proxy;
pub mod server;

pub use config::{load_config, save_config, ConfigError, ServerConfig};
pub use listener::{ListenError, Listener};
pub use proxy::{ClientProxy, ClientScreenInfo, UnknownProxy, VersionTraits};
pub use server::{Server, ServerError};
