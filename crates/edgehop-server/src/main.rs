//! Edgehop server entry point.
//!
//! Loads (or defaults) the TOML config, binds the listener, and parks the
//! main thread in the dispatch loop.  Everything interesting happens in
//! event handlers from there on: the listener announces handshaken
//! clients, the server adopts them, and input relayed from the upstream
//! screen-edge policy flows to whichever client is active.
//!
//! ```text
//! main()
//!  ├─ load_config()              -- ~/.config/edgehop/server.toml
//!  ├─ Dispatcher::new()          -- owns the event loop (this thread)
//!  ├─ SocketMultiplexer::new()   -- readiness service thread
//!  ├─ Listener::bind()           -- accept + handshake pipeline
//!  ├─ Server::new()              -- registry + routing
//!  └─ dispatcher.run()           -- blocks until quit
//! ```

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use edgehop_core::{Dispatcher, SocketMultiplexer};
use edgehop_server::{load_config, Listener, Server};

#[derive(Debug, Parser)]
#[command(name = "edgehop-server", about = "Edgehop server: share this machine's keyboard and mouse")]
struct Args {
    /// Listen address, overriding the config file (host:port).
    #[arg(long)]
    address: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = load_config().context("failed to load configuration")?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.server.log_level.clone())),
        )
        .init();

    let listen_addr = args
        .address
        .unwrap_or_else(|| config.network.listen_addr());
    info!(name = %config.server.name, addr = %listen_addr, "Edgehop server starting");

    let mut dispatcher = Dispatcher::new();
    let mux = Arc::new(SocketMultiplexer::new());

    let listener = Listener::bind(&listen_addr, &mut dispatcher, Arc::clone(&mux))
        .context("failed to start listener")?;
    let _server = Server::new(listener, &mut dispatcher);

    info!("Edgehop server ready");
    dispatcher.run();

    info!("Edgehop server stopped");
    Ok(())
}
