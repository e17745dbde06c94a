//! Edgehop client entry point.
//!
//! Wires the dispatcher, the socket multiplexer, and a [`ClientSession`]
//! together, then parks the main thread in the dispatch loop.  This build
//! uses the recording [`MockScreen`]; a platform build substitutes its
//! native screen implementation at this one seam.
//!
//! ```text
//! main()
//!  ├─ Dispatcher::new()          -- owns the event loop (this thread)
//!  ├─ SocketMultiplexer::new()   -- readiness service thread
//!  ├─ ClientSession::new()       -- session state machine
//!  ├─ reconnect wiring           -- retry-on-failure with a backoff timer
//!  └─ dispatcher.run()           -- blocks until quit
//! ```

use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use edgehop_client::{ClientConfig, ClientSession, MockScreen};
use edgehop_core::{Dispatcher, EventData, EventType, SocketMultiplexer};

/// Delay between reconnection attempts.
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(name = "edgehop-client", about = "Edgehop client: share this screen's input with a server")]
struct Args {
    /// Server address, host:port.
    server: String,

    /// Screen name announced to the server; must be unique per server.
    #[arg(long, default_value_t = default_name())]
    name: String,

    /// Give up after the first connection failure instead of retrying.
    #[arg(long)]
    no_restart: bool,
}

fn default_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "edgehop".to_string())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(server = %args.server, name = %args.name, "Edgehop client starting");

    let mut dispatcher = Dispatcher::new();
    let notify_target = dispatcher.next_target();
    let mux = Arc::new(SocketMultiplexer::new());
    let screen = Arc::new(MockScreen::new());

    let session = ClientSession::new(
        ClientConfig {
            name: args.name,
            server_addr: args.server,
            restartable: !args.no_restart,
        },
        screen,
        mux,
        &mut dispatcher,
        notify_target,
    );

    // ── Lifecycle wiring ──────────────────────────────────────────────────────

    dispatcher.add_handler(EventType::ClientConnected, notify_target, |_, _| {
        info!("connected to server");
    });

    let s = Rc::clone(&session);
    dispatcher.add_handler(
        EventType::ClientConnectionFailed,
        notify_target,
        move |d, ev| {
            if let EventData::Fail { msg, .. } = &ev.data {
                error!("connection failed: {msg}");
            }
            schedule_reconnect_or_quit(&s, d);
        },
    );

    let s = Rc::clone(&session);
    dispatcher.add_handler(EventType::ClientDisconnected, notify_target, move |d, _| {
        info!("disconnected from server");
        schedule_reconnect_or_quit(&s, d);
    });

    dispatcher.add_handler(EventType::FileReceiveCompleted, notify_target, |_, ev| {
        if let EventData::Bytes(bytes) = &ev.data {
            info!(size = bytes.len(), "file received");
        }
    });

    ClientSession::connect(&session, &mut dispatcher);
    dispatcher.run();

    info!("Edgehop client stopped");
    Ok(())
}

/// Arms a one-shot retry timer, or quits when retrying is off.
fn schedule_reconnect_or_quit(
    session: &Rc<std::cell::RefCell<ClientSession>>,
    d: &mut Dispatcher,
) {
    if !session.borrow().is_restartable() {
        d.quit();
        return;
    }
    let timer = d.new_timer(RETRY_INTERVAL, true);
    let s = Rc::clone(session);
    d.add_handler(EventType::Timer, timer, move |d, ev| {
        d.remove_handler(EventType::Timer, ev.target);
        ClientSession::connect(&s, d);
    });
}
