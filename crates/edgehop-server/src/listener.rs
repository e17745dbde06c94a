//! The client listener: accepts TCP connections and shepherds each one
//! through its handshake.
//!
//! The accept loop is a multiplexer job; accepted sockets are handed to
//! the dispatcher thread through a slot, where each becomes an
//! [`UnknownProxy`].  Proxies that complete the handshake land in the
//! waiting queue as full [`ClientProxy`] objects and the listener
//! announces `ClientListenerConnected`; the server pops them with
//! [`Listener::next_client`].  Handshake failures are dropped here and
//! never reach the server.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::{TcpListener, TcpStream};
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info, warn};

use edgehop_core::{
    Dispatcher, Event, EventSink, EventType, Interest, JobStatus, MuxJob, Readiness, SocketId,
    SocketMultiplexer, SocketProbe, Target,
};

use crate::proxy::{ClientProxy, UnknownProxy};

/// Error type for listener setup.
#[derive(Debug, Error)]
pub enum ListenError {
    #[error("bind failed on {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Accept-side probe: a `TcpListener` cannot be peeked, so the job is
/// polled every cycle and discovers emptiness via `WouldBlock`.
struct AlwaysReady;

impl SocketProbe for AlwaysReady {
    fn probe(&self, _interest: Interest) -> io::Result<Readiness> {
        Ok(Readiness {
            readable: true,
            writable: false,
            error: false,
        })
    }
}

/// Multiplexer job draining the accept queue into the hand-off slot.
struct AcceptJob {
    listener: TcpListener,
    slot: Arc<Mutex<Vec<TcpStream>>>,
    sink: EventSink,
    target: Target,
}

impl MuxJob for AcceptJob {
    fn interest(&self) -> Interest {
        Interest::READ
    }

    fn run(&mut self, _ready: Readiness) -> JobStatus {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection accepted");
                    self.slot.lock().unwrap().push(stream);
                    self.sink
                        .add_event(Event::new(EventType::ClientConnecting, self.target));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return JobStatus::Keep,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return JobStatus::Keep;
                }
            }
        }
    }
}

/// Owns the listen socket, the in-handshake proxies, and the waiting
/// queue of handshaken clients.
pub struct Listener {
    target: Target,
    mux: Arc<SocketMultiplexer>,
    sink: EventSink,
    accept_slot: Arc<Mutex<Vec<TcpStream>>>,
    listen_socket: Option<SocketId>,
    new_clients: Vec<Rc<RefCell<UnknownProxy>>>,
    waiting_clients: VecDeque<Rc<RefCell<ClientProxy>>>,
}

impl Listener {
    /// Binds `addr` and starts accepting.
    ///
    /// # Errors
    ///
    /// Returns [`ListenError::BindFailed`] when the address cannot be
    /// bound (commonly: another server instance is already running).
    pub fn bind(
        addr: &str,
        d: &mut Dispatcher,
        mux: Arc<SocketMultiplexer>,
    ) -> Result<Rc<RefCell<Self>>, ListenError> {
        let listen = TcpListener::bind(addr).map_err(|source| ListenError::BindFailed {
            addr: addr.to_string(),
            source,
        })?;
        listen
            .set_nonblocking(true)
            .map_err(|source| ListenError::BindFailed {
                addr: addr.to_string(),
                source,
            })?;

        let target = d.next_target();
        let sink = d.sink();
        let accept_slot: Arc<Mutex<Vec<TcpStream>>> = Arc::default();

        let listen_socket = mux.add_socket(
            Box::new(AlwaysReady),
            Box::new(AcceptJob {
                listener: listen,
                slot: Arc::clone(&accept_slot),
                sink: sink.clone(),
                target,
            }),
            target,
            sink.clone(),
        );

        let listener = Rc::new(RefCell::new(Self {
            target,
            mux,
            sink,
            accept_slot,
            listen_socket: Some(listen_socket),
            new_clients: Vec::new(),
            waiting_clients: VecDeque::new(),
        }));

        let l = Rc::clone(&listener);
        d.add_handler(EventType::ClientConnecting, target, move |d, _| {
            Self::handle_client_connecting(&l, d);
        });

        info!(addr, "listening for clients");
        Ok(listener)
    }

    /// Target on which `ClientListenerConnected` is announced.
    pub fn target(&self) -> Target {
        self.target
    }

    /// Number of connections still in their handshake.
    pub fn handshaking_count(&self) -> usize {
        self.new_clients.len()
    }

    /// Pops the next handshaken client, FIFO.
    pub fn next_client(&mut self) -> Option<Rc<RefCell<ClientProxy>>> {
        self.waiting_clients.pop_front()
    }

    /// Adopts an already-connected stream as an in-handshake client.
    /// The TCP accept path lands here; tests inject pipes directly.
    pub fn adopt_stream(
        listener: &Rc<RefCell<Self>>,
        d: &mut Dispatcher,
        stream: Box<dyn edgehop_core::DataStream>,
        probe: Box<dyn SocketProbe>,
    ) {
        let mux = Arc::clone(&listener.borrow().mux);
        let unknown = UnknownProxy::start(d, mux, stream, probe);
        let unknown_target = unknown.borrow().target();
        listener.borrow_mut().new_clients.push(Rc::clone(&unknown));

        let l = Rc::clone(listener);
        let u = Rc::clone(&unknown);
        d.add_handler(EventType::HandshakeSuccess, unknown_target, move |d, _| {
            Self::handle_handshake_done(&l, &u, d, true);
        });
        let l = Rc::clone(listener);
        let u = Rc::clone(&unknown);
        d.add_handler(EventType::HandshakeFailure, unknown_target, move |d, _| {
            Self::handle_handshake_done(&l, &u, d, false);
        });
    }

    fn handle_client_connecting(listener: &Rc<RefCell<Self>>, d: &mut Dispatcher) {
        let accepted: Vec<TcpStream> = {
            let l = listener.borrow();
            let accepted = l.accept_slot.lock().unwrap().drain(..).collect();
            accepted
        };
        for stream in accepted {
            if stream.set_nonblocking(true).is_err() {
                continue;
            }
            let probe = match stream.try_clone() {
                Ok(clone) => clone,
                Err(e) => {
                    warn!(error = %e, "failed to clone accepted socket");
                    continue;
                }
            };
            Self::adopt_stream(listener, d, Box::new(stream), Box::new(probe));
        }
    }

    fn handle_handshake_done(
        listener: &Rc<RefCell<Self>>,
        unknown: &Rc<RefCell<UnknownProxy>>,
        d: &mut Dispatcher,
        success: bool,
    ) {
        let unknown_target = unknown.borrow().target();
        d.remove_handler(EventType::HandshakeSuccess, unknown_target);
        d.remove_handler(EventType::HandshakeFailure, unknown_target);

        let mut l = listener.borrow_mut();
        l.new_clients.retain(|c| !Rc::ptr_eq(c, unknown));

        if success {
            if let Some(parts) = unknown.borrow_mut().take_parts() {
                let mux = Arc::clone(&l.mux);
                let proxy = ClientProxy::new(parts, d, mux);
                l.waiting_clients.push_back(proxy);
                l.sink
                    .add_event(Event::new(EventType::ClientListenerConnected, l.target));
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(socket) = self.listen_socket.take() {
            self.mux.remove_socket(socket);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
