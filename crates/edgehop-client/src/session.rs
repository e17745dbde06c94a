//! The client session: one outbound connection through its full lifecycle.
//!
//! A session is always in exactly one state:
//!
//! ```text
//! Idle ──connect()──► Resolving ──ok──► Connecting ──tcp ok──► AwaitingHello
//!   any ──failure──► Disconnecting ──► Idle   (ClientConnectionFailed{retry})
//! AwaitingHello ──Hello(version ok)──► Active (ClientConnected, screen enabled)
//! Active ──disconnect/error──► Disconnecting ──► Idle (ClientDisconnected)
//! Active ──ScreenSuspend──► Idle, reconnect on ScreenResume
//! ```
//!
//! Everything here runs on the dispatcher thread.  The session is stored in
//! an `Rc<RefCell<_>>`; registered handlers capture the `Rc` and borrow for
//! the duration of one callback.  The only helper threads are the connector
//! (one blocking TCP dial) and the file-chunk producer, and both talk back
//! exclusively through the event queue.
//!
//! Event targets: the session allocates two handles.  `target` receives
//! screen-originated events (clipboard grabs, shape changes) and the chunk
//! producer's events; `stream_target` receives transport readiness.  Both
//! are fully deregistered on disconnect.  App-facing notifications
//! (`ClientConnected`, `ClientDisconnected`, `ClientConnectionFailed`,
//! `FileReceiveCompleted`) go to the `notify_target` the application passed
//! in, whose handlers the session never touches.

use std::cell::RefCell;
use std::net::{TcpStream, ToSocketAddrs};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use edgehop_core::protocol::hello::{
    encode_hello_back, parse_hello, HelloParse, MIN_SERVER_VERSION, PROTOCOL_VERSION,
};
use edgehop_core::protocol::messages::{self, options};
use edgehop_core::{
    decode_message, encode_message, AssembleProgress, ChunkAssembler, Chunker, Clipboard,
    ClipboardId, Dispatcher, Event, EventData, EventSink, EventType, FillOutcome, FrameStream,
    Message, ProtocolVersion, SocketId, SocketMultiplexer, SocketProbe, StreamNotifyJob,
    StreamSignals, Target, TimerId, CLIPBOARD_COUNT,
};

use crate::screen::LocalScreen;

/// How long the whole resolve + dial + hello sequence may take.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Session configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// This screen's logical name; the server's routing key.
    pub name: String,
    /// Server address, `host:port`.
    pub server_addr: String,
    /// Whether the application should reconnect after failures.
    pub restartable: bool,
}

/// Lifecycle state.  See module docs for the transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Resolving,
    Connecting,
    AwaitingHello,
    Active,
    Disconnecting,
}

pub struct ClientSession {
    cfg: ClientConfig,
    screen: Arc<dyn LocalScreen>,
    mux: Arc<SocketMultiplexer>,
    sink: EventSink,

    state: SessionState,
    /// Screen + chunker events.
    target: Target,
    /// Transport readiness events.
    stream_target: Target,
    /// App-facing notifications; owned by the application.
    notify_target: Target,

    stream: Option<FrameStream>,
    signals: Option<Arc<StreamSignals>>,
    mux_socket: Option<SocketId>,
    /// Hand-off slot filled by the connector thread.
    pending_stream: Arc<Mutex<Option<TcpStream>>>,
    connect_timer: Option<TimerId>,

    negotiated: Option<ProtocolVersion>,
    active: bool,
    suspended: bool,
    connect_on_resume: bool,
    restartable: bool,
    enable_clipboard: bool,

    /// Latest enter sequence; stamps outgoing clipboard grabs.
    enter_seq: u32,
    own_clipboard: [bool; CLIPBOARD_COUNT],
    sent_clipboard: [bool; CLIPBOARD_COUNT],
    time_clipboard: [u32; CLIPBOARD_COUNT],
    data_clipboard: [Vec<u8>; CLIPBOARD_COUNT],
    clipboard_assemblers: [ChunkAssembler; CLIPBOARD_COUNT],
    file_assembler: ChunkAssembler,

    chunker: Chunker,
    send_file_thread: Option<JoinHandle<()>>,
}

impl ClientSession {
    /// Creates the session and registers the suspend/resume handlers on
    /// `notify_target` (they outlive individual connections).
    pub fn new(
        cfg: ClientConfig,
        screen: Arc<dyn LocalScreen>,
        mux: Arc<SocketMultiplexer>,
        d: &mut Dispatcher,
        notify_target: Target,
    ) -> Rc<RefCell<Self>> {
        let restartable = cfg.restartable;
        let session = Rc::new(RefCell::new(Self {
            cfg,
            screen,
            mux,
            sink: d.sink(),
            state: SessionState::Idle,
            target: d.next_target(),
            stream_target: d.next_target(),
            notify_target,
            stream: None,
            signals: None,
            mux_socket: None,
            pending_stream: Arc::new(Mutex::new(None)),
            connect_timer: None,
            negotiated: None,
            active: false,
            suspended: false,
            connect_on_resume: false,
            restartable,
            enable_clipboard: true,
            enter_seq: 0,
            own_clipboard: [false; CLIPBOARD_COUNT],
            sent_clipboard: [false; CLIPBOARD_COUNT],
            time_clipboard: [0; CLIPBOARD_COUNT],
            data_clipboard: Default::default(),
            clipboard_assemblers: std::array::from_fn(|_| ChunkAssembler::new()),
            file_assembler: ChunkAssembler::new(),
            chunker: Chunker::new(),
            send_file_thread: None,
        }));

        let s = Rc::clone(&session);
        d.add_handler(EventType::ScreenSuspend, notify_target, move |d, _| {
            s.borrow_mut().handle_suspend(d);
        });
        let s = Rc::clone(&session);
        d.add_handler(EventType::ScreenResume, notify_target, move |d, _| {
            Self::handle_resume(&s, d);
        });

        session
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Target for screen-originated events (`ClipboardGrabbed`,
    /// `ScreenShapeChanged`); the platform adapter posts here.
    pub fn target(&self) -> Target {
        self.target
    }

    pub fn stream_target(&self) -> Target {
        self.stream_target
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn is_restartable(&self) -> bool {
        self.restartable
    }

    pub fn negotiated_version(&self) -> Option<ProtocolVersion> {
        self.negotiated
    }

    pub fn owns_clipboard(&self, id: ClipboardId) -> bool {
        self.own_clipboard[id as usize]
    }

    pub fn sent_clipboard(&self, id: ClipboardId) -> bool {
        self.sent_clipboard[id as usize]
    }

    // ── Connecting ────────────────────────────────────────────────────────────

    /// Starts a connection attempt.  No-op unless `Idle`; deferred until
    /// resume while suspended.
    pub fn connect(session: &Rc<RefCell<Self>>, d: &mut Dispatcher) {
        {
            let mut s = session.borrow_mut();
            if s.state != SessionState::Idle {
                return;
            }
            if s.suspended {
                s.connect_on_resume = true;
                return;
            }
            s.state = SessionState::Resolving;
        }

        // Resolve on every attempt: a roaming laptop's server address can
        // change between connects.
        let addr = {
            let mut s = session.borrow_mut();
            match s.cfg.server_addr.to_socket_addrs().map(|mut a| a.next()) {
                Ok(Some(addr)) => {
                    info!(server = %s.cfg.server_addr, %addr, "connecting to server");
                    addr
                }
                Ok(None) | Err(_) => {
                    let msg = format!("failed to resolve {}", s.cfg.server_addr);
                    s.state = SessionState::Idle;
                    s.send_connection_failed(d, &msg);
                    return;
                }
            }
        };

        let mut s = session.borrow_mut();
        s.state = SessionState::Connecting;
        s.setup_connecting(session, d);
        s.setup_timer(session, d);

        // Dial on a helper thread; handlers must not block.
        *s.pending_stream.lock().unwrap() = None; // discard a stale dial
        let slot = Arc::clone(&s.pending_stream);
        let sink = s.sink.clone();
        let stream_target = s.stream_target;
        std::thread::Builder::new()
            .name("edgehop-connect".to_string())
            .spawn(move || match TcpStream::connect(addr) {
                Ok(stream) => {
                    if stream.set_nonblocking(true).is_err() {
                        sink.add_event(Event::with_data(
                            EventType::SocketConnectionFailed,
                            stream_target,
                            EventData::Fail {
                                msg: "failed to configure socket".to_string(),
                                retry: true,
                            },
                        ));
                        return;
                    }
                    *slot.lock().unwrap() = Some(stream);
                    sink.add_event(Event::new(EventType::SocketConnected, stream_target));
                }
                Err(e) => {
                    sink.add_event(Event::with_data(
                        EventType::SocketConnectionFailed,
                        stream_target,
                        EventData::Fail {
                            msg: e.to_string(),
                            retry: true,
                        },
                    ));
                }
            })
            .expect("failed to spawn connector thread");
    }

    /// Attaches an already-connected stream, as used both by the TCP path
    /// and by tests driving an in-memory pipe.  The session takes over in
    /// `AwaitingHello`.
    pub fn attach_stream(
        session: &Rc<RefCell<Self>>,
        d: &mut Dispatcher,
        stream: Box<dyn edgehop_core::DataStream>,
        probe: Box<dyn SocketProbe>,
    ) {
        let mut s = session.borrow_mut();
        s.cleanup_connecting(d);

        let signals = StreamSignals::new();
        let socket = s.mux.add_socket(
            probe,
            Box::new(StreamNotifyJob::new(
                Arc::clone(&signals),
                s.sink.clone(),
                s.stream_target,
            )),
            s.stream_target,
            s.sink.clone(),
        );
        s.stream = Some(FrameStream::new(stream));
        s.signals = Some(signals);
        s.mux_socket = Some(socket);
        s.state = SessionState::AwaitingHello;

        // fresh connection, fresh clipboard state
        for id in 0..CLIPBOARD_COUNT {
            s.own_clipboard[id] = false;
            s.sent_clipboard[id] = false;
            s.time_clipboard[id] = 0;
            s.data_clipboard[id].clear();
        }

        s.setup_connection(session, d);
        debug!("connected; waiting for server hello");
    }

    fn setup_connecting(&self, session: &Rc<RefCell<Self>>, d: &mut Dispatcher) {
        let s = Rc::clone(session);
        d.add_handler(EventType::SocketConnected, self.stream_target, move |d, _| {
            let stream = s.borrow_mut().pending_stream.lock().unwrap().take();
            if let Some(stream) = stream {
                match stream.try_clone() {
                    Ok(probe) => {
                        Self::attach_stream(&s, d, Box::new(stream), Box::new(probe));
                    }
                    Err(e) => {
                        let mut session = s.borrow_mut();
                        session.cleanup_timer(d);
                        session.cleanup_connecting(d);
                        session.state = SessionState::Idle;
                        session.send_connection_failed(d, &e.to_string());
                    }
                }
            }
        });
        let s = Rc::clone(session);
        d.add_handler(
            EventType::SocketConnectionFailed,
            self.stream_target,
            move |d, ev| {
                let msg = match &ev.data {
                    EventData::Fail { msg, .. } => msg.clone(),
                    _ => "connection failed".to_string(),
                };
                let mut session = s.borrow_mut();
                session.cleanup_timer(d);
                session.cleanup_connecting(d);
                session.state = SessionState::Idle;
                debug!(%msg, "connection failed");
                session.send_connection_failed(d, &msg);
            },
        );
    }

    fn setup_connection(&self, session: &Rc<RefCell<Self>>, d: &mut Dispatcher) {
        let s = Rc::clone(session);
        d.add_handler(EventType::StreamInputReady, self.stream_target, move |d, _| {
            Self::on_input_ready(&s, d);
        });
        let s = Rc::clone(session);
        d.add_handler(EventType::StreamOutputReady, self.stream_target, move |d, _| {
            s.borrow_mut().handle_output_ready(d);
        });
        for etype in [
            EventType::SocketDisconnected,
            EventType::StreamInputShutdown,
            EventType::StreamOutputShutdown,
            EventType::SocketError,
        ] {
            let s = Rc::clone(session);
            d.add_handler(etype, self.stream_target, move |d, _| {
                s.borrow_mut().handle_disconnected(d);
            });
        }
        let s = Rc::clone(session);
        d.add_handler(EventType::StreamOutputError, self.stream_target, move |d, _| {
            s.borrow_mut().handle_output_error(d);
        });
        let s = Rc::clone(session);
        d.add_handler(EventType::SocketStopRetry, self.stream_target, move |_, _| {
            s.borrow_mut().restartable = false;
        });
    }

    /// Drives the stream and, when the hello completes during this drain,
    /// finishes the Active-state handler registration (which needs the `Rc`
    /// the closure holds).
    fn on_input_ready(session: &Rc<RefCell<Self>>, d: &mut Dispatcher) {
        let was_awaiting = session.borrow().state == SessionState::AwaitingHello;
        session.borrow_mut().handle_input_ready(d);
        if was_awaiting && session.borrow().state == SessionState::Active {
            let s = session.borrow();
            s.setup_screen(session, d);
        }
    }

    /// Registered once the handshake completes; these are the handlers a
    /// live session needs.
    fn setup_screen(&self, session: &Rc<RefCell<Self>>, d: &mut Dispatcher) {
        let s = Rc::clone(session);
        d.add_handler(EventType::ClipboardGrabbed, self.target, move |d, ev| {
            s.borrow_mut().handle_clipboard_grabbed(d, ev);
        });
        let s = Rc::clone(session);
        d.add_handler(EventType::ScreenShapeChanged, self.target, move |d, _| {
            s.borrow_mut().send_info(d);
        });
        let s = Rc::clone(session);
        d.add_handler(EventType::ClipboardSending, self.target, move |d, ev| {
            if let EventData::ClipboardChunk(chunk) = &ev.data {
                let msg = chunk.to_message();
                s.borrow_mut().write_message(d, &msg);
            }
        });
        let s = Rc::clone(session);
        d.add_handler(EventType::FileChunkSending, self.target, move |d, ev| {
            if let EventData::FileChunk(chunk) = &ev.data {
                let msg = chunk.to_message();
                s.borrow_mut().write_message(d, &msg);
            }
        });
        let s = Rc::clone(session);
        d.add_handler(EventType::FileKeepAlive, self.target, move |d, _| {
            let mut session = s.borrow_mut();
            if session
                .negotiated
                .is_some_and(|v| v.supports_chunked_transfers())
            {
                session.write_message(d, &Message::KeepAlive);
            }
        });
    }

    fn setup_timer(&mut self, session: &Rc<RefCell<Self>>, d: &mut Dispatcher) {
        let timer = d.new_timer(CONNECT_TIMEOUT, true);
        self.connect_timer = Some(timer);
        let s = Rc::clone(session);
        d.add_handler(EventType::Timer, timer, move |d, _| {
            s.borrow_mut().handle_connect_timeout(d);
        });
    }

    // ── Cleanup ───────────────────────────────────────────────────────────────

    fn cleanup_timer(&mut self, d: &mut Dispatcher) {
        if let Some(timer) = self.connect_timer.take() {
            d.remove_handler(EventType::Timer, timer);
            d.delete_timer(timer);
        }
    }

    fn cleanup_connecting(&self, d: &mut Dispatcher) {
        d.remove_handler(EventType::SocketConnected, self.stream_target);
        d.remove_handler(EventType::SocketConnectionFailed, self.stream_target);
    }

    fn cleanup_connection(&mut self, d: &mut Dispatcher) {
        for etype in [
            EventType::StreamInputReady,
            EventType::StreamOutputReady,
            EventType::StreamInputShutdown,
            EventType::StreamOutputShutdown,
            EventType::StreamOutputError,
            EventType::SocketDisconnected,
            EventType::SocketError,
            EventType::SocketStopRetry,
        ] {
            d.remove_handler(etype, self.stream_target);
        }
        if let Some(socket) = self.mux_socket.take() {
            self.mux.remove_socket(socket);
        }
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
        self.signals = None;
    }

    fn cleanup_screen(&mut self, d: &mut Dispatcher) {
        // negotiated is set exactly when the handshake completed and the
        // screen was enabled
        if self.negotiated.take().is_some() {
            self.screen.disable();
            d.remove_handler(EventType::ClipboardGrabbed, self.target);
            d.remove_handler(EventType::ScreenShapeChanged, self.target);
            d.remove_handler(EventType::ClipboardSending, self.target);
            d.remove_handler(EventType::FileChunkSending, self.target);
            d.remove_handler(EventType::FileKeepAlive, self.target);
        }
    }

    /// Tears the connection down.  `fail_msg` distinguishes a failure
    /// (`ClientConnectionFailed{retry}`) from an orderly disconnect
    /// (`ClientDisconnected`).
    pub fn disconnect(&mut self, d: &mut Dispatcher, fail_msg: Option<&str>) {
        self.state = SessionState::Disconnecting;
        self.connect_on_resume = false;
        if self.chunker.is_chunking_file() {
            self.chunker.interrupt_file();
        }
        self.cleanup_timer(d);
        self.cleanup_screen(d);
        self.cleanup_connecting(d);
        self.cleanup_connection(d);
        // detach the producer; it observes the interrupt flag and exits
        self.send_file_thread.take();
        self.active = false;
        self.state = SessionState::Idle;
        match fail_msg {
            Some(msg) => self.send_connection_failed(d, msg),
            None => d.add_event(Event::new(EventType::ClientDisconnected, self.notify_target)),
        }
    }

    fn send_connection_failed(&self, d: &mut Dispatcher, msg: &str) {
        d.add_event(Event::with_data(
            EventType::ClientConnectionFailed,
            self.notify_target,
            EventData::Fail {
                msg: msg.to_string(),
                retry: true,
            },
        ));
    }

    // ── Transport handlers ────────────────────────────────────────────────────

    fn handle_input_ready(&mut self, d: &mut Dispatcher) {
        let closed = match self.stream.as_mut() {
            Some(stream) => match stream.fill() {
                Ok(FillOutcome::Closed) => true,
                Ok(FillOutcome::Drained) => false,
                Err(e) => {
                    warn!(error = %e, "stream read error");
                    self.handle_disconnected(d);
                    return;
                }
            },
            None => return,
        };

        match self.state {
            SessionState::AwaitingHello => self.handle_hello(d),
            SessionState::Active => self.process_frames(d),
            _ => {}
        }

        if self.stream.is_none() {
            return; // a message tore the session down already
        }
        if closed {
            self.handle_disconnected(d);
            return;
        }
        if let Some(signals) = &self.signals {
            signals.rearm_read();
        }
    }

    fn handle_output_ready(&mut self, _d: &mut Dispatcher) {
        let result = match self.stream.as_mut() {
            Some(stream) => stream.flush(),
            None => return,
        };
        match result {
            Ok(true) => {}
            Ok(false) => {
                if let Some(signals) = &self.signals {
                    signals.set_want_write(true);
                }
            }
            Err(e) => {
                warn!(error = %e, "stream write error");
                self.sink
                    .add_event(Event::new(EventType::StreamOutputError, self.stream_target));
            }
        }
    }

    fn handle_disconnected(&mut self, d: &mut Dispatcher) {
        debug!("disconnected from server");
        self.disconnect(d, None);
    }

    fn handle_output_error(&mut self, d: &mut Dispatcher) {
        warn!("error sending to server");
        self.disconnect(d, None);
    }

    fn handle_connect_timeout(&mut self, d: &mut Dispatcher) {
        self.connect_timer = None;
        debug!("connection timed out");
        self.cleanup_screen(d);
        self.cleanup_connecting(d);
        self.cleanup_connection(d);
        self.state = SessionState::Idle;
        self.send_connection_failed(d, "Timed out");
    }

    // ── Handshake ─────────────────────────────────────────────────────────────

    fn handle_hello(&mut self, d: &mut Dispatcher) {
        let parse = {
            let stream = match self.stream.as_mut() {
                Some(s) => s,
                None => return,
            };
            match parse_hello(stream.buffered()) {
                Ok(HelloParse::Incomplete) => return,
                Ok(HelloParse::Done { value, consumed }) => {
                    stream.consume(consumed);
                    Ok(value)
                }
                Err(e) => Err(e),
            }
        };

        let server_version = match parse {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "bad hello from server");
                self.cleanup_timer(d);
                self.cleanup_connection(d);
                self.state = SessionState::Idle;
                self.send_connection_failed(
                    d,
                    "Protocol error from server, check encryption settings",
                );
                return;
            }
        };

        debug!(version = %server_version, "got server hello");
        if server_version.major < MIN_SERVER_VERSION.major
            || (server_version.major == MIN_SERVER_VERSION.major
                && server_version.minor < MIN_SERVER_VERSION.minor)
        {
            self.cleanup_timer(d);
            self.cleanup_connection(d);
            self.state = SessionState::Idle;
            self.send_connection_failed(d, "server is incompatible");
            return;
        }

        // reply with our version and name
        let hello_back = encode_hello_back(PROTOCOL_VERSION, &self.cfg.name);
        if let Some(stream) = self.stream.as_mut() {
            if let Err(e) = stream.write_raw(&hello_back) {
                warn!(error = %e, "failed to send hello reply");
                self.handle_disconnected(d);
                return;
            }
        }

        // a 1.6 client speaking to a 1.5 server degrades to 1.5
        let negotiated = server_version.min(PROTOCOL_VERSION);
        self.negotiated = Some(negotiated);
        self.state = SessionState::Active;
        self.cleanup_timer(d);

        info!(version = %negotiated, "handshake complete");
        self.screen.enable();
        d.add_event(Event::new(EventType::ClientConnected, self.notify_target));

        // Frames may already be buffered behind the hello; we will get no
        // further readable notification for them, so synthesise one.
        if self.stream.as_ref().is_some_and(|s| s.has_frame()) {
            self.sink
                .add_event(Event::new(EventType::StreamInputReady, self.stream_target));
        }
    }

    // ── Active-state message handling ─────────────────────────────────────────

    fn process_frames(&mut self, d: &mut Dispatcher) {
        loop {
            let payload = match self.stream.as_mut() {
                Some(stream) => match stream.next_frame() {
                    Ok(Some(payload)) => payload,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "bad frame from server");
                        self.write_message(d, &Message::Bad);
                        self.disconnect(d, Some("protocol error from server"));
                        return;
                    }
                },
                None => return,
            };

            // a 1.4 peer sends the markless clipboard shape
            if payload.len() >= 4
                && payload[0..4] == messages::CODE_CLIPBOARD
                && self
                    .negotiated
                    .is_some_and(|v| !v.supports_chunked_transfers())
            {
                match messages::decode_clipboard_data(&payload) {
                    Ok((id, _seq, data)) => self.apply_remote_clipboard(id, &data),
                    Err(e) => warn!(error = %e, "bad 1.4 clipboard frame"),
                }
                continue;
            }

            let msg = match decode_message(&payload) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(error = %e, "undecodable frame from server");
                    self.write_message(d, &Message::Bad);
                    self.disconnect(d, Some("protocol error from server"));
                    return;
                }
            };
            self.handle_message(d, msg);
            if self.state != SessionState::Active {
                return; // the message tore the session down
            }
        }
    }

    fn handle_message(&mut self, d: &mut Dispatcher, msg: Message) {
        match msg {
            Message::Enter { x, y, seq, mask } => {
                self.active = true;
                self.enter_seq = seq;
                self.screen.mouse_move(x, y);
                self.screen.enter(mask);
                // a file drag to another screen invalidates the send
                if self.chunker.is_chunking_file() {
                    self.chunker.interrupt_file();
                    self.send_file_thread = None;
                }
            }
            Message::Leave => {
                if self.enable_clipboard {
                    for id in 0..CLIPBOARD_COUNT as u8 {
                        if self.own_clipboard[id as usize] {
                            self.send_clipboard(d, id);
                        }
                    }
                }
                self.screen.leave();
                self.active = false;
            }
            Message::GrabClipboard { id, .. } => {
                if (id as usize) < CLIPBOARD_COUNT {
                    // the remote side owns this clipboard now
                    self.screen.grab_clipboard(id);
                    self.own_clipboard[id as usize] = false;
                    self.sent_clipboard[id as usize] = false;
                }
            }
            Message::Screensaver { on } => self.screen.screensaver(on),
            Message::KeyDown { key, mask, button } => self.screen.key_down(key, mask, button),
            Message::KeyRepeat {
                key,
                mask,
                count,
                button,
            } => self.screen.key_repeat(key, mask, count, button),
            Message::KeyUp { key, mask, button } => self.screen.key_up(key, mask, button),
            Message::MouseDown { button } => self.screen.mouse_down(button),
            Message::MouseUp { button } => self.screen.mouse_up(button),
            Message::MouseMove { x, y } => self.screen.mouse_move(x, y),
            Message::MouseRelMove { dx, dy } => self.screen.mouse_relative_move(dx, dy),
            Message::MouseWheel { x_delta, y_delta } => self.screen.mouse_wheel(x_delta, y_delta),
            Message::QueryInfo => self.send_info(d),
            Message::InfoAck => {}
            Message::ResetOptions => {
                self.enable_clipboard = true;
                self.screen.reset_options();
            }
            Message::SetOptions { options: opts } => {
                for pair in opts.chunks(2) {
                    if let [id, value] = pair {
                        if *id == options::CLIPBOARD_SHARING {
                            self.enable_clipboard = *value != 0;
                            if !self.enable_clipboard {
                                info!("clipboard sharing is disabled");
                            }
                        }
                    }
                }
                self.screen.set_options(&opts);
            }
            Message::ClipboardChunk {
                id,
                seq: _,
                mark,
                payload,
            } => self.handle_clipboard_chunk(id, mark, &payload),
            Message::FileChunk { mark, payload } => self.handle_file_chunk(d, mark, &payload),
            Message::DragInfo { file_count, info } => {
                debug!(file_count, info = %info, "drag info received");
            }
            Message::KeepAlive => {
                // echo so the server's missed-keepalive counter resets
                self.write_message(d, &Message::KeepAlive);
            }
            Message::Noop | Message::Synchronize | Message::Reset => {}
            Message::Busy => {
                self.disconnect(d, Some("server already has a client with our name"));
            }
            Message::UnknownClient => {
                self.disconnect(d, Some("server refused client with our name"));
            }
            Message::Incompatible { major, minor } => {
                let msg = format!("server is incompatible (server speaks {major}.{minor})");
                self.disconnect(d, Some(&msg));
            }
            Message::Bad => {
                self.disconnect(d, Some("server disconnected due to a protocol error"));
            }
            other => {
                warn!(code = ?other.code(), "unexpected message from server");
            }
        }
    }

    fn handle_clipboard_chunk(&mut self, id: u8, mark: u8, payload: &[u8]) {
        if (id as usize) >= CLIPBOARD_COUNT {
            warn!(id, "clipboard chunk with out-of-range id");
            return;
        }
        match self.clipboard_assemblers[id as usize].handle_raw(mark, payload) {
            Ok(AssembleProgress::Finished(bytes)) => self.apply_remote_clipboard(id, &bytes),
            Ok(_) => {}
            Err(e) => warn!(id, error = %e, "clipboard transfer failed"),
        }
    }

    fn apply_remote_clipboard(&mut self, id: u8, bytes: &[u8]) {
        if (id as usize) >= CLIPBOARD_COUNT {
            warn!(id, "clipboard snapshot with out-of-range id");
            return;
        }
        let clipboard = match Clipboard::unmarshall(bytes) {
            Ok(c) => c,
            Err(e) => {
                warn!(id, error = %e, "unusable clipboard snapshot");
                return;
            }
        };
        // equal time means the snapshot is unchanged; skip the round trip
        if self.time_clipboard[id as usize] != 0
            && clipboard.time() == self.time_clipboard[id as usize]
        {
            return;
        }
        self.time_clipboard[id as usize] = clipboard.time();
        self.screen.set_clipboard(id, &clipboard);
        self.own_clipboard[id as usize] = false;
        self.sent_clipboard[id as usize] = false;
    }

    fn handle_file_chunk(&mut self, d: &mut Dispatcher, mark: u8, payload: &[u8]) {
        match self.file_assembler.handle_raw(mark, payload) {
            Ok(AssembleProgress::Started { expected }) => {
                debug!(expected, "receiving file");
            }
            Ok(AssembleProgress::Continued { .. }) => {}
            Ok(AssembleProgress::Finished(bytes)) => {
                info!(size = bytes.len(), "file transfer finished");
                d.add_event(Event::with_data(
                    EventType::FileReceiveCompleted,
                    self.notify_target,
                    EventData::Bytes(bytes),
                ));
            }
            Err(e) => {
                warn!(error = %e, "file transfer failed");
                d.add_event(Event::new(
                    EventType::FileTransferFailed,
                    self.notify_target,
                ));
            }
        }
    }

    // ── Screen-side events ────────────────────────────────────────────────────

    fn handle_clipboard_grabbed(&mut self, d: &mut Dispatcher, ev: &Event) {
        if !self.enable_clipboard {
            return;
        }
        let EventData::ClipboardInfo { id, .. } = ev.data else {
            return;
        };
        if (id as usize) >= CLIPBOARD_COUNT {
            return;
        }

        // assert ownership to the server
        let grab = Message::GrabClipboard {
            id,
            seq: self.enter_seq,
        };
        self.write_message(d, &grab);
        self.own_clipboard[id as usize] = true;
        self.sent_clipboard[id as usize] = false;
        self.time_clipboard[id as usize] = 0;

        // while this screen is active the data goes over on leave; when
        // inactive, nothing else will trigger a send, so do it now
        if !self.active {
            self.send_clipboard(d, id);
        }
    }

    fn send_clipboard(&mut self, d: &mut Dispatcher, id: u8) {
        let clipboard = self.screen.get_clipboard(id);
        let idx = id as usize;

        if self.time_clipboard[idx] != 0 && clipboard.time() == self.time_clipboard[idx] {
            return; // unchanged since last send
        }
        self.time_clipboard[idx] = clipboard.time();

        let data = clipboard.marshall();
        if self.sent_clipboard[idx] && data == self.data_clipboard[idx] {
            return;
        }
        self.sent_clipboard[idx] = true;
        self.data_clipboard[idx] = data.clone();

        match self.negotiated {
            Some(v) if v.supports_chunked_transfers() => {
                // the producer's events are consumed by the ClipboardSending
                // handler, which writes one frame per chunk
                let chunker = self.chunker.clone();
                chunker.send_clipboard(id, self.enter_seq, &data, &self.sink, self.target);
            }
            Some(_) => {
                let payload = messages::encode_clipboard_data(id, self.enter_seq, &data);
                self.write_payload(d, &payload);
            }
            None => {}
        }
    }

    fn send_info(&mut self, d: &mut Dispatcher) {
        let shape = self.screen.shape();
        let cursor = self.screen.cursor_pos();
        let info = Message::Info {
            x: shape.x,
            y: shape.y,
            w: shape.w,
            h: shape.h,
            zone: 0,
            mx: cursor.x,
            my: cursor.y,
        };
        self.write_message(d, &info);
    }

    // ── File sending ──────────────────────────────────────────────────────────

    /// Starts sending `data` as a chunked file transfer.  A transfer already
    /// in flight is interrupted first; at most one file send is active per
    /// session.
    pub fn send_file(&mut self, data: Vec<u8>) {
        if self.chunker.is_chunking_file() {
            self.chunker.interrupt_file();
        }
        let chunker = self.chunker.clone();
        let sink = self.sink.clone();
        let target = self.target;
        let handle = std::thread::Builder::new()
            .name("edgehop-sendfile".to_string())
            .spawn(move || {
                chunker.send_file(&data, &sink, target);
            })
            .expect("failed to spawn file producer thread");
        self.send_file_thread = Some(handle);
    }

    // ── Suspend / resume ──────────────────────────────────────────────────────

    fn handle_suspend(&mut self, d: &mut Dispatcher) {
        info!("suspend");
        self.suspended = true;
        let was_connected = self.is_connected();
        self.disconnect(d, None);
        self.connect_on_resume = was_connected;
    }

    fn handle_resume(session: &Rc<RefCell<Self>>, d: &mut Dispatcher) {
        info!("resume");
        let reconnect = {
            let mut s = session.borrow_mut();
            s.suspended = false;
            std::mem::replace(&mut s.connect_on_resume, false)
        };
        if reconnect {
            Self::connect(session, d);
        }
    }

    // ── Writing ───────────────────────────────────────────────────────────────

    fn write_message(&mut self, d: &mut Dispatcher, msg: &Message) {
        let payload = encode_message(msg);
        self.write_payload(d, &payload);
    }

    fn write_payload(&mut self, _d: &mut Dispatcher, payload: &[u8]) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        match stream.write_frame(payload) {
            Ok(()) => {
                if stream.wants_write() {
                    if let Some(signals) = &self.signals {
                        signals.set_want_write(true);
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "stream write failed");
                self.sink
                    .add_event(Event::new(EventType::StreamOutputError, self.stream_target));
            }
        }
    }

}
