//! Server-side client proxies.
//!
//! Every accepted socket first gets an [`UnknownProxy`]: a short-lived
//! object that sends the server hello, waits up to 30 seconds for the
//! client's reply, and validates name and version.  On success it
//! dissolves into a [`ClientProxy`] — the long-lived representative of one
//! connected client, parameterised by the negotiated protocol version.
//!
//! # Versioned behaviour
//!
//! Instead of one proxy subtype per protocol minor, the version drives a
//! small strategy table ([`VersionTraits`]):
//!
//! | negotiated | clipboard            | files  | keepalive |
//! |------------|----------------------|--------|-----------|
//! | 1.4        | single frame, no mark| —      | —         |
//! | 1.5        | chunked              | chunked| `CALV`    |
//! | 1.6        | chunked, event-driven| chunked| `CALV`    |
//!
//! A client advertising a higher minor than the server speaks is degraded
//! to the server's minor.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use edgehop_core::protocol::hello::{
    encode_hello, parse_hello_back, HelloParse, MIN_CLIENT_VERSION, PROTOCOL_VERSION,
};
use edgehop_core::protocol::messages;
use edgehop_core::{
    decode_message, encode_message, AssembleProgress, ChunkAssembler, Chunker, Clipboard,
    ClipboardChunk, Dispatcher, Event, EventData, EventSink, EventType, FillOutcome, FrameStream,
    Message, ProtocolVersion, SocketId, SocketMultiplexer, SocketProbe, StreamNotifyJob,
    StreamSignals, Target, TimerId, CLIPBOARD_COUNT,
};

/// Handshake grace period before the socket is dropped.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between server keepalives on 1.5+ connections.
const KEEPALIVE_RATE: Duration = Duration::from_secs(3);

/// Consecutive unanswered keepalives before the client is declared dead.
const MAX_MISSED_KEEPALIVES: u32 = 3;

/// Capability flags derived from the negotiated protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionTraits {
    /// `CALV` keepalives with a missed-counter watchdog (1.5+).
    pub keepalives: bool,
    /// `DCLP`/`DFTR` start/data/end chunking (1.5+).
    pub chunked_transfers: bool,
    /// Clipboard sends go through dispatcher events (1.6+).
    pub clipboard_events: bool,
}

impl VersionTraits {
    pub fn for_version(version: ProtocolVersion) -> Self {
        Self {
            keepalives: version.supports_chunked_transfers(),
            chunked_transfers: version.supports_chunked_transfers(),
            clipboard_events: version.supports_clipboard_events(),
        }
    }
}

/// What survives a successful handshake and seeds the [`ClientProxy`].
pub struct HandshakeParts {
    pub name: String,
    pub version: ProtocolVersion,
    stream: FrameStream,
    signals: Arc<StreamSignals>,
    mux_socket: SocketId,
    target: Target,
}

// ── Unknown proxy ─────────────────────────────────────────────────────────────

/// A freshly accepted connection of unknown name and version.
///
/// Emits `HandshakeSuccess` or `HandshakeFailure` on its target; on
/// success, [`UnknownProxy::take_parts`] yields the negotiated stream.
pub struct UnknownProxy {
    target: Target,
    stream: Option<FrameStream>,
    signals: Option<Arc<StreamSignals>>,
    mux: Arc<SocketMultiplexer>,
    mux_socket: Option<SocketId>,
    timer: Option<TimerId>,
    sink: EventSink,
    result: Option<HandshakeParts>,
}

impl UnknownProxy {
    /// Adopts an accepted stream: sends the server hello and starts the
    /// handshake timer.
    pub fn start(
        d: &mut Dispatcher,
        mux: Arc<SocketMultiplexer>,
        stream: Box<dyn edgehop_core::DataStream>,
        probe: Box<dyn SocketProbe>,
    ) -> Rc<RefCell<Self>> {
        let target = d.next_target();
        let signals = StreamSignals::new();
        let sink = d.sink();
        let mux_socket = mux.add_socket(
            probe,
            Box::new(StreamNotifyJob::new(Arc::clone(&signals), sink.clone(), target)),
            target,
            sink.clone(),
        );

        let mut stream = FrameStream::new(stream);
        if let Err(e) = stream.write_raw(&encode_hello(PROTOCOL_VERSION)) {
            warn!(error = %e, "failed to send hello to new client");
        }

        let timer = d.new_timer(HANDSHAKE_TIMEOUT, true);
        let proxy = Rc::new(RefCell::new(Self {
            target,
            stream: Some(stream),
            signals: Some(signals),
            mux,
            mux_socket: Some(mux_socket),
            timer: Some(timer),
            sink,
            result: None,
        }));

        let p = Rc::clone(&proxy);
        d.add_handler(EventType::StreamInputReady, target, move |d, _| {
            p.borrow_mut().handle_input(d);
        });
        for etype in [
            EventType::SocketError,
            EventType::SocketDisconnected,
            EventType::StreamInputShutdown,
            EventType::StreamOutputShutdown,
            EventType::StreamOutputError,
        ] {
            let p = Rc::clone(&proxy);
            d.add_handler(etype, target, move |d, _| {
                p.borrow_mut().fail(d, "disconnected during handshake");
            });
        }
        let p = Rc::clone(&proxy);
        d.add_handler(EventType::Timer, timer, move |d, _| {
            p.borrow_mut().fail(d, "handshake timed out");
        });

        debug!(target, "awaiting hello reply from new client");
        proxy
    }

    pub fn target(&self) -> Target {
        self.target
    }

    /// The negotiated parts, once `HandshakeSuccess` fired.
    pub fn take_parts(&mut self) -> Option<HandshakeParts> {
        self.result.take()
    }

    fn handle_input(&mut self, d: &mut Dispatcher) {
        let closed = {
            let Some(stream) = self.stream.as_mut() else {
                return;
            };
            match stream.fill() {
                Ok(FillOutcome::Closed) => true,
                Ok(FillOutcome::Drained) => false,
                Err(e) => {
                    warn!(error = %e, "read error during handshake");
                    self.fail(d, "read error during handshake");
                    return;
                }
            }
        };

        let parsed = {
            let stream = self.stream.as_mut().unwrap();
            match parse_hello_back(stream.buffered()) {
                Ok(HelloParse::Incomplete) => {
                    if closed {
                        self.fail(d, "client closed before completing handshake");
                    } else if let Some(signals) = &self.signals {
                        signals.rearm_read();
                    }
                    return;
                }
                Ok(HelloParse::Done { value, consumed }) => {
                    stream.consume(consumed);
                    Ok(value)
                }
                Err(e) => Err(e),
            }
        };

        let (client_version, name) = match parsed {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "malformed hello reply");
                self.write_message(&Message::Bad);
                self.fail(d, "malformed hello reply");
                return;
            }
        };

        debug!(%name, version = %client_version, "client hello received");
        if client_version.major < MIN_CLIENT_VERSION.major
            || (client_version.major == MIN_CLIENT_VERSION.major
                && client_version.minor < MIN_CLIENT_VERSION.minor)
        {
            info!(%name, version = %client_version, "refusing incompatible client");
            self.write_message(&Message::Incompatible {
                major: PROTOCOL_VERSION.major,
                minor: PROTOCOL_VERSION.minor,
            });
            self.fail(d, "incompatible client version");
            return;
        }

        // a newer client degrades to what this server speaks
        let negotiated = client_version.min(PROTOCOL_VERSION);

        self.remove_handlers(d);
        self.result = Some(HandshakeParts {
            name,
            version: negotiated,
            stream: self.stream.take().expect("stream present until handed off"),
            signals: self.signals.take().expect("signals present until handed off"),
            mux_socket: self.mux_socket.take().expect("socket registered"),
            target: self.target,
        });
        self.sink
            .add_event(Event::new(EventType::HandshakeSuccess, self.target));
    }

    fn write_message(&mut self, msg: &Message) {
        if let Some(stream) = self.stream.as_mut() {
            let _ = stream.write_frame(&encode_message(msg));
        }
    }

    fn fail(&mut self, d: &mut Dispatcher, why: &str) {
        debug!(why, "handshake failed; dropping socket");
        self.remove_handlers(d);
        if let Some(socket) = self.mux_socket.take() {
            self.mux.remove_socket(socket);
        }
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
        self.signals = None;
        self.sink
            .add_event(Event::new(EventType::HandshakeFailure, self.target));
    }

    fn remove_handlers(&mut self, d: &mut Dispatcher) {
        for etype in [
            EventType::StreamInputReady,
            EventType::SocketError,
            EventType::SocketDisconnected,
            EventType::StreamInputShutdown,
            EventType::StreamOutputShutdown,
            EventType::StreamOutputError,
        ] {
            d.remove_handler(etype, self.target);
        }
        if let Some(timer) = self.timer.take() {
            d.remove_handler(EventType::Timer, timer);
            d.delete_timer(timer);
        }
    }
}

// ── Client proxy ──────────────────────────────────────────────────────────────

/// Geometry reported by the client's `DINF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientScreenInfo {
    pub x: i16,
    pub y: i16,
    pub w: i16,
    pub h: i16,
    pub mx: i16,
    pub my: i16,
}

/// One connected, handshaken client.
///
/// Events on the proxy's target that the owning server subscribes to:
/// `ClientProxyDisconnected`, `ClipboardGrabbed` (with `ClipboardInfo`),
/// `ClipboardReceived` (with `ClipboardData`), `FileReceiveCompleted`,
/// and `FileTransferFailed`.
pub struct ClientProxy {
    name: String,
    version: ProtocolVersion,
    vtraits: VersionTraits,
    target: Target,
    stream: Option<FrameStream>,
    signals: Option<Arc<StreamSignals>>,
    mux: Arc<SocketMultiplexer>,
    mux_socket: Option<SocketId>,
    sink: EventSink,

    keepalive_timer: Option<TimerId>,
    missed_keepalives: u32,

    screen_info: Option<ClientScreenInfo>,
    clipboard_assemblers: [ChunkAssembler; CLIPBOARD_COUNT],
    file_assembler: ChunkAssembler,
    chunker: Chunker,
    send_file_thread: Option<JoinHandle<()>>,
}

impl ClientProxy {
    /// Promotes handshake parts into a live proxy and registers its
    /// handlers.
    pub fn new(parts: HandshakeParts, d: &mut Dispatcher, mux: Arc<SocketMultiplexer>) -> Rc<RefCell<Self>> {
        let vtraits = VersionTraits::for_version(parts.version);
        let proxy = Rc::new(RefCell::new(Self {
            name: parts.name,
            version: parts.version,
            vtraits,
            target: parts.target,
            stream: Some(parts.stream),
            signals: Some(parts.signals),
            mux,
            mux_socket: Some(parts.mux_socket),
            sink: d.sink(),
            keepalive_timer: None,
            missed_keepalives: 0,
            screen_info: None,
            clipboard_assemblers: std::array::from_fn(|_| ChunkAssembler::new()),
            file_assembler: ChunkAssembler::new(),
            chunker: Chunker::new(),
            send_file_thread: None,
        }));
        let target = proxy.borrow().target;

        let p = Rc::clone(&proxy);
        d.add_handler(EventType::StreamInputReady, target, move |d, _| {
            p.borrow_mut().handle_input(d);
        });
        let p = Rc::clone(&proxy);
        d.add_handler(EventType::StreamOutputReady, target, move |_, _| {
            p.borrow_mut().handle_output_ready();
        });
        for etype in [
            EventType::SocketError,
            EventType::SocketDisconnected,
            EventType::StreamInputShutdown,
            EventType::StreamOutputShutdown,
            EventType::StreamOutputError,
        ] {
            let p = Rc::clone(&proxy);
            d.add_handler(etype, target, move |d, _| {
                p.borrow_mut().disconnect(d);
            });
        }
        let p = Rc::clone(&proxy);
        d.add_handler(EventType::ClipboardSending, target, move |_, ev| {
            if let EventData::ClipboardChunk(chunk) = &ev.data {
                let msg = chunk.to_message();
                p.borrow_mut().write_message(&msg);
            }
        });
        let p = Rc::clone(&proxy);
        d.add_handler(EventType::FileChunkSending, target, move |_, ev| {
            if let EventData::FileChunk(chunk) = &ev.data {
                let msg = chunk.to_message();
                p.borrow_mut().write_message(&msg);
            }
        });
        let p = Rc::clone(&proxy);
        d.add_handler(EventType::FileKeepAlive, target, move |_, _| {
            let mut proxy = p.borrow_mut();
            if proxy.vtraits.keepalives {
                proxy.write_message(&Message::KeepAlive);
            }
        });

        if vtraits.keepalives {
            let timer = d.new_timer(KEEPALIVE_RATE, false);
            proxy.borrow_mut().keepalive_timer = Some(timer);
            let p = Rc::clone(&proxy);
            d.add_handler(EventType::Timer, timer, move |d, _| {
                p.borrow_mut().handle_keepalive_timer(d);
            });
        }

        {
            let proxy_ref = proxy.borrow();
            // frames may already sit behind the hello reply, and the notify
            // latch was consumed delivering it; catch both up
            if proxy_ref.stream.as_ref().is_some_and(|s| s.has_frame()) {
                proxy_ref
                    .sink
                    .add_event(Event::new(EventType::StreamInputReady, proxy_ref.target));
            }
            if let Some(signals) = &proxy_ref.signals {
                signals.rearm_read();
            }
            info!(name = %proxy_ref.name, version = %proxy_ref.version, "client connected");
        }
        proxy
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn traits(&self) -> VersionTraits {
        self.vtraits
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn screen_info(&self) -> Option<ClientScreenInfo> {
        self.screen_info
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    // ── Outbound operations ───────────────────────────────────────────────────

    pub fn enter(&mut self, x: i16, y: i16, seq: u32, mask: i16) {
        self.write_message(&Message::Enter { x, y, seq, mask });
    }

    pub fn leave(&mut self) {
        self.write_message(&Message::Leave);
    }

    pub fn key_down(&mut self, key: u16, mask: u16, button: u16) {
        self.write_message(&Message::KeyDown { key, mask, button });
    }

    pub fn key_repeat(&mut self, key: u16, mask: u16, count: u16, button: u16) {
        self.write_message(&Message::KeyRepeat {
            key,
            mask,
            count,
            button,
        });
    }

    pub fn key_up(&mut self, key: u16, mask: u16, button: u16) {
        self.write_message(&Message::KeyUp { key, mask, button });
    }

    pub fn mouse_down(&mut self, button: i8) {
        self.write_message(&Message::MouseDown { button });
    }

    pub fn mouse_up(&mut self, button: i8) {
        self.write_message(&Message::MouseUp { button });
    }

    pub fn mouse_move(&mut self, x: i16, y: i16) {
        self.write_message(&Message::MouseMove { x, y });
    }

    pub fn mouse_relative_move(&mut self, dx: i16, dy: i16) {
        self.write_message(&Message::MouseRelMove { dx, dy });
    }

    pub fn mouse_wheel(&mut self, x_delta: i16, y_delta: i16) {
        self.write_message(&Message::MouseWheel { x_delta, y_delta });
    }

    pub fn screensaver(&mut self, on: bool) {
        self.write_message(&Message::Screensaver { on });
    }

    pub fn reset_options(&mut self) {
        self.write_message(&Message::ResetOptions);
    }

    pub fn set_options(&mut self, options: &[u32]) {
        self.write_message(&Message::SetOptions {
            options: options.to_vec(),
        });
    }

    pub fn query_info(&mut self) {
        self.write_message(&Message::QueryInfo);
    }

    /// Tells the client it lost clipboard `id` to another screen.
    pub fn grab_clipboard(&mut self, id: u8, seq: u32) {
        self.write_message(&Message::GrabClipboard { id, seq });
    }

    /// Announces a drag operation ahead of its file transfer (1.5+).
    pub fn send_drag_info(&mut self, file_count: u32, info: &str) {
        if !self.vtraits.chunked_transfers {
            return;
        }
        self.write_message(&Message::DragInfo {
            file_count,
            info: info.to_string(),
        });
    }

    /// Ships a clipboard snapshot using the strategy the negotiated
    /// version calls for.
    pub fn send_clipboard(&mut self, id: u8, seq: u32, clipboard: &Clipboard) {
        let data = clipboard.marshall();
        if self.vtraits.clipboard_events {
            // 1.6: the producer posts events, our ClipboardSending handler
            // writes the frames
            let chunker = self.chunker.clone();
            chunker.send_clipboard(id, seq, &data, &self.sink, self.target);
        } else if self.vtraits.chunked_transfers {
            // 1.5: chunk synchronously
            for chunk in chunk_series(id, seq, &data) {
                let msg = chunk.to_message();
                self.write_message(&msg);
            }
        } else {
            // 1.4: one markless frame
            let payload = messages::encode_clipboard_data(id, seq, &data);
            self.write_payload(&payload);
        }
    }

    /// Starts a chunked file send towards this client.  A send already in
    /// flight is interrupted first.
    pub fn send_file(&mut self, data: Vec<u8>) {
        if !self.vtraits.chunked_transfers {
            warn!(name = %self.name, version = %self.version, "client too old for file transfer");
            return;
        }
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

    /// Aborts an in-flight file send at the next chunk boundary.
    pub fn interrupt_file(&mut self) {
        self.chunker.interrupt_file();
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    fn handle_input(&mut self, d: &mut Dispatcher) {
        let closed = {
            let Some(stream) = self.stream.as_mut() else {
                return;
            };
            match stream.fill() {
                Ok(FillOutcome::Closed) => true,
                Ok(FillOutcome::Drained) => false,
                Err(e) => {
                    warn!(name = %self.name, error = %e, "client stream read error");
                    self.disconnect(d);
                    return;
                }
            }
        };

        loop {
            let payload = {
                let Some(stream) = self.stream.as_mut() else {
                    return;
                };
                match stream.next_frame() {
                    Ok(Some(payload)) => payload,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(name = %self.name, error = %e, "bad frame from client");
                        self.write_message(&Message::Bad);
                        self.disconnect(d);
                        return;
                    }
                }
            };

            // 1.4 clipboard frames carry no mark byte
            if payload.len() >= 4
                && payload[0..4] == messages::CODE_CLIPBOARD
                && !self.vtraits.chunked_transfers
            {
                match messages::decode_clipboard_data(&payload) {
                    Ok((id, _seq, bytes)) => self.post_clipboard_received(d, id, bytes),
                    Err(e) => warn!(name = %self.name, error = %e, "bad 1.4 clipboard frame"),
                }
                continue;
            }

            let msg = match decode_message(&payload) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(name = %self.name, error = %e, "undecodable frame from client");
                    self.write_message(&Message::Bad);
                    self.disconnect(d);
                    return;
                }
            };
            self.handle_message(d, msg);
            if self.stream.is_none() {
                return;
            }
        }

        if closed {
            self.disconnect(d);
            return;
        }
        if let Some(signals) = &self.signals {
            signals.rearm_read();
        }
    }

    fn handle_message(&mut self, d: &mut Dispatcher, msg: Message) {
        match msg {
            Message::Info {
                x,
                y,
                w,
                h,
                zone: _,
                mx,
                my,
            } => {
                self.screen_info = Some(ClientScreenInfo { x, y, w, h, mx, my });
                self.write_message(&Message::InfoAck);
            }
            Message::GrabClipboard { id, seq } => {
                if (id as usize) < CLIPBOARD_COUNT {
                    d.add_event(Event::with_data(
                        EventType::ClipboardGrabbed,
                        self.target,
                        EventData::ClipboardInfo { id, sequence: seq },
                    ));
                }
            }
            Message::ClipboardChunk {
                id,
                seq: _,
                mark,
                payload,
            } => {
                if (id as usize) >= CLIPBOARD_COUNT {
                    warn!(name = %self.name, id, "clipboard chunk with bad id");
                    return;
                }
                match self.clipboard_assemblers[id as usize].handle_raw(mark, &payload) {
                    Ok(AssembleProgress::Finished(bytes)) => {
                        self.post_clipboard_received(d, id, bytes)
                    }
                    Ok(_) => {}
                    Err(e) => warn!(name = %self.name, id, error = %e, "clipboard transfer failed"),
                }
            }
            Message::FileChunk { mark, payload } => {
                match self.file_assembler.handle_raw(mark, &payload) {
                    Ok(AssembleProgress::Started { expected }) => {
                        debug!(name = %self.name, expected, "receiving file from client");
                    }
                    Ok(AssembleProgress::Continued { .. }) => {}
                    Ok(AssembleProgress::Finished(bytes)) => {
                        info!(name = %self.name, size = bytes.len(), "file received from client");
                        d.add_event(Event::with_data(
                            EventType::FileReceiveCompleted,
                            self.target,
                            EventData::Bytes(bytes),
                        ));
                    }
                    Err(e) => {
                        warn!(name = %self.name, error = %e, "file transfer from client failed");
                        d.add_event(Event::new(EventType::FileTransferFailed, self.target));
                    }
                }
            }
            Message::DragInfo { file_count, info } => {
                debug!(name = %self.name, file_count, info = %info, "drag info from client");
            }
            Message::KeepAlive => {
                self.missed_keepalives = 0;
            }
            Message::Noop | Message::InfoAck | Message::Synchronize | Message::Reset => {}
            Message::Bad => {
                warn!(name = %self.name, "client reported a protocol error");
            }
            other => {
                warn!(name = %self.name, code = ?other.code(), "unexpected message from client");
            }
        }
    }

    fn post_clipboard_received(&mut self, d: &mut Dispatcher, id: u8, bytes: Vec<u8>) {
        if (id as usize) >= CLIPBOARD_COUNT {
            warn!(name = %self.name, id, "clipboard data with bad id");
            return;
        }
        d.add_event(Event::with_data(
            EventType::ClipboardReceived,
            self.target,
            EventData::ClipboardData { id, bytes },
        ));
    }

    fn handle_keepalive_timer(&mut self, d: &mut Dispatcher) {
        self.missed_keepalives += 1;
        if self.missed_keepalives > MAX_MISSED_KEEPALIVES {
            warn!(name = %self.name, "client stopped answering keepalives");
            self.disconnect(d);
            return;
        }
        self.write_message(&Message::KeepAlive);
    }

    fn handle_output_ready(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        match stream.flush() {
            Ok(true) => {}
            Ok(false) => {
                if let Some(signals) = &self.signals {
                    signals.set_want_write(true);
                }
            }
            Err(e) => {
                warn!(name = %self.name, error = %e, "client stream write error");
                self.sink
                    .add_event(Event::new(EventType::StreamOutputError, self.target));
            }
        }
    }

    // ── Teardown ──────────────────────────────────────────────────────────────

    /// Tears the connection down and announces `ClientProxyDisconnected`.
    pub fn disconnect(&mut self, d: &mut Dispatcher) {
        if self.stream.is_none() {
            return;
        }
        if self.chunker.is_chunking_file() {
            self.chunker.interrupt_file();
        }
        for etype in [
            EventType::StreamInputReady,
            EventType::StreamOutputReady,
            EventType::SocketError,
            EventType::SocketDisconnected,
            EventType::StreamInputShutdown,
            EventType::StreamOutputShutdown,
            EventType::StreamOutputError,
            EventType::ClipboardSending,
            EventType::FileChunkSending,
            EventType::FileKeepAlive,
        ] {
            d.remove_handler(etype, self.target);
        }
        if let Some(timer) = self.keepalive_timer.take() {
            d.remove_handler(EventType::Timer, timer);
            d.delete_timer(timer);
        }
        if let Some(socket) = self.mux_socket.take() {
            self.mux.remove_socket(socket);
        }
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
        self.signals = None;
        // detach the producer; it observes the interrupt flag and exits
        self.send_file_thread.take();
        info!(name = %self.name, "client disconnected");
        d.add_event(Event::new(EventType::ClientProxyDisconnected, self.target));
    }

    /// Sends `EBSY` and drops the connection; used for duplicate names.
    pub fn refuse_busy(&mut self, d: &mut Dispatcher) {
        self.write_message(&Message::Busy);
        self.disconnect(d);
    }

    // ── Writing ───────────────────────────────────────────────────────────────

    fn write_message(&mut self, msg: &Message) {
        let payload = encode_message(msg);
        self.write_payload(&payload);
    }

    fn write_payload(&mut self, payload: &[u8]) {
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
                warn!(name = %self.name, error = %e, "write to client failed");
                self.sink
                    .add_event(Event::new(EventType::StreamOutputError, self.target));
            }
        }
    }
}

/// The start/data/end series for one clipboard snapshot, used by the 1.5
/// synchronous send path.
fn chunk_series(id: u8, seq: u32, data: &[u8]) -> Vec<ClipboardChunk> {
    let mut out = vec![ClipboardChunk::start(id, seq, data.len())];
    for slice in data.chunks(edgehop_core::CHUNK_SIZE) {
        out.push(ClipboardChunk::data(id, seq, slice.to_vec()));
    }
    out.push(ClipboardChunk::end(id, seq));
    out
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_traits_match_protocol_history() {
        let v14 = VersionTraits::for_version(ProtocolVersion::new(1, 4));
        assert!(!v14.keepalives && !v14.chunked_transfers && !v14.clipboard_events);

        let v15 = VersionTraits::for_version(ProtocolVersion::new(1, 5));
        assert!(v15.keepalives && v15.chunked_transfers && !v15.clipboard_events);

        let v16 = VersionTraits::for_version(ProtocolVersion::new(1, 6));
        assert!(v16.keepalives && v16.chunked_transfers && v16.clipboard_events);
    }

    #[test]
    fn test_chunk_series_shape() {
        let data = vec![1u8; edgehop_core::CHUNK_SIZE + 5];
        let series = chunk_series(0, 7, &data);
        assert_eq!(series.len(), 4); // start + 2 data + end
        assert_eq!(series[0].payload, (edgehop_core::CHUNK_SIZE + 5).to_string().as_bytes());
        assert_eq!(series[1].payload.len(), edgehop_core::CHUNK_SIZE);
        assert_eq!(series[2].payload.len(), 5);
        assert!(series[3].payload.is_empty());
        assert!(series.iter().all(|c| c.id == 0 && c.sequence == 7));
    }

    #[test]
    fn test_empty_clipboard_chunk_series_is_start_end() {
        let series = chunk_series(1, 0, &[]);
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].payload, b"0");
    }
}
