//! The server session: the registry of connected clients and the routing
//! of input, clipboard, and file traffic.
//!
//! Which client owns the cursor is decided upstream by the screen-edge
//! policy; this module only provides the mechanism — `set_active` moves
//! the cursor between screens with a leave/enter pair, the relay methods
//! forward input to whichever client is active, and clipboard grabs are
//! broadcast to every other connected client.
//!
//! Clients are keyed by their logical screen name.  A second client
//! handshaking with a name that is already connected is refused with
//! `EBSY` and dropped; the incumbent is untouched.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, info, warn};

use edgehop_core::{
    Clipboard, Dispatcher, EventData, EventType, Target, CLIPBOARD_COUNT,
};

use crate::listener::Listener;
use crate::proxy::ClientProxy;

/// Error type for routing operations.
#[derive(Debug, Error, PartialEq)]
pub enum ServerError {
    #[error("no client named {0}")]
    ClientNotFound(String),
}

/// The server's view of one clipboard: who grabbed it last and the
/// snapshot they sent.
#[derive(Default)]
struct ClipboardState {
    owner: Option<String>,
    sequence: u32,
    data: Option<Vec<u8>>,
}

/// The server session.
pub struct Server {
    listener: Rc<RefCell<Listener>>,
    clients: HashMap<String, Rc<RefCell<ClientProxy>>>,
    /// Reverse map from a proxy's event target to its name.
    targets: HashMap<Target, String>,
    active: Option<String>,
    /// Orders enter/leave pairs and clipboard grabs.
    enter_seq: u32,
    clipboards: [ClipboardState; CLIPBOARD_COUNT],
    /// The last file a client delivered, for the drop-target logic upstream.
    last_received_file: Option<Vec<u8>>,
}

impl Server {
    /// Creates the server and subscribes to the listener's handshaken
    /// clients.
    pub fn new(listener: Rc<RefCell<Listener>>, d: &mut Dispatcher) -> Rc<RefCell<Self>> {
        let listener_target = listener.borrow().target();
        let server = Rc::new(RefCell::new(Self {
            listener,
            clients: HashMap::new(),
            targets: HashMap::new(),
            active: None,
            enter_seq: 0,
            clipboards: Default::default(),
            last_received_file: None,
        }));

        let s = Rc::clone(&server);
        d.add_handler(
            EventType::ClientListenerConnected,
            listener_target,
            move |d, _| {
                Self::adopt_waiting_clients(&s, d);
            },
        );

        server
    }

    // ── Registry ──────────────────────────────────────────────────────────────

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn client_names(&self) -> Vec<String> {
        self.clients.keys().cloned().collect()
    }

    pub fn client(&self, name: &str) -> Option<Rc<RefCell<ClientProxy>>> {
        self.clients.get(name).cloned()
    }

    pub fn active_client(&self) -> Option<&str> {
        self.active.as_deref()
    }

    fn adopt_waiting_clients(server: &Rc<RefCell<Self>>, d: &mut Dispatcher) {
        loop {
            let proxy = {
                let s = server.borrow();
                let mut listener = s.listener.borrow_mut();
                listener.next_client()
            };
            let Some(proxy) = proxy else { return };
            Self::adopt(server, d, proxy);
        }
    }

    fn adopt(server: &Rc<RefCell<Self>>, d: &mut Dispatcher, proxy: Rc<RefCell<ClientProxy>>) {
        let (name, target) = {
            let p = proxy.borrow();
            (p.name().to_string(), p.target())
        };

        if server.borrow().clients.contains_key(&name) {
            warn!(%name, "a client with this name is already connected; refusing");
            proxy.borrow_mut().refuse_busy(d);
            return;
        }

        {
            let mut s = server.borrow_mut();
            s.clients.insert(name.clone(), Rc::clone(&proxy));
            s.targets.insert(target, name.clone());
            info!(%name, total = s.clients.len(), "client joined");
        }

        let s = Rc::clone(server);
        d.add_handler(EventType::ClientProxyDisconnected, target, move |d, ev| {
            Self::handle_client_disconnected(&s, d, ev.target);
        });
        let s = Rc::clone(server);
        d.add_handler(EventType::ClipboardGrabbed, target, move |_, ev| {
            if let EventData::ClipboardInfo { id, sequence } = ev.data {
                Self::handle_clipboard_grabbed(&s, ev.target, id, sequence);
            }
        });
        let s = Rc::clone(server);
        d.add_handler(EventType::ClipboardReceived, target, move |_, ev| {
            if let EventData::ClipboardData { id, bytes } = &ev.data {
                s.borrow_mut().handle_clipboard_received(ev.target, *id, bytes.clone());
            }
        });
        let s = Rc::clone(server);
        d.add_handler(EventType::FileReceiveCompleted, target, move |_, ev| {
            if let EventData::Bytes(bytes) = &ev.data {
                s.borrow_mut().last_received_file = Some(bytes.clone());
            }
        });
    }

    fn handle_client_disconnected(server: &Rc<RefCell<Self>>, d: &mut Dispatcher, target: Target) {
        for etype in [
            EventType::ClientProxyDisconnected,
            EventType::ClipboardGrabbed,
            EventType::ClipboardReceived,
            EventType::FileReceiveCompleted,
        ] {
            d.remove_handler(etype, target);
        }
        let mut s = server.borrow_mut();
        if let Some(name) = s.targets.remove(&target) {
            s.clients.remove(&name);
            if s.active.as_deref() == Some(&name) {
                s.active = None;
            }
            for clipboard in &mut s.clipboards {
                if clipboard.owner.as_deref() == Some(&name) {
                    clipboard.owner = None;
                }
            }
            info!(%name, remaining = s.clients.len(), "client left");
        }
    }

    // ── Clipboard routing ─────────────────────────────────────────────────────

    fn handle_clipboard_grabbed(server: &Rc<RefCell<Self>>, from: Target, id: u8, sequence: u32) {
        let (owner, stale) = {
            let s = server.borrow();
            let Some(owner) = s.targets.get(&from).cloned() else {
                return;
            };
            // an older grab must not displace a newer one
            let stale = sequence < s.clipboards[id as usize].sequence;
            (owner, stale)
        };
        if stale {
            debug!(%owner, id, sequence, "ignoring stale clipboard grab");
            return;
        }

        let others: Vec<Rc<RefCell<ClientProxy>>> = {
            let mut s = server.borrow_mut();
            s.clipboards[id as usize].owner = Some(owner.clone());
            s.clipboards[id as usize].sequence = sequence;
            s.clipboards[id as usize].data = None;
            s.clients
                .iter()
                .filter(|(name, _)| **name != owner)
                .map(|(_, p)| Rc::clone(p))
                .collect()
        };

        debug!(%owner, id, sequence, "clipboard grabbed; notifying other clients");
        for proxy in others {
            proxy.borrow_mut().grab_clipboard(id, sequence);
        }
    }

    fn handle_clipboard_received(&mut self, from: Target, id: u8, bytes: Vec<u8>) {
        let Some(owner) = self.targets.get(&from).cloned() else {
            return;
        };
        debug!(%owner, id, size = bytes.len(), "clipboard data received");
        self.clipboards[id as usize].data = Some(bytes);
    }

    /// The latest snapshot a client delivered for clipboard `id`, still
    /// marshalled.
    pub fn clipboard_data(&self, id: u8) -> Option<Clipboard> {
        self.clipboards[id as usize]
            .data
            .as_deref()
            .and_then(|bytes| Clipboard::unmarshall(bytes).ok())
    }

    pub fn clipboard_owner(&self, id: u8) -> Option<&str> {
        self.clipboards[id as usize].owner.as_deref()
    }

    /// Ships a clipboard snapshot to one client.
    pub fn send_clipboard_to(
        &mut self,
        name: &str,
        id: u8,
        clipboard: &Clipboard,
    ) -> Result<(), ServerError> {
        let proxy = self
            .clients
            .get(name)
            .ok_or_else(|| ServerError::ClientNotFound(name.to_string()))?;
        let seq = self.clipboards[id as usize].sequence;
        proxy.borrow_mut().send_clipboard(id, seq, clipboard);
        Ok(())
    }

    // ── Input routing ─────────────────────────────────────────────────────────

    /// Moves the cursor onto `name`'s screen: the previously active client
    /// gets a leave, the new one an enter at `(x, y)`.
    pub fn set_active(
        &mut self,
        name: &str,
        x: i16,
        y: i16,
        mask: i16,
    ) -> Result<(), ServerError> {
        if !self.clients.contains_key(name) {
            return Err(ServerError::ClientNotFound(name.to_string()));
        }
        if self.active.as_deref() == Some(name) {
            return Ok(());
        }
        self.deactivate();

        self.enter_seq = self.enter_seq.wrapping_add(1);
        let seq = self.enter_seq;
        if let Some(proxy) = self.clients.get(name) {
            proxy.borrow_mut().enter(x, y, seq, mask);
        }
        self.active = Some(name.to_string());
        debug!(%name, x, y, "client is now active");
        Ok(())
    }

    /// Sends a leave to the active client; input stays local afterwards.
    pub fn deactivate(&mut self) {
        if let Some(name) = self.active.take() {
            if let Some(proxy) = self.clients.get(&name) {
                proxy.borrow_mut().leave();
            }
            debug!(%name, "client deactivated");
        }
    }

    fn with_active<F: FnOnce(&mut ClientProxy)>(&self, f: F) {
        let Some(name) = self.active.as_deref() else {
            return;
        };
        if let Some(proxy) = self.clients.get(name) {
            f(&mut proxy.borrow_mut());
        }
    }

    pub fn relay_key_down(&self, key: u16, mask: u16, button: u16) {
        self.with_active(|p| p.key_down(key, mask, button));
    }

    pub fn relay_key_repeat(&self, key: u16, mask: u16, count: u16, button: u16) {
        self.with_active(|p| p.key_repeat(key, mask, count, button));
    }

    pub fn relay_key_up(&self, key: u16, mask: u16, button: u16) {
        self.with_active(|p| p.key_up(key, mask, button));
    }

    pub fn relay_mouse_down(&self, button: i8) {
        self.with_active(|p| p.mouse_down(button));
    }

    pub fn relay_mouse_up(&self, button: i8) {
        self.with_active(|p| p.mouse_up(button));
    }

    pub fn relay_mouse_move(&self, x: i16, y: i16) {
        self.with_active(|p| p.mouse_move(x, y));
    }

    pub fn relay_mouse_relative_move(&self, dx: i16, dy: i16) {
        self.with_active(|p| p.mouse_relative_move(dx, dy));
    }

    pub fn relay_mouse_wheel(&self, x_delta: i16, y_delta: i16) {
        self.with_active(|p| p.mouse_wheel(x_delta, y_delta));
    }

    /// Mirrors the server machine's screensaver state to every client.
    pub fn broadcast_screensaver(&self, on: bool) {
        for proxy in self.clients.values() {
            proxy.borrow_mut().screensaver(on);
        }
    }

    // ── File routing ──────────────────────────────────────────────────────────

    /// Starts a drag-and-drop file transfer towards the active client.
    pub fn send_file_to_active(&mut self, file_count: u32, info: &str, data: Vec<u8>) {
        self.with_active(|p| {
            p.send_drag_info(file_count, info);
            p.send_file(data);
        });
    }

    /// The last file any client delivered.
    pub fn take_received_file(&mut self) -> Option<Vec<u8>> {
        self.last_received_file.take()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_formats_client_name() {
        let e = ServerError::ClientNotFound("laptop".to_string());
        assert_eq!(e.to_string(), "no client named laptop");
    }
}
