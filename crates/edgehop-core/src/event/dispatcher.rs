//! Single-threaded cooperative event dispatcher.
//!
//! One thread owns [`Dispatcher::run`]; every handler, every session state
//! mutation, and every stream write happens on that thread.  Other threads
//! participate only through [`EventSink::add_event`], which is backed by a
//! thread-safe queue.
//!
//! # Why cooperative? (for beginners)
//!
//! Handlers run to completion before the next event is drawn, so session
//! state never needs a lock: there is exactly one mutator.  The price is a
//! discipline — handlers must not block on I/O.  Streams are non-blocking,
//! and anything slow (connecting a socket, chunking a file) runs on a helper
//! thread that reports back through the queue.
//!
//! # Ordering
//!
//! Events posted from one thread to the same target are delivered in FIFO
//! order — the queue is a `std::sync::mpsc` channel, which preserves
//! per-sender order.  Cross-thread posts preserve each poster's order but
//! not a global order.  Handlers may post new events; they are processed
//! after the current handler returns, never re-entrantly.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::{Duration, Instant};

use tracing::trace;

use super::{Event, EventType, Target};

/// Handle for a timer created with [`Dispatcher::new_timer`].  Shares the
/// [`Target`] handle space: the `Timer` event's target *is* the timer id.
pub type TimerId = u64;

/// A registered handler.  Receives the dispatcher so it can register or
/// remove handlers, start timers, and post follow-up events.
pub type Handler = Box<dyn FnMut(&mut Dispatcher, &Event)>;

struct TimerEntry {
    id: TimerId,
    deadline: Instant,
    period: Duration,
    one_shot: bool,
}

/// Clonable cross-thread event poster.
///
/// This is the *only* dispatcher surface that helper threads may touch
/// (multiplexer service thread, chunker producers, connector threads).
#[derive(Clone)]
pub struct EventSink {
    tx: Sender<Event>,
}

impl EventSink {
    /// Appends an event to the dispatch queue.  Never blocks.  If the
    /// dispatcher is gone the event is dropped silently — the poster is
    /// already being torn down in that case.
    pub fn add_event(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

/// The event pump.  See module docs for the threading contract.
pub struct Dispatcher {
    tx: Sender<Event>,
    rx: Receiver<Event>,
    handlers: HashMap<(EventType, Target), Handler>,
    timers: Vec<TimerEntry>,
    next_handle: u64,
    running: bool,
    /// Key of the handler currently executing, if any.
    in_dispatch: Option<(EventType, Target)>,
    /// Set when the executing handler removed its own registration.
    dispatch_removed: bool,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx,
            rx,
            handlers: HashMap::new(),
            timers: Vec::new(),
            next_handle: 1,
            running: false,
            in_dispatch: None,
            dispatch_removed: false,
        }
    }

    /// Returns a cross-thread poster for this dispatcher's queue.
    pub fn sink(&self) -> EventSink {
        EventSink {
            tx: self.tx.clone(),
        }
    }

    /// Allots a fresh opaque target handle.
    pub fn next_target(&mut self) -> Target {
        let t = self.next_handle;
        self.next_handle += 1;
        t
    }

    /// Posts an event from the dispatcher thread.  Queued behind anything
    /// already posted, so same-thread FIFO holds between this and
    /// [`EventSink::add_event`] calls.
    pub fn add_event(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    // ── Handlers ──────────────────────────────────────────────────────────────

    /// Registers a handler for `(etype, target)`.  A duplicate registration
    /// replaces the previous handler.
    pub fn add_handler<F>(&mut self, etype: EventType, target: Target, handler: F)
    where
        F: FnMut(&mut Dispatcher, &Event) + 'static,
    {
        self.handlers.insert((etype, target), Box::new(handler));
    }

    /// Removes a handler.  Idempotent; removing an unregistered handler is
    /// a no-op.
    pub fn remove_handler(&mut self, etype: EventType, target: Target) {
        if self.in_dispatch == Some((etype, target)) {
            self.dispatch_removed = true;
        }
        self.handlers.remove(&(etype, target));
    }

    /// Number of handlers registered against `target`, any event type.
    pub fn handler_count(&self, target: Target) -> usize {
        self.handlers.keys().filter(|(_, t)| *t == target).count()
    }

    // ── Timers ────────────────────────────────────────────────────────────────

    /// Creates a timer.  When it fires, a `Timer` event is dispatched with
    /// the returned id as its target; register a `(Timer, id)` handler to
    /// receive it.  Repeating timers rearm from their previous deadline.
    pub fn new_timer(&mut self, duration: Duration, one_shot: bool) -> TimerId {
        let id = self.next_target();
        self.timers.push(TimerEntry {
            id,
            deadline: Instant::now() + duration,
            period: duration,
            one_shot,
        });
        id
    }

    /// Cancels a timer.  Idempotent.
    pub fn delete_timer(&mut self, id: TimerId) {
        self.timers.retain(|t| t.id != id);
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    // ── The loop ──────────────────────────────────────────────────────────────

    /// Blocks the calling thread dispatching events until [`Dispatcher::quit`]
    /// is observed.
    pub fn run(&mut self) {
        self.running = true;
        while self.running {
            let event = match self.next_deadline() {
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    match self.rx.recv_timeout(wait) {
                        Ok(ev) => Some(ev),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
                None => match self.rx.recv() {
                    Ok(ev) => Some(ev),
                    Err(_) => return,
                },
            };

            match event {
                Some(ev) => self.handle(ev),
                None => self.fire_due_timers(),
            }
        }
    }

    /// Drains everything currently queued (and any due timers) without
    /// blocking, then returns.  The unit of progress used by the tests.
    pub fn pump(&mut self) {
        self.running = true;
        loop {
            self.fire_due_timers();
            match self.rx.try_recv() {
                Ok(ev) => self.handle(ev),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
            if !self.running {
                break;
            }
        }
    }

    /// Posts a `Quit` event; [`Dispatcher::run`] returns once it is drawn.
    pub fn quit(&self) {
        self.add_event(Event::new(EventType::Quit, 0));
    }

    fn handle(&mut self, ev: Event) {
        if ev.etype == EventType::Quit {
            self.running = false;
            return;
        }
        self.dispatch(ev);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().map(|t| t.deadline).min()
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        // ids first: firing a handler may add or delete timers
        let due: Vec<TimerId> = self
            .timers
            .iter()
            .filter(|t| t.deadline <= now)
            .map(|t| t.id)
            .collect();

        for id in due {
            let Some(pos) = self.timers.iter().position(|t| t.id == id) else {
                continue; // deleted by an earlier handler this round
            };
            if self.timers[pos].one_shot {
                self.timers.remove(pos);
            } else {
                let period = self.timers[pos].period;
                self.timers[pos].deadline += period;
            }
            self.dispatch(Event::new(EventType::Timer, id));
        }
    }

    fn dispatch(&mut self, ev: Event) {
        let key = (ev.etype, ev.target);
        let Some(mut handler) = self.handlers.remove(&key) else {
            trace!(etype = ?ev.etype, target = ev.target, "no handler, event dropped");
            return;
        };

        // The handler is detached from the map while it runs so it can call
        // back into the dispatcher.  Reinstall afterwards unless it removed
        // itself or a replacement was registered meanwhile.
        self.in_dispatch = Some(key);
        self.dispatch_removed = false;
        handler(self, &ev);
        let removed = std::mem::replace(&mut self.dispatch_removed, false);
        self.in_dispatch = None;
        if !removed {
            self.handlers.entry(key).or_insert(handler);
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventData;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::thread;

    #[test]
    fn test_events_to_same_target_arrive_in_post_order() {
        let mut d = Dispatcher::new();
        let target = d.next_target();
        let seen: Rc<RefCell<Vec<String>>> = Rc::default();

        let seen_clone = Rc::clone(&seen);
        d.add_handler(EventType::ClientConnected, target, move |_, ev| {
            if let EventData::Bytes(b) = &ev.data {
                seen_clone.borrow_mut().push(String::from_utf8_lossy(b).into_owned());
            }
        });

        for label in ["first", "second", "third"] {
            d.add_event(Event::with_data(
                EventType::ClientConnected,
                target,
                EventData::Bytes(label.as_bytes().to_vec()),
            ));
        }
        d.pump();

        assert_eq!(*seen.borrow(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_unknown_target_event_is_silently_dropped() {
        let mut d = Dispatcher::new();
        d.add_event(Event::new(EventType::ClientConnected, 424242));
        // must not panic, must not wedge
        d.pump();
    }

    #[test]
    fn test_duplicate_registration_replaces_handler() {
        let mut d = Dispatcher::new();
        let target = d.next_target();
        let hits: Rc<RefCell<Vec<&'static str>>> = Rc::default();

        let h1 = Rc::clone(&hits);
        d.add_handler(EventType::ClientConnected, target, move |_, _| {
            h1.borrow_mut().push("old");
        });
        let h2 = Rc::clone(&hits);
        d.add_handler(EventType::ClientConnected, target, move |_, _| {
            h2.borrow_mut().push("new");
        });

        d.add_event(Event::new(EventType::ClientConnected, target));
        d.pump();
        assert_eq!(*hits.borrow(), vec!["new"]);
    }

    #[test]
    fn test_remove_handler_is_idempotent() {
        let mut d = Dispatcher::new();
        let target = d.next_target();
        d.add_handler(EventType::ClientConnected, target, |_, _| {});
        d.remove_handler(EventType::ClientConnected, target);
        d.remove_handler(EventType::ClientConnected, target);
        assert_eq!(d.handler_count(target), 0);
    }

    #[test]
    fn test_handler_may_remove_itself_during_dispatch() {
        let mut d = Dispatcher::new();
        let target = d.next_target();
        let hits: Rc<RefCell<u32>> = Rc::default();

        let h = Rc::clone(&hits);
        d.add_handler(EventType::ClientConnected, target, move |disp, ev| {
            *h.borrow_mut() += 1;
            disp.remove_handler(EventType::ClientConnected, ev.target);
        });

        d.add_event(Event::new(EventType::ClientConnected, target));
        d.add_event(Event::new(EventType::ClientConnected, target));
        d.pump();

        assert_eq!(*hits.borrow(), 1, "second event must find no handler");
        assert_eq!(d.handler_count(target), 0);
    }

    #[test]
    fn test_handler_posted_events_run_after_current_handler() {
        let mut d = Dispatcher::new();
        let target = d.next_target();
        let order: Rc<RefCell<Vec<&'static str>>> = Rc::default();

        let o1 = Rc::clone(&order);
        d.add_handler(EventType::ClientConnected, target, move |disp, ev| {
            o1.borrow_mut().push("outer-begin");
            disp.add_event(Event::new(EventType::ClientDisconnected, ev.target));
            o1.borrow_mut().push("outer-end");
        });
        let o2 = Rc::clone(&order);
        d.add_handler(EventType::ClientDisconnected, target, move |_, _| {
            o2.borrow_mut().push("inner");
        });

        d.add_event(Event::new(EventType::ClientConnected, target));
        d.pump();

        assert_eq!(*order.borrow(), vec!["outer-begin", "outer-end", "inner"]);
    }

    #[test]
    fn test_cross_thread_posts_preserve_per_poster_order() {
        let mut d = Dispatcher::new();
        let target = d.next_target();
        let seen: Rc<RefCell<Vec<u8>>> = Rc::default();

        let s = Rc::clone(&seen);
        d.add_handler(EventType::ClientConnected, target, move |_, ev| {
            if let EventData::Bytes(b) = &ev.data {
                s.borrow_mut().push(b[0]);
            }
        });

        let sink = d.sink();
        let poster = thread::spawn(move || {
            for i in 0u8..50 {
                sink.add_event(Event::with_data(
                    EventType::ClientConnected,
                    target,
                    EventData::Bytes(vec![i]),
                ));
            }
        });
        poster.join().unwrap();
        d.pump();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 50);
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "per-poster FIFO violated");
    }

    #[test]
    fn test_one_shot_timer_fires_once() {
        let mut d = Dispatcher::new();
        let hits: Rc<RefCell<u32>> = Rc::default();

        let timer = d.new_timer(Duration::from_millis(5), true);
        let h = Rc::clone(&hits);
        d.add_handler(EventType::Timer, timer, move |_, _| {
            *h.borrow_mut() += 1;
        });

        thread::sleep(Duration::from_millis(20));
        d.pump();
        thread::sleep(Duration::from_millis(20));
        d.pump();

        assert_eq!(*hits.borrow(), 1);
        assert_eq!(d.timer_count(), 0, "one-shot timer must be gone after firing");
    }

    #[test]
    fn test_repeating_timer_fires_until_deleted() {
        let mut d = Dispatcher::new();
        let hits: Rc<RefCell<u32>> = Rc::default();

        let timer = d.new_timer(Duration::from_millis(5), false);
        let h = Rc::clone(&hits);
        d.add_handler(EventType::Timer, timer, move |_, _| {
            *h.borrow_mut() += 1;
        });

        thread::sleep(Duration::from_millis(30));
        d.pump();
        let after_first_pump = *hits.borrow();
        assert!(after_first_pump >= 2, "repeating timer must fire repeatedly");

        d.delete_timer(timer);
        assert_eq!(d.timer_count(), 0);
        thread::sleep(Duration::from_millis(20));
        d.pump();
        assert_eq!(*hits.borrow(), after_first_pump, "deleted timer must not fire");
    }

    #[test]
    fn test_delete_timer_is_idempotent() {
        let mut d = Dispatcher::new();
        let timer = d.new_timer(Duration::from_secs(60), true);
        d.delete_timer(timer);
        d.delete_timer(timer);
        assert_eq!(d.timer_count(), 0);
    }

    #[test]
    fn test_quit_stops_run_loop() {
        let mut d = Dispatcher::new();
        d.quit();
        // returns instead of blocking forever
        d.run();
    }

    #[test]
    fn test_run_processes_events_posted_before_quit() {
        let mut d = Dispatcher::new();
        let target = d.next_target();
        let hits: Rc<RefCell<u32>> = Rc::default();

        let h = Rc::clone(&hits);
        d.add_handler(EventType::ClientConnected, target, move |_, _| {
            *h.borrow_mut() += 1;
        });

        d.add_event(Event::new(EventType::ClientConnected, target));
        d.quit();
        d.run();

        assert_eq!(*hits.borrow(), 1);
    }

    #[test]
    fn test_handler_count_tracks_types_per_target() {
        let mut d = Dispatcher::new();
        let target = d.next_target();
        let other = d.next_target();
        d.add_handler(EventType::ClientConnected, target, |_, _| {});
        d.add_handler(EventType::ClientDisconnected, target, |_, _| {});
        d.add_handler(EventType::ClientConnected, other, |_, _| {});

        assert_eq!(d.handler_count(target), 2);
        assert_eq!(d.handler_count(other), 1);

        d.remove_handler(EventType::ClientConnected, target);
        d.remove_handler(EventType::ClientDisconnected, target);
        assert_eq!(d.handler_count(target), 0);
        assert_eq!(d.handler_count(other), 1);
    }
}
