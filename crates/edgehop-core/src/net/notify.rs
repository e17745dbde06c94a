//! The bridge between the multiplexer service thread and a session's
//! stream: a [`MuxJob`] that turns readiness transitions into dispatcher
//! events.
//!
//! The service thread never touches the stream itself — sessions own their
//! streams and do all reads and writes on the dispatcher thread.  The job's
//! only output is `StreamInputReady` / `StreamOutputReady` events, latched
//! through [`StreamSignals`] so a socket that stays readable for many poll
//! cycles produces one event per drain instead of one per cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::event::{Event, EventSink, EventType, Target};
use crate::net::multiplexer::{Interest, JobStatus, MuxJob, Readiness};

/// Shared latch state between a session and its notify job.
pub struct StreamSignals {
    /// When set, the next readable transition posts an event and clears it.
    /// The session re-arms after draining the stream.
    read_armed: AtomicBool,
    /// Raised by the session while it has unflushed output parked.
    want_write: AtomicBool,
}

impl StreamSignals {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            read_armed: AtomicBool::new(true),
            want_write: AtomicBool::new(false),
        })
    }

    /// Re-enables input notification after the session drained its stream.
    pub fn rearm_read(&self) {
        self.read_armed.store(true, Ordering::Release);
    }

    /// Raises or clears write interest.
    pub fn set_want_write(&self, want: bool) {
        self.want_write.store(want, Ordering::Release);
    }

    pub fn wants_write(&self) -> bool {
        self.want_write.load(Ordering::Acquire)
    }
}

/// Multiplexer job posting stream readiness to a session's target.
pub struct StreamNotifyJob {
    signals: Arc<StreamSignals>,
    sink: EventSink,
    target: Target,
}

impl StreamNotifyJob {
    pub fn new(signals: Arc<StreamSignals>, sink: EventSink, target: Target) -> Self {
        Self {
            signals,
            sink,
            target,
        }
    }
}

impl MuxJob for StreamNotifyJob {
    fn interest(&self) -> Interest {
        Interest {
            readable: true,
            writable: self.signals.wants_write(),
        }
    }

    fn run(&mut self, ready: Readiness) -> JobStatus {
        if ready.error {
            self.sink
                .add_event(Event::new(EventType::SocketError, self.target));
            return JobStatus::Remove;
        }
        if ready.readable && self.signals.read_armed.swap(false, Ordering::AcqRel) {
            self.sink
                .add_event(Event::new(EventType::StreamInputReady, self.target));
        }
        if ready.writable && self.signals.want_write.swap(false, Ordering::AcqRel) {
            self.sink
                .add_event(Event::new(EventType::StreamOutputReady, self.target));
        }
        JobStatus::Keep
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Dispatcher;
    use crate::net::multiplexer::SocketMultiplexer;
    use crate::net::stream::{DataStream, PipeStream};
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::{Duration, Instant};

    fn pump_until<F: Fn() -> bool>(d: &mut Dispatcher, what: &str, cond: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            d.pump();
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_readable_posts_one_event_until_rearmed() {
        let mux = SocketMultiplexer::new();
        let mut d = Dispatcher::new();
        let target = d.next_target();
        let (local, mut remote) = PipeStream::pair();
        let signals = StreamSignals::new();

        let events: Rc<RefCell<u32>> = Rc::default();
        let counter = Rc::clone(&events);
        d.add_handler(EventType::StreamInputReady, target, move |_, _| {
            *counter.borrow_mut() += 1;
        });

        mux.add_socket(
            Box::new(local.clone()),
            Box::new(StreamNotifyJob::new(Arc::clone(&signals), d.sink(), target)),
            target,
            d.sink(),
        );

        remote.write(b"data").unwrap();
        pump_until(&mut d, "first input-ready", || *events.borrow() == 1);

        // data stays buffered but the latch is down: no more events
        std::thread::sleep(Duration::from_millis(50));
        d.pump();
        assert_eq!(*events.borrow(), 1, "disarmed latch must suppress repeats");

        signals.rearm_read();
        pump_until(&mut d, "second input-ready", || *events.borrow() == 2);
    }

    #[test]
    fn test_write_interest_fires_output_ready_once() {
        let mux = SocketMultiplexer::new();
        let mut d = Dispatcher::new();
        let target = d.next_target();
        let (local, _remote) = PipeStream::pair();
        let signals = StreamSignals::new();

        let events: Rc<RefCell<u32>> = Rc::default();
        let counter = Rc::clone(&events);
        d.add_handler(EventType::StreamOutputReady, target, move |_, _| {
            *counter.borrow_mut() += 1;
        });

        mux.add_socket(
            Box::new(local.clone()),
            Box::new(StreamNotifyJob::new(Arc::clone(&signals), d.sink(), target)),
            target,
            d.sink(),
        );

        // no interest: nothing fires
        std::thread::sleep(Duration::from_millis(50));
        d.pump();
        assert_eq!(*events.borrow(), 0);

        signals.set_want_write(true);
        pump_until(&mut d, "output-ready", || *events.borrow() == 1);

        // interest was consumed with the event
        std::thread::sleep(Duration::from_millis(50));
        d.pump();
        assert_eq!(*events.borrow(), 1);
    }
}
