//! Socket multiplexer: services every registered socket from one background
//! thread.
//!
//! Each socket is registered with a *job* that advertises its I/O interest
//! and consumes readiness transitions.  The service thread probes each
//! socket, runs the jobs whose interest was satisfied, and applies the
//! [`JobStatus`] each run returns: keep the job, replace it with a new one
//! (new interest), or remove it.
//!
//! # Safe iteration
//!
//! The original design this follows iterated a linked job list with a
//! sentinel cursor so concurrent edits could not invalidate the iterator.
//! The contract — mutations during dispatch take effect on the next poll
//! cycle and never corrupt the current one — is kept here with a
//! generational snapshot instead: the service thread snapshots `(socket,
//! generation, interest)` under the table lock, probes without the lock,
//! and re-checks the generation before running or re-installing a job.  A
//! slot removed or replaced mid-cycle simply misses that cycle.
//!
//! Writers get priority: [`SocketMultiplexer::add_socket`] and
//! [`SocketMultiplexer::remove_socket`] announce themselves in a pending
//! counter, and the service thread yields the lock between jobs while any
//! writer is queued, so registration never waits out a full poll sweep.
//!
//! # What the jobs may do
//!
//! Jobs run on the service thread.  They must not touch session state —
//! their whole vocabulary is: attempt non-blocking I/O on their own socket,
//! post events through an [`EventSink`], and return a [`JobStatus`].

use std::collections::HashMap;
use std::io;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::event::{Event, EventSink, EventType, Target};
use crate::net::stream::PipeStream;

/// How long the service thread sleeps when no socket is ready.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// What a job wants to be woken for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READ: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub const READ_WRITE: Interest = Interest {
        readable: true,
        writable: true,
    };

    pub fn is_none(&self) -> bool {
        !self.readable && !self.writable
    }
}

/// What the probe observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

impl Readiness {
    pub fn any(&self) -> bool {
        self.readable || self.writable || self.error
    }
}

/// Readiness source for one registered socket.
///
/// This is the capability boundary: the multiplexer never reads or writes
/// payload bytes, it only asks "would I/O make progress?".
pub trait SocketProbe: Send {
    fn probe(&self, interest: Interest) -> io::Result<Readiness>;
}

/// A non-blocking `TcpStream` probe.  Readable state comes from a zero-copy
/// `peek`; an EOF peek reports readable so the job can observe the shutdown
/// itself.  Writability is reported optimistically — the job's own write
/// discovers `WouldBlock` and keeps its interest raised.
impl SocketProbe for TcpStream {
    fn probe(&self, interest: Interest) -> io::Result<Readiness> {
        let mut ready = Readiness::default();
        if interest.readable {
            let mut byte = [0u8; 1];
            match self.peek(&mut byte) {
                Ok(_) => ready.readable = true,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
        if interest.writable {
            ready.writable = true;
        }
        Ok(ready)
    }
}

impl SocketProbe for PipeStream {
    fn probe(&self, interest: Interest) -> io::Result<Readiness> {
        Ok(Readiness {
            readable: interest.readable && self.poll_readable(),
            writable: interest.writable && self.poll_writable(),
            error: false,
        })
    }
}

/// What to do with a job after it ran.
pub enum JobStatus {
    Keep,
    Replace(Box<dyn MuxJob>),
    Remove,
}

/// Per-socket I/O job.
pub trait MuxJob: Send {
    /// Current interest; re-read before every probe, so a job can change
    /// its mind between cycles without replacing itself.
    fn interest(&self) -> Interest;

    /// Consumes a readiness transition.
    fn run(&mut self, ready: Readiness) -> JobStatus;
}

/// Handle for a registered socket.
pub type SocketId = u64;

struct Slot {
    generation: u64,
    probe: Box<dyn SocketProbe>,
    /// Taken out while the job runs so the table lock is not held across it.
    job: Option<Box<dyn MuxJob>>,
    target: Target,
    sink: EventSink,
}

#[derive(Default)]
struct JobTable {
    slots: HashMap<SocketId, Slot>,
    next_id: SocketId,
    next_generation: u64,
}

struct Shared {
    table: Mutex<JobTable>,
    /// Wakes the service thread when sockets appear.
    wake: Condvar,
    /// Writer-priority: nonzero while add/remove is queued for the lock.
    writers_pending: AtomicUsize,
    shutdown: AtomicBool,
}

/// The multiplexer.  Dropping it stops the service thread.
pub struct SocketMultiplexer {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl SocketMultiplexer {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            table: Mutex::new(JobTable::default()),
            wake: Condvar::new(),
            writers_pending: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("edgehop-mux".to_string())
            .spawn(move || service_thread(thread_shared))
            .expect("failed to spawn multiplexer service thread");

        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Registers a socket with its probe and job.  `target` receives
    /// `SocketError` events when the probe fails; the job is then removed.
    pub fn add_socket(
        &self,
        probe: Box<dyn SocketProbe>,
        job: Box<dyn MuxJob>,
        target: Target,
        sink: EventSink,
    ) -> SocketId {
        let guard = WriterGuard::announce(&self.shared);
        let mut table = self.shared.table.lock().unwrap();
        let id = table.next_id;
        table.next_id += 1;
        let generation = table.next_generation;
        table.next_generation += 1;
        table.slots.insert(
            id,
            Slot {
                generation,
                probe,
                job: Some(job),
                target,
                sink,
            },
        );
        drop(table);
        drop(guard);
        self.shared.wake.notify_all();
        trace!(socket = id, "socket registered with multiplexer");
        id
    }

    /// Deregisters a socket.  Idempotent.  Takes effect before the next
    /// poll cycle; a job already running finishes its current `run`.
    pub fn remove_socket(&self, id: SocketId) {
        let guard = WriterGuard::announce(&self.shared);
        let mut table = self.shared.table.lock().unwrap();
        if table.slots.remove(&id).is_some() {
            trace!(socket = id, "socket removed from multiplexer");
        }
        drop(table);
        drop(guard);
    }

    /// Number of registered sockets.
    pub fn socket_count(&self) -> usize {
        let _guard = WriterGuard::announce(&self.shared);
        self.shared.table.lock().unwrap().slots.len()
    }
}

impl Default for SocketMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SocketMultiplexer {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake.notify_all();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// RAII announcement that a writer wants the table lock.  While any writer
/// is announced the service thread keeps its critical sections minimal and
/// yields between jobs.
struct WriterGuard<'a> {
    shared: &'a Shared,
}

impl<'a> WriterGuard<'a> {
    fn announce(shared: &'a Shared) -> Self {
        shared.writers_pending.fetch_add(1, Ordering::AcqRel);
        Self { shared }
    }
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        self.shared.writers_pending.fetch_sub(1, Ordering::AcqRel);
    }
}

// ── Service thread ────────────────────────────────────────────────────────────

fn service_thread(shared: Arc<Shared>) {
    debug!("multiplexer service thread started");
    while !shared.shutdown.load(Ordering::Acquire) {
        // Sleep while the table is empty.
        {
            let mut table = shared.table.lock().unwrap();
            while table.slots.is_empty() && !shared.shutdown.load(Ordering::Acquire) {
                let (guard, _timeout) = shared
                    .wake
                    .wait_timeout(table, Duration::from_millis(100))
                    .unwrap();
                table = guard;
            }
        }
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        let made_progress = poll_cycle(&shared);

        if !made_progress {
            std::thread::sleep(POLL_INTERVAL);
        }
    }
    debug!("multiplexer service thread stopped");
}

/// One poll sweep over a snapshot of the job table.  Returns whether any
/// job ran.
fn poll_cycle(shared: &Arc<Shared>) -> bool {
    // Snapshot under the lock; probe and run without it.
    let snapshot: Vec<(SocketId, u64, Interest)> = {
        let table = shared.table.lock().unwrap();
        table
            .slots
            .iter()
            .filter_map(|(id, slot)| {
                slot.job.as_ref().map(|job| (*id, slot.generation, job.interest()))
            })
            .collect()
    };

    let mut ran_any = false;
    for (id, generation, interest) in snapshot {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        // Writer priority: let queued add/remove calls in before the next
        // slot is serviced.
        while shared.writers_pending.load(Ordering::Acquire) > 0 {
            std::thread::yield_now();
        }
        if interest.is_none() {
            continue;
        }

        // Probe is a cheap non-blocking peek; the job itself runs with the
        // table lock released.
        let (probe_result, mut job, target, sink) = {
            let mut table = shared.table.lock().unwrap();
            let Some(slot) = table.slots.get_mut(&id) else {
                continue; // removed mid-cycle
            };
            if slot.generation != generation {
                continue; // replaced mid-cycle
            }
            let probe_result = slot.probe.probe(interest);
            let Some(job) = slot.job.take() else {
                continue;
            };
            (probe_result, job, slot.target, slot.sink.clone())
        };

        let ready = match probe_result {
            Ok(ready) => ready,
            Err(e) => {
                // EBADF / ECONNRESET class failures: surface as SocketError
                // and drop the job.
                warn!(socket = id, error = %e, "socket probe failed");
                sink.add_event(Event::new(EventType::SocketError, target));
                let guard = WriterGuard::announce(shared);
                shared.table.lock().unwrap().slots.remove(&id);
                drop(guard);
                continue;
            }
        };

        if !ready.any() {
            // Nothing to do; put the job back.
            reinstall(shared, id, generation, Some(job));
            continue;
        }

        ran_any = true;
        let status = job.run(ready);
        match status {
            JobStatus::Keep => reinstall(shared, id, generation, Some(job)),
            JobStatus::Replace(new_job) => reinstall(shared, id, generation, Some(new_job)),
            JobStatus::Remove => {
                let guard = WriterGuard::announce(shared);
                let mut table = shared.table.lock().unwrap();
                if let Some(slot) = table.slots.get(&id) {
                    if slot.generation == generation {
                        table.slots.remove(&id);
                    }
                }
                drop(table);
                drop(guard);
            }
        }
    }
    ran_any
}

/// Puts a job back into its slot unless the slot was removed or replaced
/// while the job ran.
fn reinstall(shared: &Arc<Shared>, id: SocketId, generation: u64, job: Option<Box<dyn MuxJob>>) {
    let mut table = shared.table.lock().unwrap();
    if let Some(slot) = table.slots.get_mut(&id) {
        if slot.generation == generation && slot.job.is_none() {
            slot.job = job;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Dispatcher;
    use crate::net::stream::DataStream;
    use std::sync::mpsc;
    use std::time::Instant;

    /// Job that records readiness transitions into a channel.
    struct RecordingJob {
        interest: Interest,
        tx: mpsc::Sender<Readiness>,
        status: fn() -> JobStatus,
    }

    impl MuxJob for RecordingJob {
        fn interest(&self) -> Interest {
            self.interest
        }

        fn run(&mut self, ready: Readiness) -> JobStatus {
            self.tx.send(ready).unwrap();
            (self.status)()
        }
    }

    fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_job_runs_when_socket_becomes_readable() {
        let mux = SocketMultiplexer::new();
        let d = Dispatcher::new();
        let (local, mut remote) = PipeStream::pair();
        let (tx, rx) = mpsc::channel();

        mux.add_socket(
            Box::new(local),
            Box::new(RecordingJob {
                interest: Interest::READ,
                tx,
                status: || JobStatus::Remove,
            }),
            1,
            d.sink(),
        );

        // quiet socket: no transitions
        std::thread::sleep(Duration::from_millis(50));
        assert!(rx.try_recv().is_err(), "no readiness before data arrives");

        remote.write(b"wake up").unwrap();
        let ready = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(ready.readable);
    }

    #[test]
    fn test_remove_status_deregisters_job() {
        let mux = SocketMultiplexer::new();
        let d = Dispatcher::new();
        let (local, mut remote) = PipeStream::pair();
        let (tx, _rx) = mpsc::channel();

        mux.add_socket(
            Box::new(local),
            Box::new(RecordingJob {
                interest: Interest::READ,
                tx,
                status: || JobStatus::Remove,
            }),
            1,
            d.sink(),
        );
        remote.write(b"x").unwrap();

        wait_for("job removal", || mux.socket_count() == 0);
    }

    #[test]
    fn test_keep_status_runs_job_again() {
        let mux = SocketMultiplexer::new();
        let d = Dispatcher::new();
        let (local, mut remote) = PipeStream::pair();
        let (tx, rx) = mpsc::channel();

        mux.add_socket(
            Box::new(local),
            Box::new(RecordingJob {
                interest: Interest::READ,
                tx,
                status: || JobStatus::Keep,
            }),
            1,
            d.sink(),
        );

        // data is never drained, so a kept job keeps firing
        remote.write(b"x").unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(mux.socket_count(), 1);
    }

    #[test]
    fn test_replace_swaps_in_new_job() {
        struct FirstJob {
            tx: mpsc::Sender<&'static str>,
        }
        impl MuxJob for FirstJob {
            fn interest(&self) -> Interest {
                Interest::READ
            }
            fn run(&mut self, _: Readiness) -> JobStatus {
                self.tx.send("first").unwrap();
                JobStatus::Replace(Box::new(SecondJob {
                    tx: self.tx.clone(),
                }))
            }
        }
        struct SecondJob {
            tx: mpsc::Sender<&'static str>,
        }
        impl MuxJob for SecondJob {
            fn interest(&self) -> Interest {
                Interest::READ
            }
            fn run(&mut self, _: Readiness) -> JobStatus {
                self.tx.send("second").unwrap();
                JobStatus::Remove
            }
        }

        let mux = SocketMultiplexer::new();
        let d = Dispatcher::new();
        let (local, mut remote) = PipeStream::pair();
        let (tx, rx) = mpsc::channel();

        mux.add_socket(Box::new(local), Box::new(FirstJob { tx }), 1, d.sink());
        remote.write(b"xx").unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "first");
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "second");
        wait_for("slot cleanup", || mux.socket_count() == 0);
    }

    #[test]
    fn test_writable_interest_reports_writable_pipe() {
        let mux = SocketMultiplexer::new();
        let d = Dispatcher::new();
        let (local, _remote) = PipeStream::pair();
        let (tx, rx) = mpsc::channel();

        mux.add_socket(
            Box::new(local),
            Box::new(RecordingJob {
                interest: Interest::READ_WRITE,
                tx,
                status: || JobStatus::Remove,
            }),
            1,
            d.sink(),
        );

        let ready = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(ready.writable);
        assert!(!ready.readable);
    }

    #[test]
    fn test_remove_socket_is_idempotent_and_effective() {
        let mux = SocketMultiplexer::new();
        let d = Dispatcher::new();
        let (local, mut remote) = PipeStream::pair();
        let (tx, rx) = mpsc::channel();

        let id = mux.add_socket(
            Box::new(local),
            Box::new(RecordingJob {
                interest: Interest::READ,
                tx,
                status: || JobStatus::Keep,
            }),
            1,
            d.sink(),
        );
        mux.remove_socket(id);
        mux.remove_socket(id);
        assert_eq!(mux.socket_count(), 0);

        // data arriving after removal must not run the job
        remote.write(b"too late").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_mutation_during_dispatch_takes_effect_next_cycle() {
        // A kept job that, on its first run, registers a second socket from
        // the dispatch path itself (via the handle captured in the channel
        // consumer).  The new registration must be picked up by a later
        // cycle without corrupting the current one.
        let mux = Arc::new(SocketMultiplexer::new());
        let d = Dispatcher::new();
        let (local_a, mut remote_a) = PipeStream::pair();
        let (local_b, mut remote_b) = PipeStream::pair();
        let (tx_a, rx_a) = mpsc::channel();
        let (tx_b, rx_b) = mpsc::channel();

        mux.add_socket(
            Box::new(local_a),
            Box::new(RecordingJob {
                interest: Interest::READ,
                tx: tx_a,
                status: || JobStatus::Keep,
            }),
            1,
            d.sink(),
        );
        remote_a.write(b"a").unwrap();
        rx_a.recv_timeout(Duration::from_secs(2)).unwrap();

        // register B while A's job keeps firing
        mux.add_socket(
            Box::new(local_b),
            Box::new(RecordingJob {
                interest: Interest::READ,
                tx: tx_b,
                status: || JobStatus::Remove,
            }),
            2,
            d.sink(),
        );
        remote_b.write(b"b").unwrap();
        let ready_b = rx_b.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(ready_b.readable);
    }

    #[test]
    fn test_probe_failure_posts_socket_error_and_removes_job() {
        struct FailingProbe;
        impl SocketProbe for FailingProbe {
            fn probe(&self, _: Interest) -> io::Result<Readiness> {
                Err(io::Error::from_raw_os_error(9)) // EBADF
            }
        }

        let mux = SocketMultiplexer::new();
        let mut d = Dispatcher::new();
        let target = d.next_target();
        let (tx, _rx) = mpsc::channel();

        let got_error = std::rc::Rc::new(std::cell::RefCell::new(false));
        let flag = std::rc::Rc::clone(&got_error);
        d.add_handler(EventType::SocketError, target, move |_, _| {
            *flag.borrow_mut() = true;
        });

        mux.add_socket(
            Box::new(FailingProbe),
            Box::new(RecordingJob {
                interest: Interest::READ,
                tx,
                status: || JobStatus::Keep,
            }),
            target,
            d.sink(),
        );

        wait_for("failing socket removal", || mux.socket_count() == 0);
        d.pump();
        assert!(*got_error.borrow(), "SocketError must reach the job's target");
    }
}
