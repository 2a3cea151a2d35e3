//! The per-worker event loop.
//!
//! Everything a worker owns exclusively (reactor, socket table, timers, scratch buffers) lives
//! in a [`LocalWorker`] reachable only from the worker's own thread. Code running on a worker
//! finds it through [`current_for`].

use super::timer_wheel::TimerWheel;
use super::{pin_thread_to_core, WorkerId, WorkerShared, WAKER_TOKEN};
use crate::errors::NetError;
use crate::event::{EventClass, NetEvent, Task, TaskStatus};
use crate::manager::ManagerInner;
use crate::socket::handle::{self, Handle};
use crate::socket::{self, listener, tcp, udp, Readiness, SocketIo};
use crate::timer::{self, TimerInner};

use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};
use std::io;
use std::rc::Rc;
use std::sync::{Arc, Barrier, Weak};
use std::time::{Duration, Instant};

use mio::{Events, Poll};
use slab::Slab;

/// Size of the shared receive buffer; large enough for any UDP datagram.
pub(crate) const RECVBUF_SIZE: usize = 64 * 1024;
const EVENTS_CAPACITY: usize = 1024;
/// Superseded timer entries tolerated before the wheel is compacted.
const STALE_TIMER_SLACK: usize = 256;

thread_local! {
    static CURRENT: RefCell<Option<Rc<LocalWorker>>> = RefCell::new(None);
}

/// The worker running on this thread, if any.
fn current() -> Option<Rc<LocalWorker>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// The worker running on this thread, if it belongs to `mgr`.
pub(crate) fn current_for(mgr: &ManagerInner) -> Option<Rc<LocalWorker>> {
    current().filter(|lw| std::ptr::eq(Arc::as_ptr(&lw.mgr), mgr))
}

/// Deferred work that must run on this worker outside of any socket table borrow.
pub(crate) type LocalCompletion = Box<dyn FnOnce()>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum EventAction {
    Continue,
    /// Leave the reactor loop after this event.
    Stop,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum QueueStatus {
    Empty,
    Processed,
    Stopped,
    /// A higher-priority queue became non-empty.
    Deferred,
}

/// Reactor work left over when the loop stopped in the middle of a batch.
enum Leftover {
    Io(Readiness),
    Timer(TimerKey),
}

/* --------------------------------------------------------------------------------- */

pub(crate) enum TimerKey {
    Read { token: usize, gen: u64 },
    Write { token: usize, gen: u64 },
    User { timer: Weak<TimerInner>, gen: u64 },
}

impl TimerKey {
    fn gen(&self) -> u64 {
        match self {
            TimerKey::Read { gen, .. } | TimerKey::Write { gen, .. } | TimerKey::User { gen, .. } => {
                *gen
            }
        }
    }
}

/// Timer wheel plus the generation counter that tells live entries from stale ones.
pub(crate) struct TimerSet {
    wheel: TimerWheel<TimerKey>,
    next_gen: u64,
    /// Generations armed and not yet expired or disarmed.
    armed: HashSet<u64>,
}

impl TimerSet {
    fn new(slots: usize, resolution_ms: u64) -> Self {
        TimerSet {
            wheel: TimerWheel::new(slots, resolution_ms),
            next_gen: 0,
            armed: HashSet::new(),
        }
    }

    /// Schedules a new entry and returns its generation.
    pub(crate) fn arm(&mut self, after: Duration, key: impl FnOnce(u64) -> TimerKey) -> u64 {
        self.next_gen += 1;
        let gen = self.next_gen;
        self.wheel.insert(Instant::now() + after, key(gen));
        self.armed.insert(gen);
        gen
    }

    /// Marks the entry `gen` as superseded. Superseded entries are dropped in batches.
    pub(crate) fn disarm(&mut self, gen: u64) {
        if !self.armed.remove(&gen) {
            return;
        }
        if self.wheel.len() > 2 * self.armed.len() + STALE_TIMER_SLACK {
            let armed = &self.armed;
            self.wheel.retain(|key| armed.contains(&key.gen()));
        }
    }

    fn expire(&mut self, now: Instant) -> Vec<TimerKey> {
        let expired = self.wheel.expire(now);
        for key in expired.iter() {
            self.armed.remove(&key.gen());
        }
        expired
    }

    pub(crate) fn len(&self) -> usize {
        self.wheel.len()
    }
}

pub(crate) struct LoopState {
    pub(crate) poll: Poll,
    pub(crate) sockets: Slab<SocketIo>,
    pub(crate) timers: TimerSet,
}

pub(crate) struct LocalWorker {
    pub(crate) shared: Arc<WorkerShared>,
    pub(crate) mgr: Arc<ManagerInner>,
    pub(crate) state: RefCell<LoopState>,
    recvbuf: RefCell<Option<Vec<u8>>>,
    completions: RefCell<VecDeque<LocalCompletion>>,
    leftovers: RefCell<VecDeque<Leftover>>,
    stop_requested: Cell<bool>,
    /// Whether this worker is included in the manager's paused count.
    pause_counted: Cell<bool>,
}

impl LocalWorker {
    #[inline]
    pub(crate) fn id(&self) -> WorkerId {
        self.shared.id
    }

    /// Whether the worker is inside an operation that holds its loop state.
    #[inline]
    pub(crate) fn is_busy(&self) -> bool {
        self.state.try_borrow_mut().is_err()
    }

    /// Runs `f` after the current operation returns.
    pub(crate) fn defer(&self, f: impl FnOnce() + 'static) {
        self.completions.borrow_mut().push_back(Box::new(f));
    }

    /// Runs deferred completions until none are left or the worker pauses.
    pub(crate) fn run_completions(&self) {
        loop {
            if self.shared.is_paused() {
                break;
            }
            let next = self.completions.borrow_mut().pop_front();
            match next {
                Some(completion) => completion(),
                None => break,
            }
        }
    }

    /// Borrows the worker's receive buffer. A reentrant caller gets a fresh one.
    pub(crate) fn take_recvbuf(&self) -> Vec<u8> {
        let buf = self.recvbuf.borrow_mut().take();
        buf.unwrap_or_else(|| self.mgr.mem.get(RECVBUF_SIZE))
    }

    pub(crate) fn return_recvbuf(&self, buf: Vec<u8>) {
        let mut slot = self.recvbuf.borrow_mut();
        if slot.is_none() {
            *slot = Some(buf);
        } else {
            self.mgr.mem.put(buf);
        }
    }

    /// Asks the reactor loop to return once the current event has been handled.
    pub(crate) fn request_stop(&self) {
        self.stop_requested.set(true);
    }

    /// Adds this worker to the manager's paused count, once per pause.
    pub(crate) fn count_paused(&self) {
        if !self.pause_counted.replace(true) {
            self.mgr.worker_paused();
        }
    }

    /// Removes this worker from the manager's paused count, if it was counted.
    pub(crate) fn count_resumed(&self) {
        if self.pause_counted.replace(false) {
            self.mgr.worker_resumed();
        }
    }

    /* ----------------------------------------------------------------------------- */

    fn run_loop(&self) {
        self.stop_requested.set(false);
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        self.run_completions();
        let mut pending = self.process_all_queues();
        if !self.stop_requested.get() {
            self.run_leftovers();
        }

        while !self.stop_requested.get() {
            let timeout = if pending {
                Some(Duration::ZERO)
            } else {
                self.state.borrow().timers.wheel.next_timeout(Instant::now())
            };
            let polled = self.state.borrow_mut().poll.poll(&mut events, timeout);
            if let Err(e) = polled {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("Worker {} reactor failed: {}", self.id(), e);
                self.shared.set_finished();
                return;
            }

            pending = false;
            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    if !self.stop_requested.get() {
                        pending = self.process_all_queues();
                    }
                } else if self.stop_requested.get() {
                    // readiness is edge-triggered, keep it for the next run
                    self.keep_leftover(Leftover::Io(Readiness::from(event)));
                } else {
                    socket::dispatch_io(self, Readiness::from(event));
                    self.run_completions();
                }
            }
            if !self.stop_requested.get() {
                self.fire_timers();
            }
            if !pending && !self.stop_requested.get() {
                pending = self.shared.queues.has_work(self.shared.is_paused());
            }
        }
    }

    /// One pass over the queues in class order. Returns whether work remains.
    fn process_all_queues(&self) -> bool {
        'pass: loop {
            for class in EventClass::ALL {
                if self.shared.is_paused() && !class.runs_while_paused() {
                    continue;
                }
                match self.process_queue(class) {
                    QueueStatus::Stopped => return false,
                    QueueStatus::Deferred => continue 'pass,
                    QueueStatus::Empty | QueueStatus::Processed => {}
                }
            }
            break;
        }
        self.shared.queues.has_work(self.shared.is_paused())
    }

    fn process_queue(&self, class: EventClass) -> QueueStatus {
        let mut batch = match self.shared.queues.take(class) {
            Some(batch) => batch,
            None => return QueueStatus::Deferred,
        };
        if batch.is_empty() {
            return QueueStatus::Empty;
        }
        while let Some(event) = batch.pop_front() {
            let action = self.process_event(event);
            self.run_completions();
            if action == EventAction::Stop || self.stop_requested.get() {
                self.shared.queues.requeue_front(class, batch);
                return QueueStatus::Stopped;
            }
        }
        QueueStatus::Processed
    }

    /// Processes everything in `class`, including events queued while draining.
    pub(crate) fn drain_queue(&self, class: EventClass) {
        loop {
            let batch = self.shared.queues.take_all(class);
            if batch.is_empty() {
                break;
            }
            for event in batch {
                self.process_event(event);
                self.run_completions();
            }
        }
    }

    pub(crate) fn process_event(&self, event: NetEvent) -> EventAction {
        log::trace!("Worker {} processing {:?}", self.id(), event);
        match event {
            NetEvent::Pause => {
                self.shared.set_paused(true);
                self.request_stop();
                return EventAction::Stop;
            }
            NetEvent::Resume => self.shared.set_paused(false),
            NetEvent::Stop => {
                self.shared.set_finished();
                self.request_stop();
                return EventAction::Stop;
            }

            NetEvent::PrivilegedTask(task) => self.run_task(task, EventClass::Privileged),
            NetEvent::Task(task) => self.run_task(task, EventClass::Task),

            NetEvent::Listen { sock, io } => listener::start_child(self, &sock, io),
            NetEvent::StopListening(sock) => listener::stop_child(self, &sock),
            NetEvent::Accept(sock) => tcp::accept_ready(self, &sock),
            NetEvent::UdpConnect(req) => udp::connect(self, req),
            NetEvent::TcpConnect(req) => tcp::connect(self, req),
            NetEvent::Send(req) => socket::send(self, req),
            NetEvent::Read { handle, cb } => socket::start_read(self, handle, cb),
            NetEvent::CancelRead(handle) => socket::cancel_read(self, &handle),
            NetEvent::PauseRead(handle) => socket::pause_read(self, &handle),
            NetEvent::ResumeRead(handle) => socket::resume_read(self, &handle),
            NetEvent::RestartTimer(handle) => socket::restart_read_timer(self, handle.socket()),
            NetEvent::Close(sock) => socket::close_io(self, &sock, NetError::Canceled),
            NetEvent::Detach(inner) => handle::finalize(inner, Some(self)),
            NetEvent::Shutdown => socket::shutdown_walk(self),

            NetEvent::ConnectCb { req, result } => {
                let result = result.map(|_| {
                    let sock = req.socket();
                    sock.statichandle()
                        .unwrap_or_else(|| Handle::get(sock, None, None))
                });
                req.complete_connect(result);
            }
            NetEvent::SendCb { req, result } => req.complete_send(result),
            NetEvent::ReadCb { handle, cb, result } => cb(&handle, Err(result)),

            NetEvent::TimerStart { timer, ms } => timer::start_local(self, &timer, ms),
            NetEvent::TimerStop(timer) => timer::stop_local(self, &timer),

            NetEvent::WorkDone(completion) => completion(),
        }
        EventAction::Continue
    }

    fn run_task(&self, mut task: Task, class: EventClass) {
        if task() == TaskStatus::Requeue {
            let event = match class {
                EventClass::Privileged => NetEvent::PrivilegedTask(task),
                _ => NetEvent::Task(task),
            };
            self.shared.enqueue(event);
        }
    }

    fn fire_timers(&self) {
        let expired = self.state.borrow_mut().timers.expire(Instant::now());
        for key in expired {
            if self.stop_requested.get() {
                self.keep_leftover(Leftover::Timer(key));
            } else {
                self.fire_timer(key);
            }
        }
    }

    fn fire_timer(&self, key: TimerKey) {
        match key {
            TimerKey::Read { token, gen } => socket::on_read_timeout(self, token, gen),
            TimerKey::Write { token, gen } => socket::on_write_timeout(self, token, gen),
            TimerKey::User { timer, gen } => {
                if let Some(timer) = timer.upgrade() {
                    timer::fire(&timer, gen);
                }
            }
        }
        self.run_completions();
    }

    fn keep_leftover(&self, leftover: Leftover) {
        self.leftovers.borrow_mut().push_back(leftover);
    }

    /// Handles reactor work that a stop left behind, until it is done or the loop stops again.
    fn run_leftovers(&self) {
        while !self.stop_requested.get() {
            let next = self.leftovers.borrow_mut().pop_front();
            match next {
                Some(Leftover::Io(ready)) => {
                    socket::dispatch_io(self, ready);
                    self.run_completions();
                }
                Some(Leftover::Timer(key)) => self.fire_timer(key),
                None => break,
            }
        }
    }

    /// Waits out a pause, running only PRIORITY and PRIVILEGED work.
    fn pause_phase(&self) {
        self.count_paused();
        while self.shared.is_paused() && !self.shared.is_finished() {
            self.shared.queues.wait_privileged();
            self.stop_requested.set(false);
            self.process_queue(EventClass::Priority);
            if self.shared.is_paused() && !self.shared.is_finished() {
                self.stop_requested.set(false);
                self.process_queue(EventClass::Privileged);
            }
        }
        // privileged work queued before the resume finishes before anyone else runs
        self.drain_queue(EventClass::Privileged);
        self.count_resumed();
    }

    /// Runs everything still owned by an exiting worker to completion.
    fn teardown(&self) {
        self.shared.set_paused(false);
        self.count_resumed();
        self.leftovers.borrow_mut().clear();
        self.drain_queue(EventClass::Privileged);
        self.drain_queue(EventClass::Task);
        socket::teardown_all(self);
        self.run_completions();
        for event in self.shared.queues.drain_all() {
            event.abandon();
        }
        self.run_completions();

        let pending = self.state.borrow().timers.len();
        log::debug!("Worker {} dropped {} pending timers", self.id(), pending);
        if let Some(buf) = self.recvbuf.borrow_mut().take() {
            self.mgr.mem.put(buf);
        }
    }
}

/* --------------------------------------------------------------------------------- */

/// Entry point of a worker thread.
pub(crate) fn worker_main(
    mgr: Arc<ManagerInner>,
    shared: Arc<WorkerShared>,
    poll: Poll,
    core: Option<u32>,
    barrier: Arc<Barrier>,
) {
    let id = shared.id;
    if let Some(core) = core {
        if let Err(e) = pin_thread_to_core(id, core) {
            log::warn!("Failed to pin worker {} to core {}: {}", id, core, e);
        }
    }
    let state = LoopState {
        poll,
        sockets: Slab::new(),
        timers: TimerSet::new(mgr.timer.slots, mgr.timer.resolution_ms),
    };
    let lw = Rc::new(LocalWorker {
        recvbuf: RefCell::new(Some(mgr.mem.get(RECVBUF_SIZE))),
        shared,
        mgr: Arc::clone(&mgr),
        state: RefCell::new(state),
        completions: RefCell::new(VecDeque::new()),
        leftovers: RefCell::new(VecDeque::new()),
        stop_requested: Cell::new(false),
        pause_counted: Cell::new(false),
    });
    CURRENT.with(|c| *c.borrow_mut() = Some(Rc::clone(&lw)));
    mgr.worker_started();
    barrier.wait();
    log::info!("Launched network worker {}", id);

    loop {
        if lw.shared.is_finished() {
            break;
        }
        if lw.shared.is_paused() {
            lw.pause_phase();
            continue;
        }
        lw.run_loop();
    }

    lw.teardown();
    CURRENT.with(|c| c.borrow_mut().take());
    drop(lw);
    log::info!("Network worker {} exited", id);
    mgr.worker_exited();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superseded_timers_are_compacted() {
        let mut timers = TimerSet::new(64, 5);
        let mut gen = timers.arm(Duration::from_secs(30), |gen| TimerKey::Read { token: 0, gen });
        for _ in 0..1000 {
            timers.disarm(gen);
            gen = timers.arm(Duration::from_secs(30), |gen| TimerKey::Read { token: 0, gen });
        }
        assert!(timers.len() <= STALE_TIMER_SLACK + 2, "{} entries", timers.len());
        let next = timers.wheel.next_timeout(Instant::now()).unwrap();
        assert!(next > Duration::from_secs(29));

        let expired = timers.expire(Instant::now() + Duration::from_secs(31));
        assert!(expired.iter().any(|key| key.gen() == gen));
        assert!(timers.armed.is_empty());
    }
}
