//! The network manager.
//!
//! A [`Manager`] owns a fixed pool of worker threads. Each worker runs its own reactor and event
//! queues; sockets, handles and timers are bound to one worker for their whole life.

mod pause;

use crate::config::{default_config, NetmgrConfig, TcpConfig, Timeouts, TimerConfig, UdpConfig};
use crate::errors::{NetError, NetResult};
use crate::event::{Completion, NetEvent, TaskStatus};
use crate::memory::MemContext;
use crate::offload::OffloadPool;
use crate::quota::Quota;
use crate::socket::listener::{self, Listener};
use crate::socket::{self, AcceptCb, Handle, ListenCallbacks, RecvCb, SocketType};
use crate::stats::Stats;
use crate::worker::event_loop::worker_main;
use crate::worker::{current_for, WorkerId, WorkerShared, WAKER_TOKEN};

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::{Poll, Waker};
use parking_lot::{Condvar, Mutex};

/// How long [`Manager::destroy`] waits for sockets to unwind.
const DESTROY_WAIT: Duration = Duration::from_secs(10);

/// Worker bookkeeping for the pause/resume barriers.
#[derive(Debug, Default)]
pub(crate) struct ManagerSync {
    pub(crate) workers_running: usize,
    pub(crate) workers_paused: usize,
    pub(crate) paused: bool,
    /// Worker holding the interlock.
    pub(crate) interlocked: Option<WorkerId>,
    /// The interlock was taken by a worker's pause and goes with the resume.
    pub(crate) pause_interlocked: bool,
}

pub(crate) struct ManagerInner {
    pub(crate) workers: Vec<Arc<WorkerShared>>,
    /// Number of live [`Manager`] values.
    references: AtomicUsize,
    closing: AtomicBool,
    paused: AtomicBool,
    pub(crate) sync: Mutex<ManagerSync>,
    pub(crate) cond: Condvar,

    init: AtomicU32,
    idle: AtomicU32,
    keepalive: AtomicU32,
    advertised: AtomicU32,
    maxudp: AtomicU32,
    load_balance: AtomicBool,

    pub(crate) udp: UdpConfig,
    pub(crate) tcp: TcpConfig,
    pub(crate) timer: TimerConfig,
    pub(crate) stats: Stats,
    pub(crate) mem: Arc<MemContext>,

    live_sockets: AtomicUsize,
    next_socket_id: AtomicU64,
    next_worker: AtomicUsize,
    threads: Mutex<Vec<JoinHandle<()>>>,
    offload: OffloadPool,
}

/// Logs an unrecoverable startup failure and aborts the process.
pub(crate) fn fatal(context: &str, err: impl fmt::Display) -> ! {
    log::error!("{}: {}", context, err);
    std::process::abort()
}

impl ManagerInner {
    #[inline]
    pub(crate) fn nworkers(&self) -> usize {
        self.workers.len()
    }

    #[inline]
    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub(crate) fn timeouts(&self) -> Timeouts {
        Timeouts {
            init: self.init.load(Ordering::Relaxed),
            idle: self.idle.load(Ordering::Relaxed),
            keepalive: self.keepalive.load(Ordering::Relaxed),
            advertised: self.advertised.load(Ordering::Relaxed),
        }
    }

    #[inline]
    pub(crate) fn max_udp(&self) -> u32 {
        self.maxudp.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn load_balance(&self) -> bool {
        self.load_balance.load(Ordering::Relaxed)
    }

    pub(crate) fn next_socket_id(&self) -> u64 {
        self.next_socket_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn socket_created(&self) {
        self.live_sockets.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn socket_destroyed(&self) {
        if self.live_sockets.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _sync = self.sync.lock();
            self.cond.notify_all();
        }
    }

    pub(crate) fn live_sockets(&self) -> usize {
        self.live_sockets.load(Ordering::Acquire)
    }

    /// The calling worker, or the next worker in round-robin order for other threads.
    pub(crate) fn current_or_next_worker(&self) -> WorkerId {
        match current_for(self) {
            Some(lw) => lw.id(),
            None => self.next_worker(),
        }
    }

    fn next_worker(&self) -> WorkerId {
        let n = self.next_worker.fetch_add(1, Ordering::Relaxed);
        WorkerId((n % self.nworkers()) as u32)
    }

    /// Queues `event` on worker `tid`.
    pub(crate) fn enqueue(&self, tid: WorkerId, event: NetEvent) {
        match self.workers.get(tid.index()) {
            Some(worker) => worker.enqueue(event),
            None => {
                log::error!("Event {:?} for unknown worker {}", event, tid);
                event.abandon();
            }
        }
    }

    /// Runs `event` right away when called on worker `tid` outside of any other operation,
    /// otherwise queues it.
    pub(crate) fn maybe_enqueue(&self, tid: WorkerId, event: NetEvent) {
        if let Some(lw) = current_for(self) {
            if lw.id() == tid && !lw.is_busy() {
                lw.process_event(event);
                return;
            }
        }
        self.enqueue(tid, event);
    }

    /* ----------------------------------------------------------------------------- */

    pub(crate) fn worker_started(&self) {
        self.sync.lock().workers_running += 1;
    }

    pub(crate) fn worker_exited(&self) {
        let mut sync = self.sync.lock();
        sync.workers_running -= 1;
        self.cond.notify_all();
    }

    pub(crate) fn worker_paused(&self) {
        let mut sync = self.sync.lock();
        sync.workers_paused += 1;
        self.cond.notify_all();
    }

    pub(crate) fn worker_resumed(&self) {
        let mut sync = self.sync.lock();
        sync.workers_paused -= 1;
        self.cond.notify_all();
    }

    fn shutdown(&self) {
        if !self.closing.swap(true, Ordering::AcqRel) {
            log::info!("Network manager shutting down");
        }
        for worker in &self.workers {
            self.maybe_enqueue(worker.id, NetEvent::Shutdown);
        }
    }

    /// Stops every worker. Waits for them unless called from one of them.
    fn stop_workers(&self) {
        let current = current_for(self);
        for worker in &self.workers {
            match &current {
                Some(lw) if lw.id() == worker.id => {
                    worker.set_finished();
                    lw.request_stop();
                }
                _ => worker.enqueue(NetEvent::Stop),
            }
        }
        if current.is_some() {
            log::warn!("Network manager released from a worker thread, not waiting for workers");
            return;
        }

        let mut sync = self.sync.lock();
        while sync.workers_running > 0 {
            self.cond.wait(&mut sync);
        }
        drop(sync);

        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for thread in threads {
            if thread.join().is_err() {
                log::error!("Network worker panicked");
            }
        }
        self.offload.shutdown();
        log::info!("Network manager stopped");
    }
}

/* --------------------------------------------------------------------------------- */

/// Handle to a running network manager.
///
/// Cloning a `Manager` takes a reference; the workers stop when the last one is dropped.
///
/// ## Example
///
/// ```no_run
/// use netmgr_core::{Manager, MemContext};
/// use std::sync::Arc;
///
/// let mgr = Manager::create(Arc::new(MemContext::new("dns")), 4);
/// let listener = mgr
///     .listen_udp("127.0.0.1:5300".parse().unwrap(), |handle, result| {
///         if let Ok(msg) = result {
///             handle.send(msg, |_, _| {});
///         }
///     })
///     .unwrap();
/// drop(listener);
/// mgr.destroy();
/// ```
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Manager {
    /// Starts a manager with `nworkers` workers and otherwise default settings.
    pub fn create(mem: Arc<MemContext>, nworkers: usize) -> Manager {
        let config = NetmgrConfig {
            nworkers,
            ..default_config()
        };
        Manager::start(mem, &config)
    }

    /// Starts a manager configured by `config`.
    pub fn from_config(config: &NetmgrConfig) -> Manager {
        Manager::start(Arc::new(MemContext::default()), config)
    }

    fn start(mem: Arc<MemContext>, config: &NetmgrConfig) -> Manager {
        let nworkers = config.nworkers.max(1);
        let mut polls = Vec::with_capacity(nworkers);
        let mut workers = Vec::with_capacity(nworkers);
        for i in 0..nworkers {
            let id = WorkerId(i as u32);
            let poll = Poll::new().unwrap_or_else(|e| fatal("Failed to create reactor", e));
            let waker = Waker::new(poll.registry(), WAKER_TOKEN)
                .unwrap_or_else(|e| fatal("Failed to create reactor waker", e));
            polls.push(poll);
            workers.push(Arc::new(WorkerShared::new(id, waker)));
        }

        let timeouts = config.timeouts;
        let inner = Arc::new(ManagerInner {
            offload: OffloadPool::new(config.offload_threads, workers.clone()),
            workers,
            references: AtomicUsize::new(1),
            closing: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            sync: Mutex::new(ManagerSync::default()),
            cond: Condvar::new(),
            init: AtomicU32::new(timeouts.init),
            idle: AtomicU32::new(timeouts.idle),
            keepalive: AtomicU32::new(timeouts.keepalive),
            advertised: AtomicU32::new(timeouts.advertised),
            maxudp: AtomicU32::new(config.udp.max_udp),
            load_balance: AtomicBool::new(config.load_balance),
            udp: config.udp.clone(),
            tcp: config.tcp.clone(),
            timer: config.timer.clone(),
            stats: Stats::new(),
            mem,
            live_sockets: AtomicUsize::new(0),
            next_socket_id: AtomicU64::new(0),
            next_worker: AtomicUsize::new(0),
            threads: Mutex::new(vec![]),
        });

        let barrier = Arc::new(Barrier::new(nworkers + 1));
        let mut threads = Vec::with_capacity(nworkers);
        for (shared, poll) in inner.workers.iter().zip(polls) {
            let mgr = Arc::clone(&inner);
            let shared = Arc::clone(shared);
            let core = config.core_for(shared.id);
            let barrier = Arc::clone(&barrier);
            let thread = thread::Builder::new()
                .name(format!("netmgr-{}", shared.id))
                .spawn(move || worker_main(mgr, shared, poll, core, barrier))
                .unwrap_or_else(|e| fatal("Failed to spawn network worker", e));
            threads.push(thread);
        }
        barrier.wait();
        *inner.threads.lock() = threads;
        log::info!("Network manager started with {} workers", nworkers);
        Manager { inner }
    }

    #[inline]
    pub(crate) fn inner(&self) -> &Arc<ManagerInner> {
        &self.inner
    }

    pub fn nworkers(&self) -> usize {
        self.inner.nworkers()
    }

    /// The worker running on the calling thread, if it belongs to this manager.
    pub fn current_worker(&self) -> Option<WorkerId> {
        current_for(&self.inner).map(|lw| lw.id())
    }

    /// Closes every socket. New listens and connects fail with [`NetError::ShuttingDown`].
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Shuts down, waits for open sockets to unwind and releases this reference.
    pub fn destroy(self) {
        self.shutdown();
        if current_for(&self.inner).is_none() {
            let deadline = Instant::now() + DESTROY_WAIT;
            let mut sync = self.inner.sync.lock();
            while self.inner.live_sockets() > 0 {
                if self.inner.cond.wait_until(&mut sync, deadline).timed_out() {
                    log::error!(
                        "{} sockets still alive after {:?}",
                        self.inner.live_sockets(),
                        DESTROY_WAIT
                    );
                    break;
                }
            }
        }
    }

    pub fn is_closing(&self) -> bool {
        self.inner.is_closing()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.is_paused()
    }

    /* ----------------------------------------------------------------------------- */

    pub fn set_timeouts(&self, timeouts: Timeouts) {
        let inner = &self.inner;
        inner.init.store(timeouts.init, Ordering::Relaxed);
        inner.idle.store(timeouts.idle, Ordering::Relaxed);
        inner.keepalive.store(timeouts.keepalive, Ordering::Relaxed);
        inner.advertised.store(timeouts.advertised, Ordering::Relaxed);
    }

    pub fn timeouts(&self) -> Timeouts {
        self.inner.timeouts()
    }

    /// Largest UDP datagram accepted or sent, `0` for no limit. Larger datagrams are dropped.
    pub fn set_max_udp(&self, max: u32) {
        self.inner.maxudp.store(max, Ordering::Relaxed);
    }

    pub fn max_udp(&self) -> u32 {
        self.inner.max_udp()
    }

    /// Whether listeners bind one socket per worker. Applies to listeners created afterwards.
    pub fn set_load_balance(&self, enabled: bool) {
        self.inner.load_balance.store(enabled, Ordering::Relaxed);
    }

    pub fn load_balance(&self) -> bool {
        self.inner.load_balance()
    }

    pub fn stats(&self) -> &Stats {
        &self.inner.stats
    }

    pub fn mem(&self) -> &MemContext {
        &self.inner.mem
    }

    /* ----------------------------------------------------------------------------- */

    /// Listens for UDP datagrams on `addr`. Every datagram arrives on a fresh handle.
    pub fn listen_udp<F>(&self, addr: SocketAddr, recv_cb: F) -> NetResult<Listener>
    where
        F: Fn(&Handle, NetResult<&[u8]>) + Send + Sync + 'static,
    {
        let callbacks = ListenCallbacks {
            recv: Some(Arc::new(recv_cb) as RecvCb),
            accept: None,
        };
        listener::listen(&self.inner, SocketType::UdpListener, addr, callbacks, None)
    }

    /// Listens for TCP connections on `addr`. `accept_cb` runs for every accepted connection;
    /// returning an error closes it.
    pub fn listen_tcp<F>(
        &self,
        addr: SocketAddr,
        accept_cb: F,
        quota: Option<Arc<Quota>>,
    ) -> NetResult<Listener>
    where
        F: Fn(&Handle) -> NetResult<()> + Send + Sync + 'static,
    {
        let callbacks = ListenCallbacks {
            recv: None,
            accept: Some(Arc::new(accept_cb) as AcceptCb),
        };
        listener::listen(&self.inner, SocketType::TcpListener, addr, callbacks, quota)
    }

    /// Listens for length-prefixed DNS messages over TCP on `addr`.
    ///
    /// Every message arrives on a fresh handle; reading is paused while the configured number of
    /// message handles are still held.
    pub fn listen_tcpdns<R, A>(
        &self,
        addr: SocketAddr,
        recv_cb: R,
        accept_cb: A,
        quota: Option<Arc<Quota>>,
    ) -> NetResult<Listener>
    where
        R: Fn(&Handle, NetResult<&[u8]>) + Send + Sync + 'static,
        A: Fn(&Handle) -> NetResult<()> + Send + Sync + 'static,
    {
        let callbacks = ListenCallbacks {
            recv: Some(Arc::new(recv_cb) as RecvCb),
            accept: Some(Arc::new(accept_cb) as AcceptCb),
        };
        listener::listen(&self.inner, SocketType::TcpDnsListener, addr, callbacks, quota)
    }

    pub fn udp_connect<F>(&self, local: Option<SocketAddr>, peer: SocketAddr, cb: F, timeout: u32)
    where
        F: FnOnce(NetResult<&Handle>) + Send + 'static,
    {
        socket::connect(&self.inner, SocketType::UdpSocket, local, peer, Box::new(cb), timeout);
    }

    /// Connects to `peer`, failing with [`NetError::TimedOut`] after `timeout` milliseconds.
    pub fn tcp_connect<F>(&self, local: Option<SocketAddr>, peer: SocketAddr, cb: F, timeout: u32)
    where
        F: FnOnce(NetResult<&Handle>) + Send + 'static,
    {
        socket::connect(&self.inner, SocketType::TcpSocket, local, peer, Box::new(cb), timeout);
    }

    pub fn tcpdns_connect<F>(
        &self,
        local: Option<SocketAddr>,
        peer: SocketAddr,
        cb: F,
        timeout: u32,
    ) where
        F: FnOnce(NetResult<&Handle>) + Send + 'static,
    {
        socket::connect(
            &self.inner,
            SocketType::TcpDnsSocket,
            local,
            peer,
            Box::new(cb),
            timeout,
        );
    }

    /* ----------------------------------------------------------------------------- */

    /// Schedules `task` on a worker. Without a hint, workers are picked round-robin.
    pub fn task_enqueue<F>(&self, task: F, worker: Option<usize>)
    where
        F: FnMut() -> TaskStatus + Send + 'static,
    {
        let tid = self.task_worker(worker);
        self.inner.enqueue(tid, NetEvent::Task(Box::new(task)));
    }

    /// Schedules a task that also runs while the manager is paused and always finishes before a
    /// resume completes.
    pub fn privileged_task_enqueue<F>(&self, task: F, worker: Option<usize>)
    where
        F: FnMut() -> TaskStatus + Send + 'static,
    {
        let tid = self.task_worker(worker);
        self.inner.enqueue(tid, NetEvent::PrivilegedTask(Box::new(task)));
    }

    fn task_worker(&self, hint: Option<usize>) -> WorkerId {
        match hint {
            Some(n) => WorkerId((n % self.nworkers()) as u32),
            None => self.inner.next_worker(),
        }
    }

    /// Runs `work` on the offload pool, then `after` with its result back on the calling worker.
    ///
    /// Fails with [`NetError::NotWorker`] when not called from one of this manager's workers.
    pub fn work_offload<T, W, A>(&self, work: W, after: A) -> NetResult<()>
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
        A: FnOnce(T) + Send + 'static,
    {
        let lw = current_for(&self.inner).ok_or(NetError::NotWorker)?;
        self.inner.offload.submit(
            lw.id(),
            Box::new(move || {
                let result = work();
                Box::new(move || after(result)) as Completion
            }),
        )
    }
}

impl Clone for Manager {
    fn clone(&self) -> Self {
        self.inner.references.fetch_add(1, Ordering::AcqRel);
        Manager {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        if self.inner.references.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.stop_workers();
        }
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let sync = self.inner.sync.lock();
        f.debug_struct("Manager")
            .field("nworkers", &self.inner.nworkers())
            .field("workers_running", &sync.workers_running)
            .field("workers_paused", &sync.workers_paused)
            .field("closing", &self.inner.is_closing())
            .field("live_sockets", &self.inner.live_sockets())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn tasks_run_on_hinted_worker() {
        let mgr = Manager::create(Arc::new(MemContext::new("test")), 2);
        let (tx, rx) = mpsc::channel();
        let m = mgr.clone();
        mgr.task_enqueue(
            move || {
                tx.send(m.current_worker()).unwrap();
                TaskStatus::Done
            },
            Some(3),
        );
        assert_eq!(rx.recv().unwrap(), Some(WorkerId(1)));
        assert_eq!(mgr.current_worker(), None);
    }

    #[test]
    fn requeued_task_runs_again() {
        let mgr = Manager::create(Arc::new(MemContext::new("test")), 1);
        let (tx, rx) = mpsc::channel();
        let mut runs = 0;
        mgr.task_enqueue(
            move || {
                runs += 1;
                if runs < 3 {
                    return TaskStatus::Requeue;
                }
                tx.send(runs).unwrap();
                TaskStatus::Done
            },
            None,
        );
        assert_eq!(rx.recv().unwrap(), 3);
    }

    #[test]
    fn offload_requires_worker() {
        let mgr = Manager::create(Arc::new(MemContext::new("test")), 1);
        let result = mgr.work_offload(|| 1, |_| {});
        assert_eq!(result, Err(NetError::NotWorker));
    }

    #[test]
    fn offload_completes_on_origin_worker() {
        let mgr = Manager::create(Arc::new(MemContext::new("test")), 2);
        let (tx, rx) = mpsc::channel();
        let m = mgr.clone();
        mgr.task_enqueue(
            move || {
                let origin = m.current_worker();
                let m2 = m.clone();
                let tx = tx.clone();
                m.work_offload(
                    || 6 * 7,
                    move |answer| {
                        tx.send((answer, origin, m2.current_worker())).unwrap();
                    },
                )
                .unwrap();
                TaskStatus::Done
            },
            Some(1),
        );
        let (answer, origin, completed_on) = rx.recv().unwrap();
        assert_eq!(answer, 42);
        assert_eq!(origin, Some(WorkerId(1)));
        assert_eq!(completed_on, origin);
    }

    #[test]
    fn settings_round_trip() {
        let mgr = Manager::create(Arc::new(MemContext::new("test")), 1);
        let timeouts = Timeouts {
            init: 1000,
            idle: 2000,
            keepalive: 3000,
            advertised: 4000,
        };
        mgr.set_timeouts(timeouts);
        assert_eq!(mgr.timeouts(), timeouts);
        mgr.set_max_udp(512);
        assert_eq!(mgr.max_udp(), 512);
        mgr.set_load_balance(false);
        assert!(!mgr.load_balance());
    }

    #[test]
    fn listen_after_shutdown_fails() {
        let mgr = Manager::create(Arc::new(MemContext::new("test")), 1);
        mgr.shutdown();
        let result = mgr.listen_udp("127.0.0.1:0".parse().unwrap(), |_, _| {});
        assert_eq!(result.err(), Some(NetError::ShuttingDown));
    }

    #[test]
    fn destroy_waits_for_last_socket() {
        let mgr = Manager::create(Arc::new(MemContext::new("test")), 2);
        let inner = Arc::clone(&mgr.inner);
        let listener = mgr
            .listen_udp("127.0.0.1:0".parse().unwrap(), |_, _| {})
            .unwrap();
        assert!(inner.live_sockets() > 0);
        let dropper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            drop(listener);
        });
        let started = Instant::now();
        mgr.destroy();
        assert_eq!(inner.live_sockets(), 0);
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert!(started.elapsed() < DESTROY_WAIT);
        dropper.join().unwrap();
    }
}
