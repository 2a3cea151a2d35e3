//! Reference-counted sockets.
//!
//! A socket's shared state ([`SocketInner`]) may be touched from any thread, but its I/O object
//! lives in the owning worker's socket table ([`SocketIo`]) and is only ever used there. Logical
//! references are counted separately from the `Arc` strong count: a listener shares one logical
//! count between its parent and all of its children, and a socket is destroyed only once
//! `!active && closed && references == 0 && active_handles == 0`.

pub(crate) mod handle;
pub(crate) mod listener;
pub(crate) mod request;
pub(crate) mod tcp;
pub(crate) mod tcpdns;
pub(crate) mod udp;

pub use self::handle::{Handle, ResetFn};
pub use self::listener::Listener;

use self::handle::HandleInner;
use self::request::Request;
use crate::errors::{log_failure, NetError, NetResult};
use crate::event::NetEvent;
use crate::manager::ManagerInner;
use crate::quota::{Quota, QuotaGuard};
use crate::stats::counters_for;
use crate::worker::event_loop::{LoopState, TimerKey, TimerSet};
use crate::worker::{LocalWorker, WorkerId};

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam::queue::ArrayQueue;
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;

const HANDLE_STACK_SIZE: usize = 64;
const REQ_STACK_SIZE: usize = 32;
const NO_TOKEN: usize = usize::MAX;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SocketType {
    UdpListener,
    UdpSocket,
    TcpListener,
    TcpSocket,
    TcpDnsListener,
    TcpDnsSocket,
}

impl SocketType {
    pub fn is_udp(&self) -> bool {
        matches!(self, SocketType::UdpListener | SocketType::UdpSocket)
    }

    pub fn is_listener(&self) -> bool {
        matches!(
            self,
            SocketType::UdpListener | SocketType::TcpListener | SocketType::TcpDnsListener
        )
    }

    /// Connection-oriented sockets.
    pub fn is_stream(&self) -> bool {
        matches!(self, SocketType::TcpSocket | SocketType::TcpDnsSocket)
    }
}

/// Receives one datagram, stream chunk or DNS message, or the error that ended reading.
pub type RecvCb = Arc<dyn Fn(&Handle, NetResult<&[u8]>) + Send + Sync>;
/// Called for every accepted connection; an error closes it.
pub type AcceptCb = Arc<dyn Fn(&Handle) -> NetResult<()> + Send + Sync>;
pub type ConnectCb = Box<dyn FnOnce(NetResult<&Handle>) + Send>;
pub type SendCb = Box<dyn FnOnce(&Handle, NetResult<()>) + Send>;

/// Runs on the owning worker after a handle of the socket has been finalized.
pub(crate) type CloseHandleCb = fn(&LocalWorker, &Arc<SocketInner>);

#[derive(Clone, Default)]
pub(crate) struct ListenCallbacks {
    pub(crate) recv: Option<RecvCb>,
    pub(crate) accept: Option<AcceptCb>,
}

#[derive(Default)]
pub(crate) struct SocketOpts {
    pub(crate) client: bool,
    pub(crate) parent: Option<Arc<SocketInner>>,
    pub(crate) server: Option<Arc<SocketInner>>,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) local: Option<SocketAddr>,
    pub(crate) callbacks: ListenCallbacks,
    pub(crate) listen_quota: Option<Arc<Quota>>,
    pub(crate) closehandle_cb: Option<CloseHandleCb>,
}

/* --------------------------------------------------------------------------------- */

pub(crate) struct SocketInner {
    pub(crate) id: u64,
    pub(crate) kind: SocketType,
    pub(crate) tid: WorkerId,
    pub(crate) mgr: Arc<ManagerInner>,
    pub(crate) client: bool,
    pub(crate) parent: Option<Arc<SocketInner>>,
    /// Listener child an accepted connection came from.
    pub(crate) server: Option<Arc<SocketInner>>,
    children: Mutex<Vec<Arc<SocketInner>>>,

    references: AtomicUsize,
    active: AtomicBool,
    closing: AtomicBool,
    closed: AtomicBool,
    destroying: AtomicBool,
    opened: AtomicBool,
    pub(crate) active_handles: AtomicUsize,

    token: AtomicUsize,
    statichandle: Mutex<Option<Weak<HandleInner>>>,
    pub(crate) quota: Mutex<Option<QuotaGuard>>,
    pub(crate) listen_quota: Option<Arc<Quota>>,
    pub(crate) read_timeout: AtomicU32,
    pub(crate) write_timeout: AtomicU32,
    pub(crate) keepalive: AtomicBool,
    addrs: Mutex<(Option<SocketAddr>, Option<SocketAddr>)>,
    pub(crate) callbacks: ListenCallbacks,
    pub(crate) closehandle_cb: Option<CloseHandleCb>,

    pub(crate) inactive_handles: ArrayQueue<Arc<HandleInner>>,
    pub(crate) inactive_reqs: ArrayQueue<Box<Request>>,
}

impl SocketInner {
    pub(crate) fn new(
        mgr: &Arc<ManagerInner>,
        kind: SocketType,
        tid: WorkerId,
        opts: SocketOpts,
    ) -> Arc<SocketInner> {
        let id = mgr.next_socket_id();
        mgr.socket_created();
        log::debug!("Socket {} ({:?}) created on worker {}", id, kind, tid);
        Arc::new(SocketInner {
            id,
            kind,
            tid,
            mgr: Arc::clone(mgr),
            client: opts.client,
            parent: opts.parent,
            server: opts.server,
            children: Mutex::new(vec![]),
            references: AtomicUsize::new(0),
            active: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            destroying: AtomicBool::new(false),
            opened: AtomicBool::new(false),
            active_handles: AtomicUsize::new(0),
            token: AtomicUsize::new(NO_TOKEN),
            statichandle: Mutex::new(None),
            quota: Mutex::new(None),
            listen_quota: opts.listen_quota,
            read_timeout: AtomicU32::new(0),
            write_timeout: AtomicU32::new(0),
            keepalive: AtomicBool::new(false),
            addrs: Mutex::new((opts.peer, opts.local)),
            callbacks: opts.callbacks,
            closehandle_cb: opts.closehandle_cb,
            inactive_handles: ArrayQueue::new(HANDLE_STACK_SIZE),
            inactive_reqs: ArrayQueue::new(REQ_STACK_SIZE),
        })
    }

    /// The socket holding the logical reference count.
    #[inline]
    pub(crate) fn root(self: &Arc<Self>) -> &Arc<SocketInner> {
        match &self.parent {
            Some(parent) => parent,
            None => self,
        }
    }

    pub(crate) fn children(&self) -> Vec<Arc<SocketInner>> {
        self.children.lock().clone()
    }

    pub(crate) fn set_children(&self, children: Vec<Arc<SocketInner>>) {
        *self.children.lock() = children;
    }

    #[inline]
    pub(crate) fn references(&self) -> usize {
        self.references.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroying.load(Ordering::Acquire)
    }

    /// Whether new operations may be started on the socket.
    #[inline]
    pub(crate) fn is_usable(&self) -> bool {
        self.is_active() && !self.is_closing() && !self.mgr.is_closing()
    }

    #[inline]
    pub(crate) fn token(&self) -> usize {
        self.token.load(Ordering::Acquire)
    }

    pub(crate) fn peer(&self) -> Option<SocketAddr> {
        self.addrs.lock().0
    }

    pub(crate) fn local(&self) -> Option<SocketAddr> {
        self.addrs.lock().1
    }

    pub(crate) fn set_addrs(&self, peer: Option<SocketAddr>, local: Option<SocketAddr>) {
        let mut addrs = self.addrs.lock();
        if peer.is_some() {
            addrs.0 = peer;
        }
        if local.is_some() {
            addrs.1 = local;
        }
    }

    /// Whether handles of this socket are tracked as its single current handle.
    pub(crate) fn uses_statichandle(&self) -> bool {
        match self.kind {
            SocketType::TcpSocket => true,
            SocketType::UdpSocket | SocketType::TcpDnsSocket => self.client,
            _ => false,
        }
    }

    /// Records `handle` as the current handle without taking a reference on it.
    pub(crate) fn set_statichandle(&self, handle: &Arc<HandleInner>) {
        *self.statichandle.lock() = Some(Arc::downgrade(handle));
    }

    pub(crate) fn clear_statichandle(&self, handle: &Arc<HandleInner>) {
        let mut current = self.statichandle.lock();
        if current
            .as_ref()
            .map_or(false, |w| std::ptr::eq(w.as_ptr(), Arc::as_ptr(handle)))
        {
            *current = None;
        }
    }

    /// Attaches to the current handle, if it is still live.
    pub(crate) fn statichandle(&self) -> Option<Handle> {
        let inner = self.statichandle.lock().as_ref()?.upgrade()?;
        Handle::attach_live(inner)
    }

    /// Timeout applied to reads on a server connection once it has seen its first message.
    pub(crate) fn established_timeout(&self) -> u32 {
        let timeouts = self.mgr.timeouts();
        if self.keepalive.load(Ordering::Relaxed) {
            timeouts.keepalive
        } else {
            timeouts.idle
        }
    }

    fn drain_free_lists(&self) {
        while self.inactive_handles.pop().is_some() {}
        while self.inactive_reqs.pop().is_some() {}
    }
}

impl fmt::Debug for SocketInner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("tid", &self.tid)
            .field("references", &self.references())
            .field("active", &self.is_active())
            .field("closed", &self.is_closed())
            .field("active_handles", &self.active_handles.load(Ordering::Relaxed))
            .finish()
    }
}

/* --------------------------------------------------------------------------------- */

/// A counted reference to a socket. Cloning attaches, dropping detaches.
pub(crate) struct Socket(Arc<SocketInner>);

impl Socket {
    pub(crate) fn attach(inner: &Arc<SocketInner>) -> Socket {
        inner.root().references.fetch_add(1, Ordering::AcqRel);
        Socket(Arc::clone(inner))
    }

    pub(crate) fn inner(&self) -> &Arc<SocketInner> {
        &self.0
    }
}

impl Clone for Socket {
    fn clone(&self) -> Self {
        Socket::attach(&self.0)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        let root = self.0.root();
        if root.references.fetch_sub(1, Ordering::AcqRel) == 1 {
            prep_destroy(root);
        }
    }
}

impl Deref for Socket {
    type Target = SocketInner;

    fn deref(&self) -> &SocketInner {
        &self.0
    }
}

/* --------------------------------------------------------------------------------- */

/// The final external reference to `sock` is gone.
///
/// Clears `active` on the socket and its children, then either starts closing it or, if it is
/// already closed, checks whether it can be destroyed.
pub(crate) fn prep_destroy(sock: &Arc<SocketInner>) {
    sock.active.store(false, Ordering::Release);
    for child in sock.children() {
        child.active.store(false, Ordering::Release);
    }
    if !sock.is_closed() {
        if sock.kind.is_listener() && sock.parent.is_none() {
            listener::stop_listening(sock);
        } else {
            close(sock);
        }
        return;
    }
    maybe_destroy(sock);
}

/// Destroys `sock` if nothing references it any more. Safe to call any number of times.
pub(crate) fn maybe_destroy(sock: &Arc<SocketInner>) {
    if let Some(parent) = &sock.parent {
        // children go away with their parent
        maybe_destroy(parent);
        return;
    }
    if sock.is_active() || !sock.is_closed() || sock.is_destroyed() {
        return;
    }
    if sock.references() != 0 {
        return;
    }
    let children = sock.children();
    let active_handles = sock.active_handles.load(Ordering::Acquire)
        + children
            .iter()
            .map(|c| c.active_handles.load(Ordering::Acquire))
            .sum::<usize>();
    if active_handles != 0 || children.iter().any(|c| !c.is_closed()) {
        return;
    }
    if sock.destroying.swap(true, Ordering::AcqRel) {
        return;
    }
    destroy(sock);
}

fn destroy(sock: &Arc<SocketInner>) {
    log::debug!("Socket {} ({:?}) destroyed", sock.id, sock.kind);
    let children = std::mem::take(&mut *sock.children.lock());
    for child in children {
        child.destroying.store(true, Ordering::Release);
        child.drain_free_lists();
        sock.mgr.socket_destroyed();
    }
    sock.drain_free_lists();
    sock.quota.lock().take();
    sock.statichandle.lock().take();
    sock.mgr.socket_destroyed();
}

/// Closes `sock` on its owning worker.
pub(crate) fn close(sock: &Arc<SocketInner>) {
    sock.mgr
        .maybe_enqueue(sock.tid, NetEvent::Close(Arc::clone(sock)));
}

/// Releases the I/O object of `sock`. Must run on the owning worker; repeated calls are no-ops.
///
/// Pending operations complete with `err`.
pub(crate) fn close_io(lw: &LocalWorker, sock: &Arc<SocketInner>, err: NetError) {
    if sock.closing.swap(true, Ordering::AcqRel) {
        return;
    }
    let entry = {
        let mut st = lw.state.borrow_mut();
        let st = &mut *st;
        let token = sock.token();
        match st.sockets.get(token) {
            Some(e) if Arc::ptr_eq(&e.sock, sock) => {
                let mut entry = st.sockets.remove(token);
                if let Err(e) = entry.io.deregister(st.poll.registry()) {
                    log::debug!("Failed to deregister socket {}: {}", sock.id, e);
                }
                Some(entry)
            }
            _ => None,
        }
    };
    if let Some(entry) = entry {
        teardown_entry(lw, entry, err);
    }
    mark_closed(sock);
}

/// Closes `sock` with a connection reset instead of an orderly shutdown.
pub(crate) fn reset(lw: &LocalWorker, sock: &Arc<SocketInner>, err: NetError) {
    {
        let mut st = lw.state.borrow_mut();
        if let Some(entry) = entry_for(&mut st.sockets, sock) {
            entry.reset_on_close = true;
        }
    }
    close_io(lw, sock, err);
}

/// Closes a socket whose worker has exited and whose I/O object is already gone.
pub(crate) fn close_offline(sock: &Arc<SocketInner>) {
    sock.closing.store(true, Ordering::Release);
    mark_closed(sock);
}

fn mark_closed(sock: &Arc<SocketInner>) {
    if sock.closed.swap(true, Ordering::AcqRel) {
        maybe_destroy(sock);
        return;
    }
    if sock.opened.swap(false, Ordering::AcqRel) {
        let counters = counters_for(sock.kind);
        sock.mgr.stats.inc(counters.close);
        sock.mgr.stats.dec(counters.active);
    }
    log::debug!("Socket {} ({:?}) closed", sock.id, sock.kind);
    if let Some(parent) = &sock.parent {
        if parent.children().iter().all(|c| c.is_closed()) {
            parent.closing.store(true, Ordering::Release);
            if !parent.closed.swap(true, Ordering::AcqRel) {
                log::debug!("Listener {} ({:?}) closed", parent.id, parent.kind);
            }
        }
    }
    maybe_destroy(sock);
}

/// Fails every operation still attached to a removed socket table entry.
fn teardown_entry(lw: &LocalWorker, entry: SocketIo, err: NetError) {
    let SocketIo {
        io,
        reading,
        recv_cb,
        recv_handle,
        connect_req,
        write_queue,
        reset_on_close,
        ..
    } = entry;
    if reset_on_close {
        if let Io::Stream(stream) = &io {
            tcp::set_reset_on_close(stream);
        }
    }
    drop(io);

    if let Some(req) = connect_req {
        let err = err.clone();
        lw.defer(move || req.complete_connect(Err(err)));
    }
    for req in write_queue {
        let err = err.clone();
        lw.defer(move || req.complete_send(Err(err)));
    }
    match (reading, recv_cb, recv_handle) {
        (true, Some(cb), Some(handle)) => lw.defer(move || cb(&handle, Err(err))),
        (_, _, handle) => lw.defer(move || drop(handle)),
    }
}

/* --------------------------------------------------------------------------------- */

/// The worker-local half of a socket.
pub(crate) struct SocketIo {
    pub(crate) sock: Arc<SocketInner>,
    pub(crate) io: Io,
    pub(crate) reading: bool,
    pub(crate) read_paused: bool,
    pub(crate) recv_cb: Option<RecvCb>,
    /// Keeps the socket referenced while a read is outstanding.
    pub(crate) recv_handle: Option<Handle>,
    pub(crate) read_timer: Option<u64>,
    pub(crate) write_timer: Option<u64>,
    pub(crate) connect_req: Option<Box<Request>>,
    pub(crate) write_queue: VecDeque<Box<Request>>,
    pub(crate) reset_on_close: bool,
    /// Unconsumed inbound bytes of a TCP-DNS connection.
    pub(crate) framebuf: Vec<u8>,
    /// A server connection that has not yet seen its first message.
    pub(crate) awaiting_first: bool,
    /// Reading is paused because too many pipelined requests are outstanding.
    pub(crate) pipeline_paused: bool,
}

impl SocketIo {
    fn new(sock: Arc<SocketInner>, io: Io) -> Self {
        SocketIo {
            sock,
            io,
            reading: false,
            read_paused: false,
            recv_cb: None,
            recv_handle: None,
            read_timer: None,
            write_timer: None,
            connect_req: None,
            write_queue: VecDeque::new(),
            reset_on_close: false,
            framebuf: vec![],
            awaiting_first: false,
            pipeline_paused: false,
        }
    }

    /// (Re)arms the read timer from the socket's current read timeout.
    pub(crate) fn start_read_timer(&mut self, timers: &mut TimerSet, token: usize) {
        if let Some(old) = self.read_timer.take() {
            timers.disarm(old);
        }
        let ms = self.sock.read_timeout.load(Ordering::Relaxed);
        self.read_timer = if ms == 0 {
            None
        } else {
            Some(timers.arm(Duration::from_millis(ms as u64), |gen| TimerKey::Read {
                token,
                gen,
            }))
        };
    }

    pub(crate) fn start_write_timer(&mut self, timers: &mut TimerSet, token: usize) {
        if let Some(old) = self.write_timer.take() {
            timers.disarm(old);
        }
        let ms = self.sock.write_timeout.load(Ordering::Relaxed);
        self.write_timer = if ms == 0 {
            None
        } else {
            Some(timers.arm(Duration::from_millis(ms as u64), |gen| TimerKey::Write {
                token,
                gen,
            }))
        };
    }
}

pub(crate) enum Io {
    Udp(UdpSocket),
    Listener(TcpListener),
    Stream(TcpStream),
}

impl Io {
    fn interest(&self) -> Interest {
        match self {
            Io::Listener(_) => Interest::READABLE,
            _ => Interest::READABLE | Interest::WRITABLE,
        }
    }

    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let interest = self.interest();
        match self {
            Io::Udp(s) => registry.register(s, token, interest),
            Io::Listener(s) => registry.register(s, token, interest),
            Io::Stream(s) => registry.register(s, token, interest),
        }
    }

    /// Re-registering makes the reactor report readiness that was already consumed, which is how
    /// reading resumes on an edge-triggered registration.
    pub(crate) fn reregister(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let interest = self.interest();
        match self {
            Io::Udp(s) => registry.reregister(s, token, interest),
            Io::Listener(s) => registry.reregister(s, token, interest),
            Io::Stream(s) => registry.reregister(s, token, interest),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Io::Udp(s) => registry.deregister(s),
            Io::Listener(s) => registry.deregister(s),
            Io::Stream(s) => registry.deregister(s),
        }
    }
}

/// Looks up the table entry of `sock`, ignoring a reused token.
pub(crate) fn entry_for<'a>(
    sockets: &'a mut slab::Slab<SocketIo>,
    sock: &Arc<SocketInner>,
) -> Option<&'a mut SocketIo> {
    sockets
        .get_mut(sock.token())
        .filter(|entry| Arc::ptr_eq(&entry.sock, sock))
}

/// Adds `sock` to the worker's socket table and reactor.
pub(crate) fn register(lw: &LocalWorker, sock: &Arc<SocketInner>, mut io: Io) -> NetResult<usize> {
    let mut st = lw.state.borrow_mut();
    let st = &mut *st;
    let entry = st.sockets.vacant_entry();
    let token = entry.key();
    io.register(st.poll.registry(), Token(token))?;
    entry.insert(SocketIo::new(Arc::clone(sock), io));
    sock.token.store(token, Ordering::Release);
    if !sock.opened.swap(true, Ordering::AcqRel) {
        let counters = counters_for(sock.kind);
        sock.mgr.stats.inc(counters.open);
        sock.mgr.stats.inc(counters.active);
    }
    Ok(token)
}

/// Routes a readiness event to the socket's transport.
/// The part of a reactor event the transports act on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Readiness {
    pub(crate) token: usize,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    /// Peer hung up or the socket has a pending error.
    pub(crate) closed: bool,
}

impl From<&mio::event::Event> for Readiness {
    fn from(event: &mio::event::Event) -> Self {
        Readiness {
            token: event.token().0,
            readable: event.is_readable(),
            writable: event.is_writable(),
            closed: event.is_read_closed() || event.is_error(),
        }
    }
}

pub(crate) fn dispatch_io(lw: &LocalWorker, ready: Readiness) {
    let sock = match lw.state.borrow().sockets.get(ready.token) {
        Some(entry) => Arc::clone(&entry.sock),
        None => return,
    };
    match sock.kind {
        SocketType::UdpListener | SocketType::UdpSocket => {
            udp::on_ready(lw, &sock, ready.readable, ready.writable)
        }
        SocketType::TcpListener | SocketType::TcpDnsListener => tcp::accept_ready(lw, &sock),
        SocketType::TcpSocket | SocketType::TcpDnsSocket => tcp::on_ready(lw, &sock, ready),
    }
}

/* --------------------------------------------------------------------------------- */

/// Starts delivering inbound data on `handle`'s socket to `cb`.
pub(crate) fn start_read(lw: &LocalWorker, handle: Handle, cb: RecvCb) {
    let sock = Arc::clone(handle.socket());
    if !sock.is_usable() || sock.kind.is_listener() {
        lw.defer(move || cb(&handle, Err(NetError::Canceled)));
        return;
    }
    let previous = {
        let mut st = lw.state.borrow_mut();
        let LoopState {
            poll,
            sockets,
            timers,
            ..
        } = &mut *st;
        let token = sock.token();
        let entry = match entry_for(sockets, &sock) {
            Some(entry) => entry,
            None => {
                drop(st);
                lw.defer(move || cb(&handle, Err(NetError::Canceled)));
                return;
            }
        };
        entry.recv_cb = Some(cb);
        let previous = entry.recv_handle.replace(handle);
        entry.reading = true;
        entry.read_paused = false;
        entry.start_read_timer(timers, token);
        if let Err(e) = entry.io.reregister(poll.registry(), Token(token)) {
            log::debug!("Failed to rearm socket {}: {}", sock.id, e);
        }
        previous
    };
    drop(previous);
    if sock.kind == SocketType::TcpDnsSocket {
        // complete messages may already be buffered
        tcpdns::process_buffer(lw, &sock);
    }
}

/// Stops reading and reports `err` to the read callback. Stream sockets are closed afterwards.
pub(crate) fn failed_read(lw: &LocalWorker, sock: &Arc<SocketInner>, err: NetError) {
    let taken = {
        let mut st = lw.state.borrow_mut();
        entry_for(&mut st.sockets, sock).map(|entry| {
            let was_reading = entry.reading;
            entry.reading = false;
            entry.read_timer = None;
            (was_reading, entry.recv_cb.take(), entry.recv_handle.take())
        })
    };
    if !matches!(err, NetError::Canceled | NetError::ShuttingDown) {
        sock.mgr.stats.inc(counters_for(sock.kind).recv_fail);
    }
    if let Some((was_reading, cb, handle)) = taken {
        if let (true, Some(cb), Some(handle)) = (was_reading, cb, handle.as_ref()) {
            cb(handle, Err(err.clone()));
        }
        drop(handle);
    }
    if sock.kind.is_stream() {
        log_failure(&format!("Socket {} read failed", sock.id), &err);
        close_io(lw, sock, err);
    }
}

pub(crate) fn cancel_read(lw: &LocalWorker, handle: &Handle) {
    let sock = handle.socket();
    if sock.kind.is_stream() {
        failed_read(lw, sock, NetError::Canceled);
        return;
    }
    let taken = {
        let mut st = lw.state.borrow_mut();
        entry_for(&mut st.sockets, sock).and_then(|entry| {
            if !entry.reading {
                return None;
            }
            entry.reading = false;
            entry.read_timer = None;
            Some((entry.recv_cb.take(), entry.recv_handle.take()))
        })
    };
    if let Some((Some(cb), Some(h))) = taken {
        cb(&h, Err(NetError::Canceled));
    }
}

pub(crate) fn pause_read(lw: &LocalWorker, handle: &Handle) {
    let mut st = lw.state.borrow_mut();
    if let Some(entry) = entry_for(&mut st.sockets, handle.socket()) {
        entry.read_paused = true;
        entry.read_timer = None;
    }
}

pub(crate) fn resume_read(lw: &LocalWorker, handle: &Handle) {
    let sock = handle.socket();
    {
        let mut st = lw.state.borrow_mut();
        let LoopState {
            poll,
            sockets,
            timers,
            ..
        } = &mut *st;
        let token = sock.token();
        let entry = match entry_for(sockets, sock) {
            Some(entry) if entry.read_paused => entry,
            _ => return,
        };
        entry.read_paused = false;
        if entry.reading {
            entry.start_read_timer(timers, token);
        }
        if let Err(e) = entry.io.reregister(poll.registry(), Token(token)) {
            log::debug!("Failed to rearm socket {}: {}", sock.id, e);
        }
    }
    if sock.kind == SocketType::TcpDnsSocket {
        tcpdns::process_buffer(lw, sock);
    }
}

/// Applies a changed read timeout to an outstanding read.
pub(crate) fn restart_read_timer(lw: &LocalWorker, sock: &Arc<SocketInner>) {
    let mut st = lw.state.borrow_mut();
    let LoopState {
        sockets, timers, ..
    } = &mut *st;
    let token = sock.token();
    if let Some(entry) = entry_for(sockets, sock) {
        if entry.reading && !entry.read_paused {
            entry.start_read_timer(timers, token);
        }
    }
}

pub(crate) fn on_read_timeout(lw: &LocalWorker, token: usize, gen: u64) {
    let (sock, connecting) = {
        let mut st = lw.state.borrow_mut();
        let entry = match st.sockets.get_mut(token) {
            Some(entry) if entry.read_timer == Some(gen) => entry,
            _ => return,
        };
        entry.read_timer = None;
        (Arc::clone(&entry.sock), entry.connect_req.is_some())
    };
    if connecting {
        tcp::fail_connect(lw, &sock, NetError::TimedOut);
        return;
    }
    if !sock.client {
        failed_read(lw, &sock, NetError::TimedOut);
        return;
    }

    // clients may recover by restarting the timer from the callback
    let target = {
        let mut st = lw.state.borrow_mut();
        entry_for(&mut st.sockets, &sock)
            .filter(|entry| entry.reading)
            .and_then(|entry| Some((entry.recv_cb.clone()?, entry.recv_handle.clone()?)))
    };
    let (cb, handle) = match target {
        Some(target) => target,
        None => return,
    };
    cb(&handle, Err(NetError::TimedOut));
    drop(handle);

    let abandoned = {
        let mut st = lw.state.borrow_mut();
        entry_for(&mut st.sockets, &sock).and_then(|entry| {
            if entry.read_timer.is_some() || !entry.reading {
                return None;
            }
            entry.reading = false;
            Some((entry.recv_cb.take(), entry.recv_handle.take()))
        })
    };
    if abandoned.is_some() {
        drop(abandoned);
        if sock.kind.is_stream() {
            close_io(lw, &sock, NetError::TimedOut);
        }
    }
}

pub(crate) fn on_write_timeout(lw: &LocalWorker, token: usize, gen: u64) {
    let sock = {
        let mut st = lw.state.borrow_mut();
        match st.sockets.get_mut(token) {
            Some(entry) if entry.write_timer == Some(gen) => {
                entry.write_timer = None;
                Arc::clone(&entry.sock)
            }
            _ => return,
        }
    };
    log::debug!("Socket {} write timed out", sock.id);
    reset(lw, &sock, NetError::TimedOut);
}

/// Worker side of a send. Completion is always reported asynchronously.
pub(crate) fn send(lw: &LocalWorker, req: Box<Request>) {
    let sock = Arc::clone(req.socket());
    if !sock.is_usable() {
        lw.defer(move || req.complete_send(Err(NetError::Canceled)));
        return;
    }
    match sock.kind {
        SocketType::UdpSocket | SocketType::UdpListener => udp::send(lw, req),
        SocketType::TcpSocket | SocketType::TcpDnsSocket => tcp::send(lw, req),
        _ => lw.defer(move || req.complete_send(Err(NetError::NotConnected))),
    }
}

/// Starts an outbound connection on a worker picked for the caller.
pub(crate) fn connect(
    mgr: &Arc<ManagerInner>,
    kind: SocketType,
    local: Option<SocketAddr>,
    peer: SocketAddr,
    cb: ConnectCb,
    timeout: u32,
) {
    let tid = mgr.current_or_next_worker();
    let sock = SocketInner::new(
        mgr,
        kind,
        tid,
        SocketOpts {
            client: true,
            peer: Some(peer),
            local,
            ..Default::default()
        },
    );
    sock.read_timeout.store(timeout, Ordering::Relaxed);

    let mut req = Request::get(&sock);
    req.set_connect_cb(cb);
    req.peer = Some(peer);
    req.local = local;

    if mgr.is_closing() {
        mgr.enqueue(
            tid,
            NetEvent::ConnectCb {
                req,
                result: Err(NetError::ShuttingDown),
            },
        );
        return;
    }
    let event = match kind {
        SocketType::UdpSocket => NetEvent::UdpConnect(req),
        _ => NetEvent::TcpConnect(req),
    };
    mgr.maybe_enqueue(tid, event);
}

/// Forces every socket on this worker down.
///
/// Listener children stop listening, pending connects and reads fail with `ShuttingDown`, TCP
/// connections are reset and everything else is closed gracefully.
pub(crate) fn shutdown_walk(lw: &LocalWorker) {
    let socks: Vec<Arc<SocketInner>> = lw
        .state
        .borrow()
        .sockets
        .iter()
        .map(|(_, entry)| Arc::clone(&entry.sock))
        .collect();
    log::debug!("Worker {} shutting down {} sockets", lw.id(), socks.len());
    for sock in socks {
        match sock.kind {
            SocketType::TcpSocket => reset(lw, &sock, NetError::ShuttingDown),
            _ => close_io(lw, &sock, NetError::ShuttingDown),
        }
    }
}

/// Closes every socket left on an exiting worker.
pub(crate) fn teardown_all(lw: &LocalWorker) {
    let entries: Vec<SocketIo> = lw.state.borrow_mut().sockets.drain().collect();
    for entry in entries {
        let sock = Arc::clone(&entry.sock);
        sock.closing.store(true, Ordering::Release);
        teardown_entry(lw, entry, NetError::ShuttingDown);
        mark_closed(&sock);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::memory::MemContext;
    use crate::Manager;
    use proptest::prelude::*;
    use std::sync::OnceLock;

    /// Polls `cond` until it holds, for work completing on a worker.
    pub(crate) fn wait_for(cond: impl Fn() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(cond(), "condition not reached");
    }

    pub(crate) fn test_manager() -> &'static Manager {
        static MANAGER: OnceLock<Manager> = OnceLock::new();
        MANAGER.get_or_init(|| Manager::create(Arc::new(MemContext::new("test")), 1))
    }

    /// A socket that never opened an I/O object and is already closed.
    fn closed_socket(mgr: &Manager) -> Arc<SocketInner> {
        let sock = SocketInner::new(
            mgr.inner(),
            SocketType::UdpSocket,
            WorkerId(0),
            SocketOpts::default(),
        );
        sock.closing.store(true, Ordering::Release);
        sock.closed.store(true, Ordering::Release);
        sock
    }

    #[derive(Debug, Clone)]
    enum Op {
        Attach,
        Detach,
        HandleGet,
        HandleRelease,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Attach),
            Just(Op::Detach),
            Just(Op::HandleGet),
            Just(Op::HandleRelease),
        ]
    }

    proptest! {
        #[test]
        fn freed_only_when_unreferenced(ops in proptest::collection::vec(op(), 1..64)) {
            let mgr = test_manager();
            let sock = closed_socket(mgr);
            let mut refs = vec![Socket::attach(&sock)];
            let mut handles: Vec<Socket> = vec![];

            for op in ops {
                match op {
                    Op::Attach => refs.push(Socket::attach(&sock)),
                    Op::Detach => { refs.pop(); }
                    Op::HandleGet => {
                        sock.active_handles.fetch_add(1, Ordering::AcqRel);
                        handles.push(Socket::attach(&sock));
                    }
                    Op::HandleRelease => {
                        if let Some(held) = handles.pop() {
                            sock.active_handles.fetch_sub(1, Ordering::AcqRel);
                            drop(held);
                        }
                    }
                }
                let unreferenced = refs.is_empty() && handles.is_empty();
                prop_assert_eq!(sock.is_destroyed(), unreferenced);
                if unreferenced {
                    break;
                }
            }
            while let Some(held) = handles.pop() {
                sock.active_handles.fetch_sub(1, Ordering::AcqRel);
                drop(held);
            }
            refs.clear();
            prop_assert!(sock.is_destroyed());
        }
    }

    #[test]
    fn destroy_waits_for_active_handles() {
        let mgr = test_manager();
        let sock = closed_socket(mgr);
        let held = Socket::attach(&sock);
        sock.active_handles.fetch_add(1, Ordering::AcqRel);
        drop(held);
        // unreferenced but a handle is still live
        assert!(!sock.is_destroyed());
        sock.active_handles.fetch_sub(1, Ordering::AcqRel);
        maybe_destroy(&sock);
        assert!(sock.is_destroyed());
    }

    #[test]
    fn repeated_close_frees_once() {
        let mgr = test_manager();
        let before = mgr.inner().live_sockets();
        let sock = SocketInner::new(
            mgr.inner(),
            SocketType::UdpSocket,
            WorkerId(0),
            SocketOpts::default(),
        );
        assert_eq!(mgr.inner().live_sockets(), before + 1);
        let held = Socket::attach(&sock);
        close_offline(&sock);
        close_offline(&sock);
        maybe_destroy(&sock);
        assert!(!sock.is_destroyed());
        drop(held);
        assert!(sock.is_destroyed());
        close_offline(&sock);
        maybe_destroy(&sock);
        assert_eq!(mgr.inner().live_sockets(), before);
    }

    #[test]
    fn children_share_parent_references() {
        let mgr = test_manager();
        let parent = SocketInner::new(
            mgr.inner(),
            SocketType::UdpListener,
            WorkerId(0),
            SocketOpts::default(),
        );
        let children: Vec<_> = (0..2)
            .map(|_| {
                SocketInner::new(
                    mgr.inner(),
                    SocketType::UdpListener,
                    WorkerId(0),
                    SocketOpts {
                        parent: Some(Arc::clone(&parent)),
                        ..Default::default()
                    },
                )
            })
            .collect();
        parent.set_children(children.clone());

        let a = Socket::attach(&children[0]);
        let b = Socket::attach(&children[1]);
        assert_eq!(parent.references(), 2);
        assert_eq!(children[0].references(), 0);

        for child in &children {
            close_offline(child);
        }
        assert!(parent.is_closed());
        drop(a);
        assert!(!parent.is_destroyed());
        drop(b);
        assert!(parent.is_destroyed());
        assert!(children.iter().all(|c| c.is_destroyed()));
    }
}
