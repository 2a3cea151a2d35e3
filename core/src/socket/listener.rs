//! Listening sockets.
//!
//! A listener is a parent socket with one child per worker. The parent never performs I/O; each
//! child owns a bound socket on its worker. With load balancing enabled every child binds its own
//! `SO_REUSEPORT` socket and the kernel spreads traffic across them, otherwise the children share
//! one socket.

use super::{close_io, register, Io, ListenCallbacks, Socket, SocketInner, SocketOpts, SocketType};
use crate::errors::{log_failure, NetError, NetResult};
use crate::event::NetEvent;
use crate::manager::ManagerInner;
use crate::quota::Quota;
use crate::socket::{close_offline, tcp, udp};
use crate::stats::counters_for;
use crate::worker::{LocalWorker, WorkerId};

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// A socket bound by the caller, waiting to be registered on its child's worker.
pub(crate) enum PendingIo {
    Udp(std::net::UdpSocket),
    Tcp(std::net::TcpListener),
}

impl PendingIo {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            PendingIo::Udp(s) => s.local_addr(),
            PendingIo::Tcp(s) => s.local_addr(),
        }
    }

    fn try_clone(&self) -> io::Result<PendingIo> {
        match self {
            PendingIo::Udp(s) => s.try_clone().map(PendingIo::Udp),
            PendingIo::Tcp(s) => s.try_clone().map(PendingIo::Tcp),
        }
    }
}

/// A running listener. Dropping it stops listening.
pub struct Listener {
    sock: Socket,
}

impl Listener {
    /// Stops accepting new traffic. Connections already accepted are not affected.
    ///
    /// Asynchronous and idempotent.
    pub fn stop_listening(&self) {
        stop_listening(self.sock.inner());
    }

    /// Bound address, with the port resolved if `0` was requested.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.sock.local()
    }

    pub fn socket_type(&self) -> SocketType {
        self.sock.kind
    }

    /// Number of per-worker child sockets.
    pub fn nchildren(&self) -> usize {
        self.sock.children().len()
    }

    /// Whether every child has closed.
    pub fn is_closed(&self) -> bool {
        self.sock.is_closed()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop_listening();
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Listener")
            .field("kind", &self.sock.kind)
            .field("local", &self.local_addr())
            .field("children", &self.nchildren())
            .finish()
    }
}

/* --------------------------------------------------------------------------------- */

/// Binds a listener on `addr` and starts one child per worker.
///
/// Sockets are bound on the calling thread so that bind errors are reported here; the children
/// start listening asynchronously on their workers.
pub(crate) fn listen(
    mgr: &Arc<ManagerInner>,
    kind: SocketType,
    addr: SocketAddr,
    callbacks: ListenCallbacks,
    quota: Option<Arc<Quota>>,
) -> NetResult<Listener> {
    if mgr.is_closing() {
        return Err(NetError::ShuttingDown);
    }
    let nworkers = mgr.nworkers();
    let parent = SocketInner::new(
        mgr,
        kind,
        mgr.current_or_next_worker(),
        SocketOpts {
            local: Some(addr),
            callbacks: callbacks.clone(),
            listen_quota: quota.clone(),
            ..Default::default()
        },
    );
    let listener = Listener {
        sock: Socket::attach(&parent),
    };

    let ios = match bind_all(mgr, kind, addr, nworkers) {
        Ok(ios) => ios,
        Err(e) => {
            mgr.stats.inc(counters_for(kind).bind_fail);
            let err = NetError::from(e);
            log_failure(&format!("Failed to bind {:?} on {}", kind, addr), &err);
            close_offline(&parent);
            return Err(err);
        }
    };
    let local = ios.first().and_then(|io| io.local_addr().ok());
    parent.set_addrs(None, local);

    let children: Vec<_> = (0..nworkers)
        .map(|i| {
            SocketInner::new(
                mgr,
                kind,
                WorkerId(i as u32),
                SocketOpts {
                    parent: Some(Arc::clone(&parent)),
                    local,
                    callbacks: callbacks.clone(),
                    listen_quota: quota.clone(),
                    ..Default::default()
                },
            )
        })
        .collect();
    parent.set_children(children.clone());
    log::debug!(
        "Listening on {:?} ({:?}, {} children)",
        local,
        kind,
        children.len()
    );
    for (child, io) in children.into_iter().zip(ios) {
        mgr.maybe_enqueue(child.tid, NetEvent::Listen { sock: child, io });
    }
    Ok(listener)
}

/// One bound socket per worker with load balancing, or one socket shared by all of them.
fn bind_all(
    mgr: &ManagerInner,
    kind: SocketType,
    addr: SocketAddr,
    nworkers: usize,
) -> io::Result<Vec<PendingIo>> {
    let load_balance = mgr.load_balance();
    let first = bind_one(mgr, kind, addr, load_balance)?;
    // a wildcard port is resolved by the first bind
    let addr = first.local_addr()?;
    let mut ios = Vec::with_capacity(nworkers);
    for _ in 1..nworkers {
        let io = if load_balance {
            bind_one(mgr, kind, addr, true)?
        } else {
            first.try_clone()?
        };
        ios.push(io);
    }
    ios.insert(0, first);
    Ok(ios)
}

fn bind_one(
    mgr: &ManagerInner,
    kind: SocketType,
    addr: SocketAddr,
    reuse_port: bool,
) -> io::Result<PendingIo> {
    match kind {
        SocketType::UdpListener => udp::bind_socket(mgr, addr, reuse_port).map(PendingIo::Udp),
        _ => tcp::bind_listener(addr, reuse_port, mgr.tcp.backlog).map(PendingIo::Tcp),
    }
}

/// Registers a listener child on its worker.
pub(crate) fn start_child(lw: &LocalWorker, child: &Arc<SocketInner>, io: PendingIo) {
    if child.is_closing() {
        return;
    }
    let io = match io {
        PendingIo::Udp(s) => Io::Udp(mio::net::UdpSocket::from_std(s)),
        PendingIo::Tcp(s) => Io::Listener(mio::net::TcpListener::from_std(s)),
    };
    match register(lw, child, io) {
        Ok(_) => {
            if child.kind == SocketType::UdpListener {
                udp::start_listening(lw, child);
            }
            log::debug!(
                "Worker {} listening on {:?} ({:?})",
                lw.id(),
                child.local(),
                child.kind
            );
        }
        Err(e) => {
            child
                .mgr
                .stats
                .inc(counters_for(child.kind).open_fail);
            log_failure(&format!("Worker {} failed to listen", lw.id()), &e);
            close_io(lw, child, e);
        }
    }
}

/// Starts stopping every child of `parent`. Idempotent.
pub(crate) fn stop_listening(parent: &Arc<SocketInner>) {
    if parent.closing.swap(true, Ordering::AcqRel) {
        return;
    }
    let children = parent.children();
    if children.is_empty() {
        close_offline(parent);
        return;
    }
    for child in children {
        parent
            .mgr
            .maybe_enqueue(child.tid, NetEvent::StopListening(child));
    }
}

pub(crate) fn stop_child(lw: &LocalWorker, child: &Arc<SocketInner>) {
    close_io(lw, child, NetError::Canceled);
}
