//! Handles: the application's view of a socket.

use super::{RecvCb, Socket, SocketInner, SocketType};
use crate::errors::{NetError, NetResult};
use crate::event::NetEvent;
use crate::socket::request::Request;
use crate::worker::{current_for, LocalWorker, WorkerId};

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Run on the attached data when the last reference to a handle goes away.
pub type ResetFn = Box<dyn FnMut(&mut (dyn Any + Send)) + Send>;

pub(crate) struct HandleInner {
    /// Handles are recycled only through the free list of this socket.
    sock: Arc<SocketInner>,
    references: AtomicUsize,
    state: Mutex<HandleState>,
}

#[derive(Default)]
struct HandleState {
    attached: Option<Socket>,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
    opaque: Option<Box<dyn Any + Send>>,
    doreset: Option<ResetFn>,
}

/// A counted reference to a socket as seen by the application.
///
/// Cloning a handle attaches to it and dropping detaches. Keeping any handle alive keeps its
/// socket alive.
pub struct Handle {
    inner: Arc<HandleInner>,
}

impl Handle {
    /// Takes a handle from the socket's free list, or allocates one.
    pub(crate) fn get(
        sock: &Arc<SocketInner>,
        peer: Option<SocketAddr>,
        local: Option<SocketAddr>,
    ) -> Handle {
        let inner = sock.inactive_handles.pop().unwrap_or_else(|| {
            Arc::new(HandleInner {
                sock: Arc::clone(sock),
                references: AtomicUsize::new(0),
                state: Mutex::new(HandleState::default()),
            })
        });
        {
            let mut state = inner.state.lock();
            state.attached = Some(Socket::attach(sock));
            state.peer = peer.or_else(|| sock.peer());
            state.local = local.or_else(|| sock.local());
        }
        inner.references.store(1, Ordering::Release);
        sock.active_handles.fetch_add(1, Ordering::AcqRel);
        if sock.uses_statichandle() {
            sock.set_statichandle(&inner);
        }
        Handle { inner }
    }

    /// Attaches to a handle found through a weak pointer, unless it is already being released.
    pub(crate) fn attach_live(inner: Arc<HandleInner>) -> Option<Handle> {
        let mut current = inner.references.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return None;
            }
            match inner.references.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(Handle { inner }),
                Err(actual) => current = actual,
            }
        }
    }

    #[inline]
    pub(crate) fn socket(&self) -> &Arc<SocketInner> {
        &self.inner.sock
    }

    pub(crate) fn references(&self) -> usize {
        self.inner.references.load(Ordering::Acquire)
    }

    /* ----------------------------------------------------------------------------- */

    /// Sends `data` to the handle's peer. `cb` always runs, on the socket's worker.
    ///
    /// TCP-DNS messages are length-prefixed on the wire and may not exceed 65535 bytes.
    pub fn send<F>(&self, data: &[u8], cb: F)
    where
        F: FnOnce(&Handle, NetResult<()>) + Send + 'static,
    {
        let sock = self.socket();
        let mut req = Request::get(sock);
        let framed = sock.kind == SocketType::TcpDnsSocket;
        if framed {
            req.fill_framed(data);
        } else {
            req.fill(data);
        }
        req.handle = Some(self.clone());
        req.peer = self.peer_addr();
        req.set_send_cb(Box::new(cb));

        let refused = if framed && data.len() > u16::MAX as usize {
            Some(NetError::TooLarge)
        } else if !sock.is_usable() {
            Some(NetError::Canceled)
        } else {
            None
        };
        match refused {
            None => sock.mgr.maybe_enqueue(sock.tid, NetEvent::Send(req)),
            Some(err) => sock.mgr.enqueue(
                sock.tid,
                NetEvent::SendCb {
                    req,
                    result: Err(err),
                },
            ),
        }
    }

    /// Starts reading. `cb` receives data until reading is canceled, fails or, for client
    /// sockets, after the first message.
    pub fn read<F>(&self, cb: F)
    where
        F: Fn(&Handle, NetResult<&[u8]>) + Send + Sync + 'static,
    {
        let sock = self.socket();
        let cb: RecvCb = Arc::new(cb);
        let handle = self.clone();
        if sock.is_usable() {
            sock.mgr.maybe_enqueue(sock.tid, NetEvent::Read { handle, cb });
        } else {
            sock.mgr.enqueue(
                sock.tid,
                NetEvent::ReadCb {
                    handle,
                    cb,
                    result: NetError::Canceled,
                },
            );
        }
    }

    /// Stops reading. The read callback receives [`NetError::Canceled`]; stream connections are
    /// closed.
    pub fn cancel_read(&self) {
        let sock = self.socket();
        sock.mgr.maybe_enqueue(sock.tid, NetEvent::CancelRead(self.clone()));
    }

    /// Stops pulling data off a stream connection without canceling the read.
    pub fn pause_read(&self) {
        let sock = self.socket();
        if sock.kind.is_stream() {
            sock.mgr.maybe_enqueue(sock.tid, NetEvent::PauseRead(self.clone()));
        }
    }

    pub fn resume_read(&self) {
        let sock = self.socket();
        if sock.kind.is_stream() {
            sock.mgr.maybe_enqueue(sock.tid, NetEvent::ResumeRead(self.clone()));
        }
    }

    /// Sets the read timeout in milliseconds and restarts a running read timer.
    pub fn set_timeout(&self, timeout: u32) {
        let sock = self.socket();
        sock.read_timeout.store(timeout, Ordering::Relaxed);
        sock.mgr.maybe_enqueue(sock.tid, NetEvent::RestartTimer(self.clone()));
    }

    pub fn clear_timeout(&self) {
        self.set_timeout(0);
    }

    /// Timeout for queued writes to drain. Applies to writes queued afterwards.
    pub fn set_write_timeout(&self, timeout: u32) {
        self.socket().write_timeout.store(timeout, Ordering::Relaxed);
    }

    /// Switches a stream connection between the idle and keepalive read timeouts.
    pub fn keepalive(&self, enabled: bool) {
        let sock = self.socket();
        if !sock.kind.is_stream() {
            return;
        }
        sock.keepalive.store(enabled, Ordering::Relaxed);
        self.set_timeout(sock.established_timeout());
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.state.lock().peer
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.state.lock().local
    }

    pub fn socket_type(&self) -> SocketType {
        self.socket().kind
    }

    /// Worker the handle's socket belongs to.
    pub fn worker(&self) -> WorkerId {
        self.socket().tid
    }

    /// Whether new operations can still be started on the handle's socket.
    pub fn is_active(&self) -> bool {
        self.socket().is_usable()
    }

    /// Attaches application data to the handle, replacing any previous data.
    ///
    /// `reset` runs on the data when the handle is released.
    pub fn set_data<T: Any + Send>(&self, data: T, reset: Option<ResetFn>) {
        let mut state = self.inner.state.lock();
        state.opaque = Some(Box::new(data));
        state.doreset = reset;
    }

    /// Runs `f` on the attached data if it is a `T`.
    pub fn with_data<T: Any + Send, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut state = self.inner.state.lock();
        state.opaque.as_mut()?.downcast_mut::<T>().map(f)
    }
}

impl Clone for Handle {
    fn clone(&self) -> Self {
        self.inner.references.fetch_add(1, Ordering::AcqRel);
        Handle {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if self.inner.references.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        release(Arc::clone(&self.inner));
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let sock = self.socket();
        f.debug_struct("Handle")
            .field("socket", &sock.id)
            .field("kind", &sock.kind)
            .field("references", &self.references())
            .field("peer", &self.peer_addr())
            .finish()
    }
}

/// The last reference is gone. Finalizes on the owning worker, inline when that is safe.
fn release(inner: Arc<HandleInner>) {
    let sock = Arc::clone(&inner.sock);
    if sock.closehandle_cb.is_none() {
        if let Some(lw) = current_for(&sock.mgr) {
            if lw.id() == sock.tid && !lw.is_busy() {
                finalize(inner, Some(&lw));
                return;
            }
        }
    }
    sock.mgr.enqueue(sock.tid, NetEvent::Detach(inner));
}

/// Resets a released handle, returns it to its socket's free list and drops its socket
/// reference.
pub(crate) fn finalize(inner: Arc<HandleInner>, lw: Option<&LocalWorker>) {
    let sock = Arc::clone(&inner.sock);
    let (attached, opaque, doreset) = {
        let mut state = inner.state.lock();
        state.peer = None;
        state.local = None;
        (
            state.attached.take(),
            state.opaque.take(),
            state.doreset.take(),
        )
    };
    if let (Some(mut data), Some(mut reset)) = (opaque, doreset) {
        reset(data.as_mut());
    }
    sock.clear_statichandle(&inner);
    sock.active_handles.fetch_sub(1, Ordering::AcqRel);
    recycle(&sock, inner);
    if let (Some(lw), Some(cb)) = (lw, sock.closehandle_cb) {
        cb(lw, &sock);
    }
    drop(attached);
}

#[cfg(not(feature = "sanitize"))]
fn recycle(sock: &SocketInner, inner: Arc<HandleInner>) {
    if sock.is_active() {
        let _ = sock.inactive_handles.push(inner);
    }
}

#[cfg(feature = "sanitize")]
fn recycle(_sock: &SocketInner, _inner: Arc<HandleInner>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::tests::{test_manager, wait_for};
    use crate::socket::{close_offline, Socket, SocketOpts};
    use std::sync::atomic::AtomicBool;

    fn udp_client(mgr: &crate::Manager) -> Arc<SocketInner> {
        SocketInner::new(
            mgr.inner(),
            SocketType::UdpSocket,
            WorkerId(0),
            SocketOpts {
                client: true,
                ..Default::default()
            },
        )
    }

    #[test]
    fn handles_keep_socket_referenced() {
        let mgr = test_manager();
        let sock = udp_client(mgr);
        let h1 = Handle::get(&sock, None, None);
        let h2 = Handle::get(&sock, None, None);
        let h3 = h1.clone();
        assert_eq!(sock.references(), 2);
        assert_eq!(sock.active_handles.load(Ordering::Acquire), 2);
        assert_eq!(h1.references(), 2);

        drop(h1);
        drop(h2);
        wait_for(|| sock.references() == 1);
        assert!(sock.is_active());
        drop(h3);
        wait_for(|| sock.references() == 0);
        wait_for(|| sock.is_destroyed());
        assert_eq!(sock.active_handles.load(Ordering::Acquire), 0);
    }

    #[test]
    fn closed_socket_outlives_outstanding_handles() {
        let mgr = test_manager();
        let sock = SocketInner::new(
            mgr.inner(),
            SocketType::UdpSocket,
            WorkerId(0),
            SocketOpts::default(),
        );
        let owner = Socket::attach(&sock);
        let mut handles: Vec<Handle> = (0..3).map(|_| Handle::get(&sock, None, None)).collect();
        assert_eq!(sock.active_handles.load(Ordering::Acquire), 3);

        close_offline(&sock);
        drop(owner);
        assert!(sock.is_closed());
        assert!(!sock.is_destroyed());

        // release order does not matter
        drop(handles.remove(1));
        drop(handles.remove(0));
        wait_for(|| sock.active_handles.load(Ordering::Acquire) == 1);
        assert!(!sock.is_destroyed());
        drop(handles.pop());
        wait_for(|| sock.is_destroyed());
        assert_eq!(sock.active_handles.load(Ordering::Acquire), 0);
    }

    #[test]
    fn static_handle_is_weak() {
        let mgr = test_manager();
        let sock = udp_client(mgr);
        let handle = Handle::get(&sock, None, None);
        let current = sock.statichandle().unwrap();
        assert_eq!(handle.references(), 2);
        drop(current);
        assert_eq!(handle.references(), 1);
        drop(handle);
        assert!(sock.statichandle().is_none());
    }

    #[test]
    fn reset_runs_on_release() {
        let mgr = test_manager();
        let sock = udp_client(mgr);
        let reset = Arc::new(AtomicBool::new(false));
        let handle = Handle::get(&sock, None, None);
        let flag = Arc::clone(&reset);
        handle.set_data(
            7u32,
            Some(Box::new(move |data| {
                assert_eq!(data.downcast_ref::<u32>(), Some(&8));
                flag.store(true, Ordering::SeqCst);
            })),
        );
        let bumped = handle.with_data(|n: &mut u32| {
            *n += 1;
            *n
        });
        assert_eq!(bumped, Some(8));
        assert_eq!(handle.with_data(|s: &mut String| s.len()), None);
        drop(handle);
        wait_for(|| reset.load(Ordering::SeqCst));
    }
}
