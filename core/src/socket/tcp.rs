//! TCP transport: listening, accepting, connecting and streaming.

use super::{
    close_io, entry_for, failed_read, register, reset, udp, Io, Readiness, Socket, SocketInner,
    SocketOpts, SocketType,
};
use crate::errors::{log_failure, NetError};
use crate::event::NetEvent;
use crate::socket::handle::Handle;
use crate::socket::request::Request;
use crate::socket::tcpdns;
use crate::stats::{counters_for, Counter};
use crate::worker::LocalWorker;

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpStream;
use nix::errno::Errno;
use socket2::{Domain, Protocol, SockRef, Socket as RawSocket, Type};

/// A non-blocking listening socket bound to `addr`.
pub(crate) fn bind_listener(
    addr: SocketAddr,
    reuse_port: bool,
    backlog: i32,
) -> io::Result<std::net::TcpListener> {
    let socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

/// Makes closing `stream` send a reset instead of a FIN.
pub(crate) fn set_reset_on_close(stream: &TcpStream) {
    if let Err(e) = SockRef::from(stream).set_linger(Some(Duration::ZERO)) {
        log::debug!("Failed to set linger: {}", e);
    }
}

/* --------------------------------------------------------------------------------- */

/// Accepts pending connections on a listener child until the backlog is empty or its quota is
/// exhausted.
pub(crate) fn accept_ready(lw: &LocalWorker, child: &Arc<SocketInner>) {
    loop {
        if !child.is_usable() {
            return;
        }
        let guard = match &child.listen_quota {
            Some(quota) => {
                let waiter = Arc::clone(child);
                let attached = quota.attach_or_wait(move || {
                    let mgr = Arc::clone(&waiter.mgr);
                    mgr.enqueue(waiter.tid, NetEvent::Accept(waiter));
                });
                match attached {
                    Ok(guard) => Some(guard),
                    Err(_) => {
                        log::debug!("Listener {} over quota, deferring accept", child.id);
                        return;
                    }
                }
            }
            None => None,
        };
        let accepted = {
            let mut st = lw.state.borrow_mut();
            match entry_for(&mut st.sockets, child) {
                Some(entry) => match &entry.io {
                    Io::Listener(listener) => listener.accept(),
                    _ => return,
                },
                None => return,
            }
        };
        match accepted {
            Ok((stream, peer)) => accept_one(lw, child, stream, peer, guard),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                drop(guard);
                child.mgr.stats.inc(Counter::TcpAcceptFail);
                log_failure(
                    &format!("Accept failed on listener {}", child.id),
                    &NetError::from(e),
                );
                return;
            }
        }
    }
}

fn accept_one(
    lw: &LocalWorker,
    child: &Arc<SocketInner>,
    stream: TcpStream,
    peer: SocketAddr,
    guard: Option<crate::quota::QuotaGuard>,
) {
    let dns = child.kind == SocketType::TcpDnsListener;
    let kind = if dns {
        SocketType::TcpDnsSocket
    } else {
        SocketType::TcpSocket
    };
    let local = stream.local_addr().ok();
    let csock = SocketInner::new(
        &lw.mgr,
        kind,
        lw.id(),
        SocketOpts {
            server: Some(Arc::clone(child)),
            peer: Some(peer),
            local,
            closehandle_cb: if dns {
                Some(tcpdns::resume_processing)
            } else {
                None
            },
            ..Default::default()
        },
    );
    *csock.quota.lock() = guard;
    csock
        .read_timeout
        .store(lw.mgr.timeouts().init, Ordering::Relaxed);
    let held = Socket::attach(&csock);

    match register(lw, &csock, Io::Stream(stream)) {
        Ok(_) => {
            let mut st = lw.state.borrow_mut();
            if let Some(entry) = entry_for(&mut st.sockets, &csock) {
                entry.awaiting_first = true;
            }
        }
        Err(e) => {
            csock.mgr.stats.inc(Counter::TcpAcceptFail);
            csock.quota.lock().take();
            close_io(lw, &csock, e);
            return;
        }
    }
    csock.mgr.stats.inc(Counter::TcpAccept);
    log::debug!("Accepted connection {} from {}", csock.id, peer);

    let handle = Handle::get(&csock, Some(peer), local);
    if dns {
        tcpdns::start_server_reading(lw, &csock, &handle);
    }
    let accepted = match &child.callbacks.accept {
        Some(accept_cb) => accept_cb(&handle),
        None => Ok(()),
    };
    if let Err(e) = accepted {
        log_failure(&format!("Connection {} refused", csock.id), &e);
        csock.quota.lock().take();
        close_io(lw, &csock, e);
    }
    drop(handle);
    drop(held);
}

/* --------------------------------------------------------------------------------- */

/// Starts a non-blocking connect for the request's socket.
pub(crate) fn connect(lw: &LocalWorker, req: Box<Request>) {
    let sock = Arc::clone(req.socket());
    let started = match req.peer {
        Some(peer) => start_connect(peer, req.local),
        None => Err(io::ErrorKind::NotConnected.into()),
    };
    let registered = started
        .map_err(NetError::from)
        .and_then(|stream| register(lw, &sock, Io::Stream(stream)));
    match registered {
        Ok(token) => {
            let mut st = lw.state.borrow_mut();
            let st = &mut *st;
            if let Some(entry) = entry_for(&mut st.sockets, &sock) {
                entry.connect_req = Some(req);
                // the connect is bounded by the read timer
                entry.start_read_timer(&mut st.timers, token);
            }
        }
        Err(err) => {
            sock.mgr.stats.inc(counters_for(sock.kind).open_fail);
            close_io(lw, &sock, err.clone());
            lw.defer(move || req.complete_connect(Err(err)));
        }
    }
}

fn start_connect(peer: SocketAddr, local: Option<SocketAddr>) -> io::Result<TcpStream> {
    let socket = RawSocket::new(Domain::for_address(peer), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    if let Some(local) = local {
        socket.set_reuse_address(true)?;
        socket.bind(&local.into())?;
    }
    match socket.connect(&peer.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(Errno::EINPROGRESS as i32) => {}
        Err(e) => return Err(e),
    }
    Ok(TcpStream::from_std(socket.into()))
}

enum ConnectState {
    Pending,
    Connected(Box<Request>, SocketAddr, Option<SocketAddr>),
    Failed(Box<Request>, NetError),
}

fn finish_connect(lw: &LocalWorker, sock: &Arc<SocketInner>) {
    let state = {
        let mut st = lw.state.borrow_mut();
        let entry = match entry_for(&mut st.sockets, sock) {
            Some(entry) => entry,
            None => return,
        };
        let stream = match &entry.io {
            Io::Stream(stream) => stream,
            _ => return,
        };
        let outcome = match stream.take_error() {
            Ok(Some(e)) | Err(e) => Err(e),
            Ok(None) => match stream.peer_addr() {
                Ok(peer) => Ok((peer, stream.local_addr().ok())),
                Err(e) if e.kind() == io::ErrorKind::NotConnected => return,
                Err(e) => Err(e),
            },
        };
        match entry.connect_req.take() {
            None => ConnectState::Pending,
            Some(req) => {
                entry.read_timer = None;
                match outcome {
                    Ok((peer, local)) => ConnectState::Connected(req, peer, local),
                    Err(e) => ConnectState::Failed(req, e.into()),
                }
            }
        }
    };
    match state {
        ConnectState::Pending => {}
        ConnectState::Connected(req, peer, local) => {
            sock.set_addrs(Some(peer), local);
            log::debug!("Connection {} established to {}", sock.id, peer);
            let handle = Handle::get(sock, Some(peer), local);
            lw.defer(move || req.complete_connect(Ok(handle)));
        }
        ConnectState::Failed(req, err) => {
            close_io(lw, sock, err.clone());
            lw.defer(move || req.complete_connect(Err(err)));
        }
    }
}

/// Fails an outstanding connect, e.g. when its timer expires.
pub(crate) fn fail_connect(lw: &LocalWorker, sock: &Arc<SocketInner>, err: NetError) {
    let req = {
        let mut st = lw.state.borrow_mut();
        entry_for(&mut st.sockets, sock).and_then(|entry| entry.connect_req.take())
    };
    if let Some(req) = req {
        log::debug!("Connect on socket {} failed: {}", sock.id, err);
        reset(lw, sock, err.clone());
        lw.defer(move || req.complete_connect(Err(err)));
    }
}

/* --------------------------------------------------------------------------------- */

pub(crate) fn on_ready(lw: &LocalWorker, sock: &Arc<SocketInner>, ready: Readiness) {
    let connecting = {
        let st = lw.state.borrow();
        st.sockets
            .get(sock.token())
            .map_or(false, |entry| entry.connect_req.is_some())
    };
    if connecting {
        finish_connect(lw, sock);
        return;
    }
    if ready.writable {
        flush_writes(lw, sock);
    }
    if ready.readable || ready.closed {
        read_ready(lw, sock);
    }
}

enum ReadOutcome {
    Data(usize),
    Done,
    Failed(NetError),
}

fn read_ready(lw: &LocalWorker, sock: &Arc<SocketInner>) {
    let mut buf = lw.take_recvbuf();
    loop {
        let outcome = {
            let mut st = lw.state.borrow_mut();
            match entry_for(&mut st.sockets, sock) {
                Some(entry) if entry.reading && !entry.read_paused => match &mut entry.io {
                    Io::Stream(stream) => match stream.read(&mut buf) {
                        Ok(0) => ReadOutcome::Failed(NetError::Eof),
                        Ok(n) => ReadOutcome::Data(n),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => ReadOutcome::Done,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => ReadOutcome::Failed(e.into()),
                    },
                    _ => ReadOutcome::Done,
                },
                _ => ReadOutcome::Done,
            }
        };
        match outcome {
            ReadOutcome::Data(n) => match sock.kind {
                SocketType::TcpDnsSocket => tcpdns::on_data(lw, sock, &buf[..n]),
                _ => deliver(lw, sock, &buf[..n]),
            },
            ReadOutcome::Done => break,
            ReadOutcome::Failed(err) => {
                failed_read(lw, sock, err);
                break;
            }
        }
    }
    lw.return_recvbuf(buf);
}

/// Hands one chunk of stream data to the read callback and restarts the read timer.
fn deliver(lw: &LocalWorker, sock: &Arc<SocketInner>, data: &[u8]) {
    let target = {
        let mut st = lw.state.borrow_mut();
        let st = &mut *st;
        let token = sock.token();
        entry_for(&mut st.sockets, sock).and_then(|entry| {
            if entry.awaiting_first {
                entry.awaiting_first = false;
                sock.read_timeout
                    .store(sock.established_timeout(), Ordering::Relaxed);
            }
            entry.start_read_timer(&mut st.timers, token);
            Some((entry.recv_cb.clone()?, entry.recv_handle.clone()?))
        })
    };
    if let Some((cb, handle)) = target {
        cb(&handle, Ok(data));
    }
}

/// Worker side of a stream send. TCP-DNS payloads arrive already framed.
pub(crate) fn send(lw: &LocalWorker, req: Box<Request>) {
    let sock = Arc::clone(req.socket());
    let refused = {
        let mut st = lw.state.borrow_mut();
        match entry_for(&mut st.sockets, &sock) {
            Some(entry) => {
                entry.write_queue.push_back(req);
                None
            }
            None => Some(req),
        }
    };
    match refused {
        None => flush_writes(lw, &sock),
        Some(req) => lw.defer(move || req.complete_send(Err(NetError::Canceled))),
    }
}

enum WriteStep {
    Complete(Box<Request>, Result<(), NetError>),
    Progress,
    Blocked,
    Idle,
}

/// Writes queued requests in order until the socket would block.
///
/// Used by both transports; a failed stream write resets the connection.
pub(crate) fn flush_writes(lw: &LocalWorker, sock: &Arc<SocketInner>) {
    loop {
        let step = {
            let mut st = lw.state.borrow_mut();
            let st = &mut *st;
            let token = sock.token();
            let entry = match entry_for(&mut st.sockets, sock) {
                Some(entry) => entry,
                None => return,
            };
            let req = match entry.write_queue.front_mut() {
                Some(req) => req,
                None => {
                    entry.write_timer = None;
                    return;
                }
            };
            let written = match &mut entry.io {
                Io::Stream(stream) => match stream.write(req.remaining()) {
                    Ok(0) => Err(io::ErrorKind::WriteZero.into()),
                    Ok(n) => {
                        req.offset += n;
                        Ok(req.remaining().is_empty())
                    }
                    Err(e) => Err(e),
                },
                Io::Udp(socket) => udp::send_datagram(socket, sock, req).map(|_| true),
                Io::Listener(_) => Err(io::ErrorKind::Unsupported.into()),
            };
            match written {
                Ok(false) => {
                    entry.start_write_timer(&mut st.timers, token);
                    WriteStep::Progress
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => WriteStep::Progress,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if entry.write_timer.is_none() {
                        entry.start_write_timer(&mut st.timers, token);
                    }
                    WriteStep::Blocked
                }
                result => match entry.write_queue.pop_front() {
                    Some(req) => {
                        if entry.write_queue.is_empty() {
                            entry.write_timer = None;
                        } else {
                            entry.start_write_timer(&mut st.timers, token);
                        }
                        WriteStep::Complete(req, result.map(|_| ()).map_err(NetError::from))
                    }
                    None => WriteStep::Idle,
                },
            }
        };
        match step {
            WriteStep::Complete(req, Err(err)) if sock.kind.is_stream() => {
                lw.defer(move || req.complete_send(Err(err)));
                log::debug!("Write failed on connection {}, resetting", sock.id);
                reset(lw, sock, NetError::ConnectionReset);
                return;
            }
            WriteStep::Complete(req, result) => lw.defer(move || req.complete_send(result)),
            WriteStep::Progress => {}
            WriteStep::Blocked | WriteStep::Idle => return,
        }
    }
}
