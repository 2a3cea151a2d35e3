//! UDP transport.

use super::{close_io, entry_for, failed_read, register, Io, SocketInner, SocketType};
use crate::errors::{NetError, NetResult};
use crate::manager::ManagerInner;
use crate::socket::handle::Handle;
use crate::socket::request::Request;
use crate::stats::counters_for;
use crate::worker::LocalWorker;

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};

/// A non-blocking UDP socket bound to `addr`, sized per the manager's UDP settings.
pub(crate) fn bind_socket(
    mgr: &ManagerInner,
    addr: SocketAddr,
    reuse_port: bool,
) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    if let Some(size) = mgr.udp.recv_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    if let Some(size) = mgr.udp.send_buffer_size {
        socket.set_send_buffer_size(size)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

fn unspecified_for(peer: &SocketAddr) -> SocketAddr {
    let ip = match peer {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}

/// Datagrams larger than the configured maximum are dropped.
fn oversized(mgr: &ManagerInner, len: usize) -> bool {
    let max = mgr.max_udp();
    max != 0 && len > max as usize
}

/// Listener children read for as long as they are registered.
pub(crate) fn start_listening(lw: &LocalWorker, child: &Arc<SocketInner>) {
    let mut st = lw.state.borrow_mut();
    if let Some(entry) = entry_for(&mut st.sockets, child) {
        entry.reading = true;
        entry.recv_cb = child.callbacks.recv.clone();
    }
}

pub(crate) fn on_ready(lw: &LocalWorker, sock: &Arc<SocketInner>, readable: bool, writable: bool) {
    if writable {
        super::tcp::flush_writes(lw, sock);
    }
    if readable {
        read_ready(lw, sock);
    }
}

enum Received {
    Datagram(usize, SocketAddr),
    Dropped,
    Done,
    Failed(io::Error),
}

fn read_ready(lw: &LocalWorker, sock: &Arc<SocketInner>) {
    let mut buf = lw.take_recvbuf();
    loop {
        let received = {
            let mut st = lw.state.borrow_mut();
            match entry_for(&mut st.sockets, sock) {
                Some(entry) if entry.reading && !entry.read_paused => match &entry.io {
                    Io::Udp(io) => {
                        let result = match (sock.client, sock.peer()) {
                            (true, Some(peer)) => io.recv(&mut buf).map(|n| (n, peer)),
                            _ => io.recv_from(&mut buf),
                        };
                        match result {
                            Ok((n, _)) if oversized(&sock.mgr, n) => Received::Dropped,
                            Ok((n, peer)) => Received::Datagram(n, peer),
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Received::Done,
                            Err(e) => Received::Failed(e),
                        }
                    }
                    _ => Received::Done,
                },
                _ => Received::Done,
            }
        };
        match received {
            Received::Datagram(n, peer) => deliver(lw, sock, &buf[..n], peer),
            Received::Dropped => {
                log::debug!("Dropping oversized datagram on socket {}", sock.id);
            }
            Received::Done => break,
            Received::Failed(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Received::Failed(e) => {
                let err = NetError::from(e);
                if sock.client {
                    failed_read(lw, sock, err);
                } else {
                    sock.mgr.stats.inc(counters_for(sock.kind).recv_fail);
                    log::debug!("Receive failed on socket {}: {}", sock.id, err);
                }
                break;
            }
        }
    }
    lw.return_recvbuf(buf);
}

fn deliver(lw: &LocalWorker, sock: &Arc<SocketInner>, data: &[u8], peer: SocketAddr) {
    if !sock.client {
        // every datagram gets its own handle
        let handle = Handle::get(sock, Some(peer), None);
        if let Some(cb) = &sock.callbacks.recv {
            cb(&handle, Ok(data));
        }
        return;
    }
    // client reads are one-shot
    let taken = {
        let mut st = lw.state.borrow_mut();
        entry_for(&mut st.sockets, sock).map(|entry| {
            entry.reading = false;
            entry.read_timer = None;
            (entry.recv_cb.take(), entry.recv_handle.take())
        })
    };
    if let Some((Some(cb), Some(handle))) = taken {
        cb(&handle, Ok(data));
    }
}

/// Binds and connects the socket of a UDP connect request.
pub(crate) fn connect(lw: &LocalWorker, req: Box<Request>) {
    let sock = Arc::clone(req.socket());
    let peer = match req.peer {
        Some(peer) => peer,
        None => {
            lw.defer(move || req.complete_connect(Err(NetError::NotConnected)));
            return;
        }
    };
    let local = req.local.unwrap_or_else(|| unspecified_for(&peer));

    let connected = bind_socket(&sock.mgr, local, false).and_then(|s| {
        s.connect(peer)?;
        Ok(s)
    });
    let result: NetResult<Handle> = connected
        .map_err(NetError::from)
        .and_then(|s| {
            let local = s.local_addr().ok();
            register(lw, &sock, Io::Udp(mio::net::UdpSocket::from_std(s)))?;
            sock.set_addrs(Some(peer), local);
            Ok(Handle::get(&sock, Some(peer), local))
        });
    match result {
        Ok(handle) => {
            log::debug!("UDP socket {} connected to {}", sock.id, peer);
            lw.defer(move || req.complete_connect(Ok(handle)));
        }
        Err(err) => {
            sock.mgr.stats.inc(counters_for(SocketType::UdpSocket).open_fail);
            close_io(lw, &sock, err.clone());
            lw.defer(move || req.complete_connect(Err(err)));
        }
    }
}

enum SendOutcome {
    Sent(Box<Request>, NetResult<()>),
    Queued,
}

pub(crate) fn send(lw: &LocalWorker, mut req: Box<Request>) {
    let sock = Arc::clone(req.socket());
    if oversized(&sock.mgr, req.buf.len()) {
        log::debug!("Dropping oversized datagram to {:?}", req.peer);
        lw.defer(move || req.complete_send(Ok(())));
        return;
    }
    let outcome = {
        let mut st = lw.state.borrow_mut();
        let st = &mut *st;
        let token = sock.token();
        match entry_for(&mut st.sockets, &sock) {
            None => SendOutcome::Sent(req, Err(NetError::Canceled)),
            Some(entry) if !entry.write_queue.is_empty() => {
                entry.write_queue.push_back(req);
                SendOutcome::Queued
            }
            Some(entry) => {
                let result = match &entry.io {
                    Io::Udp(io) => send_datagram(io, &sock, &req),
                    _ => Err(io::ErrorKind::Unsupported.into()),
                };
                match result {
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        req.offset = 0;
                        entry.write_queue.push_back(req);
                        entry.start_write_timer(&mut st.timers, token);
                        SendOutcome::Queued
                    }
                    result => SendOutcome::Sent(req, result.map(|_| ()).map_err(NetError::from)),
                }
            }
        }
    };
    if let SendOutcome::Sent(req, result) = outcome {
        lw.defer(move || req.complete_send(result));
    }
}

/// One datagram to the request's peer, or to the connected peer for clients.
pub(crate) fn send_datagram(
    io: &mio::net::UdpSocket,
    sock: &SocketInner,
    req: &Request,
) -> io::Result<usize> {
    if sock.client {
        return io.send(&req.buf);
    }
    match req.peer {
        Some(peer) => io.send_to(&req.buf, peer),
        None => Err(io::ErrorKind::NotConnected.into()),
    }
}
