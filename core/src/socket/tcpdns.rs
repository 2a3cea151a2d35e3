//! DNS over TCP: a stream of messages, each behind a two-byte big-endian length.
//!
//! Server connections read on their own from the moment they are accepted and hand every
//! complete message to the listener's receive callback with a fresh handle. Reading pauses while
//! too many of those handles are outstanding and picks up again as they are released.

use super::{entry_for, LoopState, RecvCb, SocketInner};
use crate::socket::handle::Handle;
use crate::worker::LocalWorker;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use mio::Token;

/// Removes the first complete message from `buf`, if there is one.
pub(crate) fn next_message(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    if buf.len() < 2 {
        return None;
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if buf.len() < len + 2 {
        return None;
    }
    let msg = buf[2..len + 2].to_vec();
    buf.drain(..len + 2);
    Some(msg)
}

/// Starts the automatic read on an accepted connection. `handle` keeps it referenced.
pub(crate) fn start_server_reading(lw: &LocalWorker, csock: &Arc<SocketInner>, handle: &Handle) {
    let mut st = lw.state.borrow_mut();
    let st = &mut *st;
    let token = csock.token();
    if let Some(entry) = entry_for(&mut st.sockets, csock) {
        entry.reading = true;
        entry.recv_cb = csock
            .server
            .as_ref()
            .and_then(|server| server.callbacks.recv.clone());
        entry.recv_handle = Some(handle.clone());
        entry.awaiting_first = true;
        entry.start_read_timer(&mut st.timers, token);
    }
}

/// Buffers stream bytes and delivers the messages they complete.
pub(crate) fn on_data(lw: &LocalWorker, sock: &Arc<SocketInner>, data: &[u8]) {
    {
        let mut st = lw.state.borrow_mut();
        match entry_for(&mut st.sockets, sock) {
            Some(entry) => entry.framebuf.extend_from_slice(data),
            None => return,
        }
    }
    process_buffer(lw, sock);
}

enum Next {
    /// The single message of a client read.
    Client(RecvCb, Handle, Vec<u8>),
    Server(RecvCb, Vec<u8>),
}

/// Delivers buffered messages for as long as the socket is reading.
pub(crate) fn process_buffer(lw: &LocalWorker, sock: &Arc<SocketInner>) {
    loop {
        let next = {
            let mut st = lw.state.borrow_mut();
            let st = &mut *st;
            let token = sock.token();
            let entry = match entry_for(&mut st.sockets, sock) {
                Some(entry) if entry.reading && !entry.read_paused => entry,
                _ => return,
            };
            let msg = match next_message(&mut entry.framebuf) {
                Some(msg) => msg,
                None => return,
            };
            if entry.awaiting_first {
                entry.awaiting_first = false;
                sock.read_timeout
                    .store(sock.established_timeout(), Ordering::Relaxed);
            }
            if sock.client {
                entry.reading = false;
                entry.read_timer = None;
                match (entry.recv_cb.take(), entry.recv_handle.take()) {
                    (Some(cb), Some(handle)) => Next::Client(cb, handle, msg),
                    _ => return,
                }
            } else {
                entry.start_read_timer(&mut st.timers, token);
                match entry.recv_cb.clone() {
                    Some(cb) => Next::Server(cb, msg),
                    None => return,
                }
            }
        };
        match next {
            Next::Client(cb, handle, msg) => {
                cb(&handle, Ok(&msg));
                return;
            }
            Next::Server(cb, msg) => {
                let handle = Handle::get(sock, None, None);
                cb(&handle, Ok(&msg));
                drop(handle);
                if pause_if_saturated(lw, sock) {
                    return;
                }
            }
        }
    }
}

/// Requests still held by the application, not counting the handle that keeps the read going.
fn outstanding(sock: &SocketInner) -> usize {
    sock.active_handles.load(Ordering::Acquire).saturating_sub(1)
}

fn pause_if_saturated(lw: &LocalWorker, sock: &Arc<SocketInner>) -> bool {
    let limit = sock.mgr.tcp.pipeline_limit.max(1);
    if outstanding(sock) < limit {
        return false;
    }
    let mut st = lw.state.borrow_mut();
    if let Some(entry) = entry_for(&mut st.sockets, sock) {
        log::trace!("Connection {} has {} requests outstanding, pausing", sock.id, limit);
        entry.read_paused = true;
        entry.pipeline_paused = true;
        entry.read_timer = None;
    }
    true
}

/// Close-handle callback of server connections: resumes a read paused by the pipeline limit.
pub(crate) fn resume_processing(lw: &LocalWorker, sock: &Arc<SocketInner>) {
    if outstanding(sock) >= sock.mgr.tcp.pipeline_limit.max(1) {
        return;
    }
    {
        let mut st = lw.state.borrow_mut();
        let LoopState {
            poll,
            sockets,
            timers,
        } = &mut *st;
        let token = sock.token();
        let entry = match entry_for(sockets, sock) {
            Some(entry) if entry.pipeline_paused => entry,
            _ => return,
        };
        entry.pipeline_paused = false;
        entry.read_paused = false;
        if entry.reading {
            entry.start_read_timer(timers, token);
        }
        if let Err(e) = entry.io.reregister(poll.registry(), Token(token)) {
            log::debug!("Failed to rearm connection {}: {}", sock.id, e);
        }
    }
    process_buffer(lw, sock);
}
