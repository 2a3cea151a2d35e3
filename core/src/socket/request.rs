use super::{ConnectCb, SendCb, Socket, SocketInner};
use crate::errors::NetResult;
use crate::socket::handle::Handle;
use crate::stats::counters_for;

use std::net::SocketAddr;
use std::sync::Arc;

pub(crate) enum ReqCallback {
    None,
    Connect(ConnectCb),
    Send(SendCb),
}

/// One in-flight connect or send. Recycled through its socket's free list.
pub(crate) struct Request {
    sock: Arc<SocketInner>,
    attached: Option<Socket>,
    pub(crate) handle: Option<Handle>,
    cb: ReqCallback,
    /// Outbound bytes; `buf[offset..]` is still unsent.
    pub(crate) buf: Vec<u8>,
    pub(crate) offset: usize,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) local: Option<SocketAddr>,
}

impl Request {
    pub(crate) fn get(sock: &Arc<SocketInner>) -> Box<Request> {
        let mut req = sock.inactive_reqs.pop().unwrap_or_else(|| {
            Box::new(Request {
                sock: Arc::clone(sock),
                attached: None,
                handle: None,
                cb: ReqCallback::None,
                buf: vec![],
                offset: 0,
                peer: None,
                local: None,
            })
        });
        req.attached = Some(Socket::attach(sock));
        req
    }

    #[inline]
    pub(crate) fn socket(&self) -> &Arc<SocketInner> {
        &self.sock
    }

    pub(crate) fn set_connect_cb(&mut self, cb: ConnectCb) {
        self.cb = ReqCallback::Connect(cb);
    }

    pub(crate) fn set_send_cb(&mut self, cb: SendCb) {
        self.cb = ReqCallback::Send(cb);
    }

    /// Replaces the payload with `data`, growing the buffer through the memory context.
    pub(crate) fn fill(&mut self, data: &[u8]) {
        self.reserve(data.len());
        self.buf.extend_from_slice(data);
        self.offset = 0;
    }

    /// Replaces the payload with `data` behind a two-byte big-endian length prefix.
    pub(crate) fn fill_framed(&mut self, data: &[u8]) {
        self.reserve(data.len() + 2);
        self.buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(data);
        self.offset = 0;
    }

    /// Clears the buffer, making room for `len` bytes.
    fn reserve(&mut self, len: usize) {
        if self.buf.capacity() < len {
            let mem = &self.sock.mgr.mem;
            let old = std::mem::replace(&mut self.buf, mem.get_empty(len));
            mem.put(old);
        }
        self.buf.clear();
    }

    #[inline]
    pub(crate) fn remaining(&self) -> &[u8] {
        &self.buf[self.offset..]
    }

    pub(crate) fn complete_send(mut self: Box<Self>, result: NetResult<()>) {
        if matches!(&result, Err(e) if !e.is_cancellation()) {
            self.sock
                .mgr
                .stats
                .inc(counters_for(self.sock.kind).send_fail);
        }
        if let ReqCallback::Send(cb) = std::mem::replace(&mut self.cb, ReqCallback::None) {
            if let Some(handle) = &self.handle {
                cb(handle, result);
            }
        }
        self.put();
    }

    pub(crate) fn complete_connect(mut self: Box<Self>, result: NetResult<Handle>) {
        let counters = counters_for(self.sock.kind);
        match &result {
            Ok(_) => self.sock.mgr.stats.inc(counters.connect),
            Err(_) => self.sock.mgr.stats.inc(counters.connect_fail),
        }
        if let ReqCallback::Connect(cb) = std::mem::replace(&mut self.cb, ReqCallback::None) {
            match &result {
                Ok(handle) => cb(Ok(handle)),
                Err(e) => cb(Err(e.clone())),
            }
        }
        self.put();
        drop(result);
    }

    /// Resets the request and returns it to its socket's free list.
    pub(crate) fn put(mut self: Box<Self>) {
        let attached = self.attached.take();
        let handle = self.handle.take();
        self.cb = ReqCallback::None;
        self.peer = None;
        self.local = None;
        self.offset = 0;
        self.buf.clear();
        let sock = Arc::clone(&self.sock);
        recycle(&sock, self);
        drop(handle);
        drop(attached);
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        self.sock.mgr.mem.put(std::mem::take(&mut self.buf));
    }
}

#[cfg(not(feature = "sanitize"))]
fn recycle(sock: &SocketInner, req: Box<Request>) {
    if sock.is_active() {
        let _ = sock.inactive_reqs.push(req);
    }
}

#[cfg(feature = "sanitize")]
fn recycle(_sock: &SocketInner, _req: Box<Request>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::tests::test_manager;
    use crate::socket::{SocketOpts, SocketType};
    use crate::worker::WorkerId;

    #[test]
    #[cfg(not(feature = "sanitize"))]
    fn framing_prefixes_length() {
        let mgr = test_manager();
        let sock = SocketInner::new(
            mgr.inner(),
            SocketType::TcpDnsSocket,
            WorkerId(0),
            SocketOpts::default(),
        );
        let mut req = Request::get(&sock);
        req.fill_framed(&[0xab; 300]);
        assert_eq!(&req.buf[..2], &[0x01, 0x2c]);
        assert_eq!(req.buf.len(), 302);
        req.offset = 2;
        assert_eq!(req.remaining().len(), 300);

        req.put();
        assert_eq!(sock.inactive_reqs.len(), 1);
        let again = Request::get(&sock);
        assert_eq!(again.offset, 0);
        assert!(again.buf.is_empty());
        again.put();
    }
}
