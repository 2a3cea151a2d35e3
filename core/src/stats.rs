//! Socket statistics.
//!
//! Counters are fire-and-forget: every update is a relaxed atomic operation and readers may
//! observe values that are momentarily out of date.

use crate::socket::SocketType;

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use itertools::Itertools;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Counter {
    UdpOpen,
    UdpOpenFail,
    UdpBindFail,
    UdpConnect,
    UdpConnectFail,
    UdpSendFail,
    UdpRecvFail,
    UdpClose,
    UdpActive,
    TcpOpen,
    TcpOpenFail,
    TcpBindFail,
    TcpConnect,
    TcpConnectFail,
    TcpAccept,
    TcpAcceptFail,
    TcpSendFail,
    TcpRecvFail,
    TcpClose,
    TcpActive,
}

impl Counter {
    pub const COUNT: usize = Counter::TcpActive as usize + 1;

    pub const ALL: [Counter; Counter::COUNT] = [
        Counter::UdpOpen,
        Counter::UdpOpenFail,
        Counter::UdpBindFail,
        Counter::UdpConnect,
        Counter::UdpConnectFail,
        Counter::UdpSendFail,
        Counter::UdpRecvFail,
        Counter::UdpClose,
        Counter::UdpActive,
        Counter::TcpOpen,
        Counter::TcpOpenFail,
        Counter::TcpBindFail,
        Counter::TcpConnect,
        Counter::TcpConnectFail,
        Counter::TcpAccept,
        Counter::TcpAcceptFail,
        Counter::TcpSendFail,
        Counter::TcpRecvFail,
        Counter::TcpClose,
        Counter::TcpActive,
    ];
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Per-transport counter selection.
pub(crate) struct CounterSet {
    pub(crate) open: Counter,
    pub(crate) open_fail: Counter,
    pub(crate) bind_fail: Counter,
    pub(crate) connect: Counter,
    pub(crate) connect_fail: Counter,
    pub(crate) send_fail: Counter,
    pub(crate) recv_fail: Counter,
    pub(crate) close: Counter,
    pub(crate) active: Counter,
}

const UDP_COUNTERS: CounterSet = CounterSet {
    open: Counter::UdpOpen,
    open_fail: Counter::UdpOpenFail,
    bind_fail: Counter::UdpBindFail,
    connect: Counter::UdpConnect,
    connect_fail: Counter::UdpConnectFail,
    send_fail: Counter::UdpSendFail,
    recv_fail: Counter::UdpRecvFail,
    close: Counter::UdpClose,
    active: Counter::UdpActive,
};

const TCP_COUNTERS: CounterSet = CounterSet {
    open: Counter::TcpOpen,
    open_fail: Counter::TcpOpenFail,
    bind_fail: Counter::TcpBindFail,
    connect: Counter::TcpConnect,
    connect_fail: Counter::TcpConnectFail,
    send_fail: Counter::TcpSendFail,
    recv_fail: Counter::TcpRecvFail,
    close: Counter::TcpClose,
    active: Counter::TcpActive,
};

pub(crate) fn counters_for(kind: SocketType) -> &'static CounterSet {
    if kind.is_udp() {
        &UDP_COUNTERS
    } else {
        &TCP_COUNTERS
    }
}

/* --------------------------------------------------------------------------------- */

/// Atomic socket counters shared by all workers of a manager.
pub struct Stats {
    counters: [AtomicI64; Counter::COUNT],
}

impl Stats {
    pub(crate) fn new() -> Self {
        Stats {
            counters: std::array::from_fn(|_| AtomicI64::new(0)),
        }
    }

    #[inline]
    pub fn inc(&self, counter: Counter) {
        self.counters[counter as usize].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn dec(&self, counter: Counter) {
        self.counters[counter as usize].fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self, counter: Counter) -> i64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    /// Logs every non-zero counter on one line.
    pub fn dump(&self) {
        let line = Counter::ALL
            .iter()
            .map(|&counter| (counter, self.get(counter)))
            .filter(|&(_, value)| value != 0)
            .map(|(counter, value)| format!("{}={}", counter, value))
            .join(", ");
        log::info!("Socket stats: {}", line);
    }
}

impl fmt::Debug for Stats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut map = f.debug_map();
        for counter in Counter::ALL {
            map.entry(&counter, &self.get(counter));
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_counters_go_up_and_down() {
        let stats = Stats::new();
        let set = counters_for(SocketType::TcpDnsSocket);
        stats.inc(set.open);
        stats.inc(set.active);
        stats.inc(set.active);
        stats.dec(set.active);
        assert_eq!(stats.get(Counter::TcpOpen), 1);
        assert_eq!(stats.get(Counter::TcpActive), 1);
        assert_eq!(stats.get(Counter::UdpActive), 0);
        assert_eq!(counters_for(SocketType::UdpListener).close, Counter::UdpClose);
    }
}
