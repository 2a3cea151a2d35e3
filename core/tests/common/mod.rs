#![allow(dead_code)]

use netmgr_core::{Manager, MemContext};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn manager(nworkers: usize) -> Manager {
    init_logging();
    Manager::create(Arc::new(MemContext::new("test")), nworkers)
}

/// Loopback address with a port picked by the kernel.
pub fn any_port() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Polls `cond` until it holds, for up to five seconds.
pub fn wait_for(cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(cond(), "condition not reached");
}

/// A two-byte big-endian length followed by `msg`.
pub fn frame(msg: &[u8]) -> Vec<u8> {
    let mut out = (msg.len() as u16).to_be_bytes().to_vec();
    out.extend_from_slice(msg);
    out
}
