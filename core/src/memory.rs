//! Memory context for I/O buffers.
//!
//! Buffers are plain `Vec<u8>` values; the context only keeps track of how much memory is
//! checked out, so that leaks show up in the usage statistics instead of going unnoticed.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// A named allocation accountant shared by a manager and its workers.
pub struct MemContext {
    name: String,
    inuse: AtomicUsize,
    peak: AtomicUsize,
    allocations: AtomicU64,
}

/// Point-in-time view of a [`MemContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemStats {
    pub inuse: usize,
    pub peak: usize,
    pub allocations: u64,
}

impl MemContext {
    pub fn new(name: &str) -> Self {
        MemContext {
            name: name.to_owned(),
            inuse: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            allocations: AtomicU64::new(0),
        }
    }

    /// Context name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns a zero-filled buffer of `size` bytes.
    pub fn get(&self, size: usize) -> Vec<u8> {
        let buf = vec![0u8; size];
        self.account(buf.capacity());
        buf
    }

    /// Returns an empty buffer that can hold `capacity` bytes without reallocating.
    pub fn get_empty(&self, capacity: usize) -> Vec<u8> {
        let buf = Vec::with_capacity(capacity);
        self.account(buf.capacity());
        buf
    }

    /// Releases a buffer obtained from [`get`](Self::get) or [`get_empty`](Self::get_empty).
    pub fn put(&self, buf: Vec<u8>) {
        self.inuse.fetch_sub(buf.capacity(), Ordering::Relaxed);
    }

    pub fn stats(&self) -> MemStats {
        MemStats {
            inuse: self.inuse.load(Ordering::Relaxed),
            peak: self.peak.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
        }
    }

    fn account(&self, size: usize) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        let inuse = self.inuse.fetch_add(size, Ordering::Relaxed) + size;
        self.peak.fetch_max(inuse, Ordering::Relaxed);
    }
}

impl Default for MemContext {
    fn default() -> Self {
        MemContext::new("netmgr")
    }
}

impl fmt::Debug for MemContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MemContext")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}
