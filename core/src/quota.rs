//! Admission control for inbound connections.

use crate::errors::{NetError, NetResult};

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

type Waiter = Box<dyn FnOnce() + Send>;

struct QuotaState {
    used: usize,
    waiters: VecDeque<Waiter>,
}

/// Counts concurrently admitted connections against a hard and an optional soft limit.
///
/// A `max` of `0` disables the hard limit.
pub struct Quota {
    max: usize,
    soft: Mutex<usize>,
    state: Mutex<QuotaState>,
}

impl Quota {
    pub fn new(max: usize) -> Arc<Quota> {
        Arc::new(Quota {
            max,
            soft: Mutex::new(0),
            state: Mutex::new(QuotaState {
                used: 0,
                waiters: VecDeque::new(),
            }),
        })
    }

    /// Sets the soft limit. Admissions at or above it still succeed but are reported.
    pub fn set_soft(&self, soft: usize) {
        *self.soft.lock() = soft;
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn used(&self) -> usize {
        self.state.lock().used
    }

    /// Takes one slot.
    ///
    /// Fails with [`NetError::Quota`] when the hard limit is reached. Admissions at or above the
    /// soft limit succeed and are logged as [`NetError::SoftQuota`].
    pub fn attach(self: &Arc<Self>) -> NetResult<QuotaGuard> {
        let soft = *self.soft.lock();
        let mut state = self.state.lock();
        if self.max != 0 && state.used >= self.max {
            return Err(NetError::Quota);
        }
        state.used += 1;
        if soft != 0 && state.used > soft {
            log::debug!("{} ({}/{})", NetError::SoftQuota, state.used, soft);
        }
        Ok(QuotaGuard {
            quota: Arc::clone(self),
        })
    }

    /// Takes one slot, or registers `waiter` to be called once a slot is released.
    ///
    /// The waiter runs on the releasing thread and does not hold a slot itself; it is expected to
    /// retry [`attach`](Self::attach).
    pub(crate) fn attach_or_wait(
        self: &Arc<Self>,
        waiter: impl FnOnce() + Send + 'static,
    ) -> NetResult<QuotaGuard> {
        let soft = *self.soft.lock();
        let mut state = self.state.lock();
        if self.max != 0 && state.used >= self.max {
            state.waiters.push_back(Box::new(waiter));
            return Err(NetError::Quota);
        }
        state.used += 1;
        if soft != 0 && state.used > soft {
            log::debug!("{} ({}/{})", NetError::SoftQuota, state.used, soft);
        }
        Ok(QuotaGuard {
            quota: Arc::clone(self),
        })
    }

    fn release(&self) {
        let waiter = {
            let mut state = self.state.lock();
            state.used -= 1;
            state.waiters.pop_front()
        };
        if let Some(waiter) = waiter {
            waiter();
        }
    }
}

impl fmt::Debug for Quota {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Quota")
            .field("max", &self.max)
            .field("used", &state.used)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// One admitted slot. Dropping the guard releases it.
pub struct QuotaGuard {
    quota: Arc<Quota>,
}

impl Drop for QuotaGuard {
    fn drop(&mut self) {
        self.quota.release();
    }
}

impl fmt::Debug for QuotaGuard {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("QuotaGuard").finish()
    }
}
