//! One-shot timers bound to a handle.
//!
//! A timer lives in the wheel of its handle's worker. Starting or stopping it from another thread
//! is routed to that worker; every start or stop bumps the timer's generation so that an entry
//! armed earlier can never fire.

use crate::event::NetEvent;
use crate::socket::Handle;
use crate::worker::event_loop::TimerKey;
use crate::worker::LocalWorker;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) type TimerCb = Box<dyn Fn(&Handle) + Send + Sync>;

pub(crate) struct TimerInner {
    handle: Handle,
    cb: TimerCb,
    /// Generation of the live wheel entry, `0` when none is armed.
    gen: AtomicU64,
    running: AtomicBool,
    users: AtomicUsize,
}

/// A timer that calls back with its handle on the handle's worker.
///
/// Cloning attaches and dropping detaches; the timer is stopped when the last clone goes away.
/// The timer keeps its handle, and so the socket, referenced for as long as it exists.
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl Timer {
    pub fn create<F>(handle: &Handle, cb: F) -> Timer
    where
        F: Fn(&Handle) + Send + Sync + 'static,
    {
        Timer {
            inner: Arc::new(TimerInner {
                handle: handle.clone(),
                cb: Box::new(cb),
                gen: AtomicU64::new(0),
                running: AtomicBool::new(false),
                users: AtomicUsize::new(1),
            }),
        }
    }

    /// Fires once after `ms` milliseconds, replacing any pending deadline.
    pub fn start(&self, ms: u64) {
        let sock = self.inner.handle.socket();
        sock.mgr.maybe_enqueue(
            sock.tid,
            NetEvent::TimerStart {
                timer: Arc::clone(&self.inner),
                ms,
            },
        );
    }

    pub fn stop(&self) {
        let sock = self.inner.handle.socket();
        sock.mgr
            .maybe_enqueue(sock.tid, NetEvent::TimerStop(Arc::clone(&self.inner)));
    }

    /// Whether a deadline is pending, as last seen by the owning worker.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }
}

impl Clone for Timer {
    fn clone(&self) -> Self {
        self.inner.users.fetch_add(1, Ordering::AcqRel);
        Timer {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if self.inner.users.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.stop();
        }
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Timer")
            .field("handle", &self.inner.handle)
            .field("running", &self.is_running())
            .finish()
    }
}

/* --------------------------------------------------------------------------------- */

pub(crate) fn start_local(lw: &LocalWorker, timer: &Arc<TimerInner>, ms: u64) {
    let weak = Arc::downgrade(timer);
    let mut st = lw.state.borrow_mut();
    let previous = timer.gen.load(Ordering::Acquire);
    if previous != 0 {
        st.timers.disarm(previous);
    }
    let gen = st
        .timers
        .arm(Duration::from_millis(ms), |gen| TimerKey::User { timer: weak, gen });
    timer.gen.store(gen, Ordering::Release);
    timer.running.store(true, Ordering::Release);
}

pub(crate) fn stop_local(lw: &LocalWorker, timer: &Arc<TimerInner>) {
    let previous = timer.gen.swap(0, Ordering::AcqRel);
    if previous != 0 {
        lw.state.borrow_mut().timers.disarm(previous);
    }
    timer.running.store(false, Ordering::Release);
}

/// Runs the callback if `gen` is still the timer's live entry.
pub(crate) fn fire(timer: &Arc<TimerInner>, gen: u64) {
    if timer
        .gen
        .compare_exchange(gen, 0, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }
    timer.running.store(false, Ordering::Release);
    (timer.cb)(&timer.handle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::tests::{test_manager, wait_for};
    use crate::socket::{SocketInner, SocketOpts, SocketType};
    use crate::worker::WorkerId;

    fn client_handle() -> Handle {
        let mgr = test_manager();
        let sock = SocketInner::new(
            mgr.inner(),
            SocketType::UdpSocket,
            WorkerId(0),
            SocketOpts {
                client: true,
                ..Default::default()
            },
        );
        Handle::get(&sock, None, None)
    }

    fn counting_timer(fired: &Arc<AtomicUsize>) -> Timer {
        let fired = Arc::clone(fired);
        Timer::create(&client_handle(), move |_| {
            fired.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = counting_timer(&fired);
        timer.start(20);
        wait_for(|| fired.load(Ordering::SeqCst) == 1);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_running());
    }

    #[test]
    fn stopped_timer_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = counting_timer(&fired);
        timer.start(50);
        timer.stop();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!timer.is_running());
    }

    #[test]
    fn restart_replaces_deadline() {
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = counting_timer(&fired);
        timer.start(30);
        timer.start(400);
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(timer.is_running());
        wait_for(|| fired.load(Ordering::SeqCst) == 1);
    }

    #[test]
    fn last_clone_stops() {
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = counting_timer(&fired);
        let other = timer.clone();
        timer.start(300);
        drop(timer);
        wait_for(|| other.is_running());
        drop(other);
        std::thread::sleep(Duration::from_millis(500));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
