//! Network worker threads.
//!
//! Every worker owns one reactor and services a disjoint set of sockets for its whole life; a
//! socket never migrates between workers. Other threads talk to a worker exclusively through its
//! netievent queues.

pub(crate) mod event_loop;
mod pin;
pub(crate) mod queue;
pub(crate) mod timer_wheel;

pub(crate) use self::event_loop::{current_for, LocalWorker};
pub(crate) use self::pin::pin_thread_to_core;

use self::queue::EventQueues;
use crate::event::NetEvent;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use mio::{Token, Waker};
use serde::{Deserialize, Serialize};

/// Reserved reactor token for the cross-thread wakeup.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

#[derive(Debug, Copy, Clone, Hash, Ord, Eq, PartialEq, PartialOrd, Deserialize, Serialize)]
pub struct WorkerId(pub u32);

impl WorkerId {
    pub fn raw(&self) -> u32 {
        self.0
    }

    #[inline]
    pub(crate) fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/* --------------------------------------------------------------------------------- */

/// The part of a worker visible to other threads.
pub(crate) struct WorkerShared {
    pub(crate) id: WorkerId,
    pub(crate) queues: EventQueues,
    waker: Waker,
    paused: AtomicBool,
    finished: AtomicBool,
}

impl WorkerShared {
    pub(crate) fn new(id: WorkerId, waker: Waker) -> Self {
        WorkerShared {
            id,
            queues: EventQueues::new(),
            waker,
            paused: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        }
    }

    /// Queues `event` and wakes the worker's reactor.
    ///
    /// Events addressed to a worker that has already exited are abandoned.
    pub(crate) fn enqueue(&self, event: NetEvent) {
        if self.is_finished() {
            event.abandon();
            return;
        }
        self.queues.push(event);
        if let Err(e) = self.waker.wake() {
            log::error!("Failed to wake worker {}: {}", self.id, e);
        }
    }

    #[inline]
    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }
}
