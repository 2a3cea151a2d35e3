//! Blocking work run off the network workers.
//!
//! A small pool of threads pulls jobs from a shared channel. Each job returns a completion that
//! is sent back to the worker the job came from and runs there as a NORMAL netievent.

use crate::errors::{NetError, NetResult};
use crate::event::{Completion, NetEvent};
use crate::manager::fatal;
use crate::worker::{WorkerId, WorkerShared};

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

pub(crate) type Job = Box<dyn FnOnce() -> Completion + Send>;

struct Work {
    origin: WorkerId,
    job: Job,
}

pub(crate) struct OffloadPool {
    sender: Mutex<Option<Sender<Work>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl OffloadPool {
    pub(crate) fn new(nthreads: usize, workers: Vec<Arc<WorkerShared>>) -> OffloadPool {
        let (sender, receiver) = channel::unbounded();
        let workers = Arc::new(workers);
        let threads = (0..nthreads.max(1))
            .map(|i| {
                let receiver = receiver.clone();
                let workers = Arc::clone(&workers);
                thread::Builder::new()
                    .name(format!("netmgr-offload-{}", i))
                    .spawn(move || run(receiver, workers))
                    .unwrap_or_else(|e| fatal("Failed to spawn offload thread", e))
            })
            .collect();
        OffloadPool {
            sender: Mutex::new(Some(sender)),
            threads: Mutex::new(threads),
        }
    }

    /// Queues `job`; its completion will run on `origin`.
    pub(crate) fn submit(&self, origin: WorkerId, job: Job) -> NetResult<()> {
        match &*self.sender.lock() {
            Some(sender) => sender
                .send(Work { origin, job })
                .map_err(|_| NetError::ShuttingDown),
            None => Err(NetError::ShuttingDown),
        }
    }

    /// Stops accepting work and waits for queued jobs to finish.
    pub(crate) fn shutdown(&self) {
        self.sender.lock().take();
        let me = thread::current().id();
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for thread in threads {
            if thread.thread().id() == me {
                continue;
            }
            if thread.join().is_err() {
                log::error!("Offload thread panicked");
            }
        }
    }
}

fn run(receiver: Receiver<Work>, workers: Arc<Vec<Arc<WorkerShared>>>) {
    for Work { origin, job } in receiver.iter() {
        let completion = job();
        match workers.get(origin.index()) {
            Some(worker) => worker.enqueue(NetEvent::WorkDone(completion)),
            None => log::warn!("Dropping offload completion for unknown worker {}", origin),
        }
    }
    log::debug!("Offload thread exiting");
}
