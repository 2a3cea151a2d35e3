//! Stopping the world.
//!
//! While the manager is paused every worker sits in its pause phase and only PRIORITY and
//! PRIVILEGED events run, so the pausing thread has exclusive use of shared state. A worker that
//! pauses the manager from one of its own callbacks counts itself paused right away and enters
//! its pause phase once the callback returns. Each worker is counted paused and resumed exactly
//! once per pause, whichever thread drives the transition.

use super::{Manager, ManagerInner};
use crate::event::{EventClass, NetEvent};
use crate::worker::current_for;

use std::sync::atomic::Ordering;

impl ManagerInner {
    pub(crate) fn pause(&self) {
        let lw = current_for(self);
        {
            let mut sync = self.sync.lock();
            match &lw {
                Some(lw) => {
                    while sync.interlocked.map_or(false, |owner| owner != lw.id()) {
                        self.cond.wait(&mut sync);
                    }
                    sync.interlocked = Some(lw.id());
                    sync.pause_interlocked = true;
                }
                None => {
                    while sync.paused || sync.interlocked.is_some() {
                        self.cond.wait(&mut sync);
                    }
                    sync.pause_interlocked = false;
                }
            }
            sync.paused = true;
            self.paused.store(true, Ordering::Release);
        }
        log::debug!("Pausing network manager");

        for worker in &self.workers {
            match &lw {
                Some(lw) if lw.id() == worker.id => {
                    worker.set_paused(true);
                    lw.count_paused();
                    lw.request_stop();
                }
                _ => worker.enqueue(NetEvent::Pause),
            }
        }

        let mut sync = self.sync.lock();
        while sync.workers_paused < sync.workers_running {
            self.cond.wait(&mut sync);
        }
        log::debug!("Network manager paused");
    }

    pub(crate) fn resume(&self) {
        let lw = current_for(self);
        log::debug!("Resuming network manager");
        if let Some(lw) = &lw {
            lw.drain_queue(EventClass::Priority);
        }
        for worker in &self.workers {
            match &lw {
                Some(lw) if lw.id() == worker.id => {
                    worker.set_paused(false);
                    lw.drain_queue(EventClass::Privileged);
                    lw.count_resumed();
                }
                _ => worker.enqueue(NetEvent::Resume),
            }
        }

        let mut sync = self.sync.lock();
        while sync.workers_paused > 0 {
            self.cond.wait(&mut sync);
        }
        sync.paused = false;
        self.paused.store(false, Ordering::Release);
        if sync.pause_interlocked {
            sync.interlocked = None;
            sync.pause_interlocked = false;
        }
        self.cond.notify_all();
        log::debug!("Network manager resumed");
    }

    /// Takes the interlock if nobody holds it. Always fails off the workers.
    pub(crate) fn acquire_interlocked(&self) -> bool {
        let lw = match current_for(self) {
            Some(lw) => lw,
            None => return false,
        };
        let mut sync = self.sync.lock();
        if sync.interlocked.is_some() {
            return false;
        }
        sync.interlocked = Some(lw.id());
        true
    }

    /// Waits for the interlock and takes it. Does nothing off the workers.
    pub(crate) fn acquire_interlocked_force(&self) {
        let lw = match current_for(self) {
            Some(lw) => lw,
            None => return,
        };
        let mut sync = self.sync.lock();
        while sync.interlocked.is_some() {
            self.cond.wait(&mut sync);
        }
        sync.interlocked = Some(lw.id());
    }

    pub(crate) fn drop_interlocked(&self) {
        let lw = match current_for(self) {
            Some(lw) => lw,
            None => return,
        };
        let mut sync = self.sync.lock();
        if sync.interlocked != Some(lw.id()) {
            log::warn!("Worker {} dropped an interlock it does not hold", lw.id());
            return;
        }
        sync.interlocked = None;
        self.cond.notify_all();
    }
}

impl Manager {
    /// Pauses every worker and returns once all of them have stopped processing ordinary events.
    ///
    /// Pauses do not nest; a second pauser waits until the first has resumed.
    pub fn pause(&self) {
        self.inner.pause();
    }

    /// Lets paused workers continue. Privileged tasks queued during the pause run first.
    pub fn resume(&self) {
        self.inner.resume();
    }

    /// Non-blocking attempt to become the single worker allowed to pause the manager.
    pub fn acquire_interlocked(&self) -> bool {
        self.inner.acquire_interlocked()
    }

    pub fn acquire_interlocked_force(&self) {
        self.inner.acquire_interlocked_force();
    }

    pub fn drop_interlocked(&self) {
        self.inner.drop_interlocked();
    }
}

#[cfg(test)]
mod tests {
    use crate::event::{NetEvent, TaskStatus};
    use crate::memory::MemContext;
    use crate::socket::tests::wait_for;
    use crate::worker::WorkerId;
    use crate::Manager;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    use parking_lot::Mutex;

    fn counting_task(ran: &Arc<AtomicUsize>) -> impl FnMut() -> TaskStatus + Send + 'static {
        let ran = Arc::clone(ran);
        move || {
            ran.fetch_add(1, Ordering::SeqCst);
            TaskStatus::Done
        }
    }

    #[test]
    fn normal_tasks_wait_for_resume() {
        let mgr = Manager::create(Arc::new(MemContext::new("test")), 2);
        let ran = Arc::new(AtomicUsize::new(0));
        mgr.pause();
        assert!(mgr.is_paused());
        for i in 0..4 {
            let ran = Arc::clone(&ran);
            mgr.task_enqueue(
                move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                    TaskStatus::Done
                },
                Some(i),
            );
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        mgr.resume();
        assert!(!mgr.is_paused());
        for _ in 0..100 {
            if ran.load(Ordering::SeqCst) == 4 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn privileged_tasks_run_while_paused() {
        let mgr = Manager::create(Arc::new(MemContext::new("test")), 2);
        mgr.pause();
        let (tx, rx) = mpsc::channel();
        mgr.privileged_task_enqueue(
            move || {
                tx.send(()).unwrap();
                TaskStatus::Done
            },
            Some(0),
        );
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        mgr.resume();
    }

    #[test]
    fn interlock_is_worker_only() {
        let mgr = Manager::create(Arc::new(MemContext::new("test")), 1);
        assert!(!mgr.acquire_interlocked());
        mgr.drop_interlocked();

        let (tx, rx) = mpsc::channel();
        let m = mgr.clone();
        mgr.task_enqueue(
            move || {
                let first = m.acquire_interlocked();
                let second = m.acquire_interlocked();
                m.drop_interlocked();
                tx.send((first, second)).unwrap();
                TaskStatus::Done
            },
            None,
        );
        assert_eq!(rx.recv().unwrap(), (true, false));
    }

    #[test]
    fn worker_can_pause_and_resume() {
        let mgr = Manager::create(Arc::new(MemContext::new("test")), 2);
        let (tx, rx) = mpsc::channel();
        let m = mgr.clone();
        mgr.task_enqueue(
            move || {
                m.pause();
                let paused = m.is_paused();
                m.resume();
                tx.send((paused, m.is_paused())).unwrap();
                TaskStatus::Done
            },
            Some(0),
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            (true, false)
        );
    }

    #[test]
    fn worker_pause_is_resumed_from_another_thread() {
        let mgr = Manager::create(Arc::new(MemContext::new("test")), 2);
        let (tx, rx) = mpsc::channel();
        let m = mgr.clone();
        mgr.task_enqueue(
            move || {
                m.pause();
                tx.send(m.is_paused()).unwrap();
                TaskStatus::Done
            },
            Some(0),
        );
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());

        // the pausing worker stops taking ordinary work once its callback returns
        let ran = Arc::new(AtomicUsize::new(0));
        mgr.task_enqueue(counting_task(&ran), Some(0));
        mgr.task_enqueue(counting_task(&ran), Some(1));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        let (done_tx, done_rx) = mpsc::channel();
        let m = mgr.clone();
        thread::spawn(move || {
            m.resume();
            done_tx.send(()).unwrap();
        });
        assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert!(!mgr.is_paused());
        wait_for(|| ran.load(Ordering::SeqCst) == 2);

        // the interlock taken by the pause went with the resume
        let (tx, rx) = mpsc::channel();
        let m = mgr.clone();
        mgr.task_enqueue(
            move || {
                let acquired = m.acquire_interlocked();
                m.drop_interlocked();
                tx.send(acquired).unwrap();
                TaskStatus::Done
            },
            Some(1),
        );
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn privileged_task_can_resume() {
        let mgr = Manager::create(Arc::new(MemContext::new("test")), 2);
        mgr.pause();
        let (tx, rx) = mpsc::channel();
        let m = mgr.clone();
        mgr.privileged_task_enqueue(
            move || {
                m.resume();
                tx.send(m.is_paused()).unwrap();
                TaskStatus::Done
            },
            Some(0),
        );
        assert!(!rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(!mgr.is_paused());

        let ran = Arc::new(AtomicUsize::new(0));
        for i in 0..2 {
            mgr.task_enqueue(counting_task(&ran), Some(i));
        }
        wait_for(|| ran.load(Ordering::SeqCst) == 2);

        // the paused count is balanced, so a new pause completes
        mgr.pause();
        mgr.resume();
        drop(mgr);
    }

    #[test]
    fn privileged_work_precedes_later_normal_work() {
        let mgr = Manager::create(Arc::new(MemContext::new("test")), 3);
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::default();
        mgr.pause();
        for i in 0..3 {
            let order = Arc::clone(&order);
            let mut rounds = 3;
            mgr.privileged_task_enqueue(
                move || {
                    rounds -= 1;
                    if rounds > 0 {
                        return TaskStatus::Requeue;
                    }
                    order.lock().push("privileged");
                    TaskStatus::Done
                },
                Some(i),
            );
        }
        mgr.resume();
        for i in 0..3 {
            let order = Arc::clone(&order);
            mgr.inner().enqueue(
                WorkerId(i),
                NetEvent::WorkDone(Box::new(move || order.lock().push("normal"))),
            );
        }
        wait_for(|| order.lock().len() == 6);
        let order = order.lock();
        assert!(order[..3].iter().all(|kind| *kind == "privileged"), "{:?}", order);
    }
}
