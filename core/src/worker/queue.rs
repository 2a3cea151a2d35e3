//! Per-worker netievent queues.

use crate::event::{EventClass, NetEvent};

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

/// Four FIFO queues, one lock each, plus a condition variable used to wake a paused worker when
/// PRIORITY or PRIVILEGED work arrives.
///
/// Lock order is ascending by class index. A thread holding a lower-priority queue lock never
/// takes a higher-priority one.
pub(crate) struct EventQueues {
    queues: [Mutex<VecDeque<NetEvent>>; 4],
    priority_cond: Condvar,
}

impl EventQueues {
    pub(crate) fn new() -> Self {
        EventQueues {
            queues: std::array::from_fn(|_| Mutex::new(VecDeque::new())),
            priority_cond: Condvar::new(),
        }
    }

    pub(crate) fn push(&self, event: NetEvent) {
        let class = event.class();
        self.queues[class.index()].lock().push_back(event);
        if class.runs_while_paused() {
            let _guard = self.queues[EventClass::Priority.index()].lock();
            self.priority_cond.notify_all();
        }
    }

    /// Takes every queued event of `class`.
    ///
    /// Returns `None` without taking anything if a higher-priority queue is non-empty, so that
    /// an event enqueued after a higher-priority one is never run before it.
    pub(crate) fn take(&self, class: EventClass) -> Option<VecDeque<NetEvent>> {
        let higher: Vec<_> = EventClass::ALL[..class.index()]
            .iter()
            .map(|c| self.queues[c.index()].lock())
            .collect();
        if higher.iter().any(|q| !q.is_empty()) {
            return None;
        }
        let taken = std::mem::take(&mut *self.queues[class.index()].lock());
        drop(higher);
        Some(taken)
    }

    /// Takes every queued event of `class` regardless of other queues.
    pub(crate) fn take_all(&self, class: EventClass) -> VecDeque<NetEvent> {
        std::mem::take(&mut *self.queues[class.index()].lock())
    }

    /// Puts back the unprocessed remainder of a taken batch, ahead of anything queued since.
    pub(crate) fn requeue_front(&self, class: EventClass, mut remainder: VecDeque<NetEvent>) {
        if remainder.is_empty() {
            return;
        }
        let mut queue = self.queues[class.index()].lock();
        remainder.append(&mut queue);
        *queue = remainder;
    }

    pub(crate) fn is_empty(&self, class: EventClass) -> bool {
        self.queues[class.index()].lock().is_empty()
    }

    /// Whether any queue a worker in the given state would process holds work.
    pub(crate) fn has_work(&self, paused: bool) -> bool {
        EventClass::ALL
            .iter()
            .filter(|c| !paused || c.runs_while_paused())
            .any(|c| !self.is_empty(*c))
    }

    /// Blocks until PRIORITY or PRIVILEGED work is queued.
    pub(crate) fn wait_privileged(&self) {
        let mut priority = self.queues[EventClass::Priority.index()].lock();
        loop {
            if !priority.is_empty() {
                return;
            }
            if !self.queues[EventClass::Privileged.index()].lock().is_empty() {
                return;
            }
            self.priority_cond.wait(&mut priority);
        }
    }

    /// Drops every queued event, lowest priority first.
    pub(crate) fn drain_all(&self) -> Vec<NetEvent> {
        let mut events = vec![];
        for class in EventClass::ALL.iter().rev() {
            events.extend(self.take_all(*class));
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TaskStatus;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn task() -> NetEvent {
        NetEvent::Task(Box::new(|| TaskStatus::Done))
    }

    #[test]
    fn higher_class_blocks_take() {
        let queues = EventQueues::new();
        queues.push(task());
        queues.push(NetEvent::Shutdown);
        assert!(queues.take(EventClass::Normal).is_none());

        let tasks = queues.take(EventClass::Task).unwrap();
        assert_eq!(tasks.len(), 1);
        let normal = queues.take(EventClass::Normal).unwrap();
        assert_eq!(normal.len(), 1);
        assert!(!queues.has_work(false));
    }

    #[test]
    fn requeue_keeps_order() {
        let queues = EventQueues::new();
        queues.push(NetEvent::Pause);
        queues.push(NetEvent::Resume);
        let mut batch = queues.take_all(EventClass::Priority);
        let first = batch.pop_front().unwrap();
        assert_eq!(first.name(), "pause");
        queues.push(NetEvent::Stop);
        queues.requeue_front(EventClass::Priority, batch);

        let names: Vec<_> = queues
            .take_all(EventClass::Priority)
            .iter()
            .map(|e| e.name())
            .collect();
        assert_eq!(names, vec!["resume", "stop"]);
    }

    #[test]
    fn paused_state_ignores_normal_work() {
        let queues = EventQueues::new();
        queues.push(NetEvent::Shutdown);
        assert!(queues.has_work(false));
        assert!(!queues.has_work(true));
    }

    #[test]
    fn wait_privileged_wakes_on_push() {
        let queues = Arc::new(EventQueues::new());
        let q = Arc::clone(&queues);
        let waiter = thread::spawn(move || {
            q.wait_privileged();
            q.take_all(EventClass::Privileged).len()
        });
        thread::sleep(Duration::from_millis(20));
        queues.push(NetEvent::PrivilegedTask(Box::new(|| TaskStatus::Done)));
        assert_eq!(waiter.join().unwrap(), 1);
    }
}
