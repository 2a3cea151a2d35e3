//! Cross-thread netievents.
//!
//! A netievent describes one deferred operation. It may be created on any thread but is executed
//! only on its target worker, exactly once.

use crate::errors::{NetError, NetResult};
use crate::socket::handle::{self, Handle, HandleInner};
use crate::socket::listener::PendingIo;
use crate::socket::request::Request;
use crate::socket::{self, RecvCb, SocketInner};
use crate::timer::TimerInner;

use std::fmt;
use std::sync::Arc;

/// Queue classes, highest priority first.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub(crate) enum EventClass {
    /// `pause`, `resume` and `stop`. Processed even while paused.
    Priority = 0,
    /// Privileged tasks. Processed while paused and drained before a resume completes.
    Privileged = 1,
    /// Ordinary scheduled tasks.
    Task = 2,
    /// Everything else.
    Normal = 3,
}

impl EventClass {
    pub(crate) const ALL: [EventClass; 4] = [
        EventClass::Priority,
        EventClass::Privileged,
        EventClass::Task,
        EventClass::Normal,
    ];

    #[inline]
    pub(crate) fn index(self) -> usize {
        self as usize
    }

    /// Whether events of this class may run on a paused worker.
    #[inline]
    pub(crate) fn runs_while_paused(self) -> bool {
        matches!(self, EventClass::Priority | EventClass::Privileged)
    }
}

/// Returned by a task to tell the worker whether it has more work to do.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Done,
    /// Put the task back at the end of its queue.
    Requeue,
}

pub(crate) type Task = Box<dyn FnMut() -> TaskStatus + Send>;

/// Closure run on a worker thread once its work item completes.
pub(crate) type Completion = Box<dyn FnOnce() + Send>;

/* --------------------------------------------------------------------------------- */

pub(crate) enum NetEvent {
    Pause,
    Resume,
    Stop,

    PrivilegedTask(Task),
    Task(Task),

    /// Start a listener child with the socket bound for it by the caller.
    Listen {
        sock: Arc<SocketInner>,
        io: PendingIo,
    },
    StopListening(Arc<SocketInner>),
    /// Retry accepting on a listener child after its quota freed a slot.
    Accept(Arc<SocketInner>),
    UdpConnect(Box<Request>),
    TcpConnect(Box<Request>),
    Send(Box<Request>),
    Read {
        handle: Handle,
        cb: RecvCb,
    },
    CancelRead(Handle),
    PauseRead(Handle),
    ResumeRead(Handle),
    /// Restart the read timer after a timeout change.
    RestartTimer(Handle),
    Close(Arc<SocketInner>),
    Detach(Arc<HandleInner>),
    Shutdown,

    ConnectCb {
        req: Box<Request>,
        result: NetResult<()>,
    },
    SendCb {
        req: Box<Request>,
        result: NetResult<()>,
    },
    ReadCb {
        handle: Handle,
        cb: RecvCb,
        result: NetError,
    },

    TimerStart {
        timer: Arc<TimerInner>,
        ms: u64,
    },
    TimerStop(Arc<TimerInner>),

    WorkDone(Completion),
}

impl NetEvent {
    pub(crate) fn class(&self) -> EventClass {
        match self {
            NetEvent::Pause | NetEvent::Resume | NetEvent::Stop => EventClass::Priority,
            NetEvent::PrivilegedTask(_) => EventClass::Privileged,
            NetEvent::Task(_) => EventClass::Task,
            _ => EventClass::Normal,
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            NetEvent::Pause => "pause",
            NetEvent::Resume => "resume",
            NetEvent::Stop => "stop",
            NetEvent::PrivilegedTask(_) => "privileged-task",
            NetEvent::Task(_) => "task",
            NetEvent::Listen { .. } => "listen",
            NetEvent::StopListening(_) => "stoplistening",
            NetEvent::Accept(_) => "accept",
            NetEvent::UdpConnect(_) => "udpconnect",
            NetEvent::TcpConnect(_) => "tcpconnect",
            NetEvent::Send(_) => "send",
            NetEvent::Read { .. } => "read",
            NetEvent::CancelRead(_) => "cancelread",
            NetEvent::PauseRead(_) => "pauseread",
            NetEvent::ResumeRead(_) => "resumeread",
            NetEvent::RestartTimer(_) => "restarttimer",
            NetEvent::Close(_) => "close",
            NetEvent::Detach(_) => "detach",
            NetEvent::Shutdown => "shutdown",
            NetEvent::ConnectCb { .. } => "connectcb",
            NetEvent::SendCb { .. } => "sendcb",
            NetEvent::ReadCb { .. } => "readcb",
            NetEvent::TimerStart { .. } => "timerstart",
            NetEvent::TimerStop(_) => "timerstop",
            NetEvent::WorkDone(_) => "workdone",
        }
    }

    /// Disposes of an event whose target worker has already exited.
    ///
    /// Socket and handle bookkeeping still has to unwind so that references reach zero; user
    /// callbacks carried by the event are dropped without being invoked.
    pub(crate) fn abandon(self) {
        log::debug!("Abandoning {} event, worker has exited", self.name());
        match self {
            NetEvent::Detach(inner) => handle::finalize(inner, None),
            NetEvent::Close(sock)
            | NetEvent::StopListening(sock)
            | NetEvent::Listen { sock, .. } => socket::close_offline(&sock),
            _ => {}
        }
    }
}

impl fmt::Debug for NetEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "NetEvent::{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_follow_event_kind() {
        assert_eq!(NetEvent::Pause.class(), EventClass::Priority);
        assert_eq!(NetEvent::Stop.class(), EventClass::Priority);
        let task: Task = Box::new(|| TaskStatus::Done);
        assert_eq!(NetEvent::PrivilegedTask(task).class(), EventClass::Privileged);
        let task: Task = Box::new(|| TaskStatus::Done);
        assert_eq!(NetEvent::Task(task).class(), EventClass::Task);
        assert_eq!(NetEvent::Shutdown.class(), EventClass::Normal);
        assert_eq!(NetEvent::WorkDone(Box::new(|| {})).class(), EventClass::Normal);
        assert!(EventClass::Privileged.runs_while_paused());
        assert!(!EventClass::Normal.runs_while_paused());
    }
}
