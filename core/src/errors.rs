//! Error kinds delivered through completion callbacks.
//!
//! Per-operation failures are never propagated as panics. They reach the application as the `Err`
//! arm of the callback that would otherwise have reported success.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Result alias used throughout the network manager.
pub type NetResult<T> = Result<T, NetError>;

#[derive(Error, Debug, Clone)]
pub enum NetError {
    /// Admission control refused the operation.
    #[error("quota reached")]
    Quota,

    /// Admission control admitted the operation above its soft limit.
    #[error("soft quota reached")]
    SoftQuota,

    #[error("socket is not connected")]
    NotConnected,

    #[error("timed out")]
    TimedOut,

    #[error("operation canceled")]
    Canceled,

    #[error("end of file")]
    Eof,

    #[error("network manager is shutting down")]
    ShuttingDown,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("connection reset")]
    ConnectionReset,

    #[error("address in use")]
    AddrInUse,

    #[error("address not available")]
    AddrNotAvailable,

    /// Message exceeds a transport limit.
    #[error("message too large")]
    TooLarge,

    /// The operation must be invoked from a network worker thread.
    #[error("not running on a network worker")]
    NotWorker,

    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
}

impl NetError {
    /// Severity used when a socket-level failure is logged.
    pub fn log_level(&self) -> log::Level {
        match self {
            NetError::NotConnected
            | NetError::ConnectionReset
            | NetError::ConnectionRefused
            | NetError::Eof => log::Level::Info,
            NetError::Quota | NetError::SoftQuota | NetError::Canceled | NetError::TimedOut => {
                log::Level::Debug
            }
            NetError::ShuttingDown => log::Level::Debug,
            NetError::AddrInUse | NetError::AddrNotAvailable | NetError::TooLarge => {
                log::Level::Warn
            }
            NetError::NotWorker | NetError::Io(_) => log::Level::Error,
        }
    }

    /// Returns `true` if the error is the result of a cancellation or shutdown rather than a
    /// transport failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, NetError::Canceled | NetError::ShuttingDown)
    }
}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotConnected => NetError::NotConnected,
            io::ErrorKind::TimedOut => NetError::TimedOut,
            io::ErrorKind::ConnectionRefused => NetError::ConnectionRefused,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                NetError::ConnectionReset
            }
            io::ErrorKind::BrokenPipe => NetError::ConnectionReset,
            io::ErrorKind::AddrInUse => NetError::AddrInUse,
            io::ErrorKind::AddrNotAvailable => NetError::AddrNotAvailable,
            io::ErrorKind::UnexpectedEof => NetError::Eof,
            _ => NetError::Io(Arc::new(err)),
        }
    }
}

impl PartialEq for NetError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (NetError::Io(a), NetError::Io(b)) => a.kind() == b.kind(),
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

/// Logs a socket-level failure at the severity its kind calls for.
pub(crate) fn log_failure(context: &str, err: &NetError) {
    log::log!(err.log_level(), "{}: {}", context, err);
}
