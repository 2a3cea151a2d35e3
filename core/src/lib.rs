#![allow(clippy::needless_doctest_main)]

//! An asynchronous network I/O engine for servers that speak UDP, TCP and DNS over TCP.
//!
//! A [`Manager`] runs a fixed pool of worker threads, each with its own reactor and event
//! queues. Sockets never migrate between workers: anything that touches a socket from another
//! thread is turned into a netievent and executed on the socket's worker. Applications see
//! sockets through reference-counted [`Handle`]s and receive every result through callbacks that
//! run on the socket's worker.
//!
//! Beyond plain I/O the manager provides:
//!
//! - Sharded listeners with one child socket per worker
//! - Accept quotas ([`Quota`]) and TCP-DNS request pipelining limits
//! - Read, write and connect timeouts, plus handle-bound one-shot [`Timer`]s
//! - Scheduled tasks, privileged tasks, and a pool for blocking work
//! - A two-phase pause/resume barrier and a single-worker interlock
//!
//! The following example runs a UDP echo service until the process is interrupted:
//!
//! ```no_run
//! use netmgr_core::config::default_config;
//! use netmgr_core::Manager;
//!
//! fn main() {
//!     let mgr = Manager::from_config(&default_config());
//!     let _listener = mgr
//!         .listen_udp("0.0.0.0:5300".parse().unwrap(), |handle, result| match result {
//!             Ok(msg) => handle.send(msg, |_, _| {}),
//!             Err(e) => log::debug!("receive failed: {}", e),
//!         })
//!         .unwrap();
//!     std::thread::park();
//! }
//! ```

pub mod config;
pub mod errors;
pub(crate) mod event;
pub mod manager;
pub mod memory;
pub(crate) mod offload;
pub mod quota;
pub mod socket;
pub mod stats;
pub mod timer;
pub(crate) mod worker;

pub use self::errors::{NetError, NetResult};
pub use self::event::TaskStatus;
pub use self::manager::Manager;
pub use self::memory::{MemContext, MemStats};
pub use self::quota::{Quota, QuotaGuard};
pub use self::socket::{Handle, Listener, ResetFn, SocketType};
pub use self::stats::{Counter, Stats};
pub use self::timer::Timer;
pub use self::worker::WorkerId;
