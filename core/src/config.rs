//! Configuration options.
//!
//! The network manager can be built directly with [`Manager::create`](crate::Manager::create), or
//! from a configuration file that sets the worker pool, timeouts, transport limits and timer
//! resolution in one place. See [`default_config`] for a complete example.

use crate::worker::WorkerId;

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Loads a configuration file from `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<NetmgrConfig> {
    let path = path.as_ref();
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: NetmgrConfig = toml::from_str(&config_str)
        .with_context(|| format!("Invalid config file {}", path.display()))?;

    // error check config
    if config.nworkers == 0 {
        bail!("nworkers must be at least 1");
    }
    if let Some(cores) = &config.worker_cores {
        if cores.len() < config.nworkers {
            log::error!(
                "Only {} worker cores configured for {} workers: {:#?}",
                cores.len(),
                config.nworkers,
                config
            );
            bail!("worker_cores must list one core per worker");
        }
    }
    if config.timer.resolution_ms == 0 || config.timer.slots == 0 {
        bail!("timer resolution and slot count must be non-zero");
    }
    Ok(config)
}

/// Loads a default configuration.
///
/// Equivalent to the following configuration file on a host with 4 CPUs:
/// ```toml
/// nworkers = 4
/// load_balance = true
/// offload_threads = 2
///
/// [timeouts]
///     init = 30000
///     idle = 30000
///     keepalive = 30000
///     advertised = 30000
///
/// [udp]
///     max_udp = 0
///
/// [tcp]
///     backlog = 128
///     pipeline_limit = 23
///
/// [timer]
///     resolution_ms = 5
///     slots = 1024
/// ```
pub fn default_config() -> NetmgrConfig {
    NetmgrConfig::default()
}

/* --------------------------------------------------------------------------------- */

/// Network manager configuration options.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct NetmgrConfig {
    /// Number of network worker threads. Defaults to the number of available CPUs, capped at 32.
    #[serde(default = "default_nworkers")]
    pub nworkers: usize,

    /// Whether listeners open one `SO_REUSEPORT` socket per worker instead of sharing one
    /// descriptor. Defaults to `true`.
    #[serde(default = "default_load_balance")]
    pub load_balance: bool,

    /// Optional CPU cores to pin workers to, indexed by worker.
    #[serde(default)]
    pub worker_cores: Option<Vec<u32>>,

    /// Number of threads in the work offload pool. Defaults to `2`.
    #[serde(default = "default_offload_threads")]
    pub offload_threads: usize,

    /// Stream timeouts.
    #[serde(default)]
    pub timeouts: Timeouts,

    /// UDP transport settings.
    #[serde(default)]
    pub udp: UdpConfig,

    /// TCP and TCP-DNS transport settings.
    #[serde(default)]
    pub tcp: TcpConfig,

    /// Per-worker timer wheel settings.
    #[serde(default)]
    pub timer: TimerConfig,
}

impl NetmgrConfig {
    /// Returns the core that worker `id` should be pinned to, if any.
    pub(crate) fn core_for(&self, id: WorkerId) -> Option<u32> {
        self.worker_cores
            .as_ref()
            .and_then(|cores| cores.get(id.index()).copied())
    }
}

impl Default for NetmgrConfig {
    fn default() -> Self {
        NetmgrConfig {
            nworkers: default_nworkers(),
            load_balance: default_load_balance(),
            worker_cores: None,
            offload_threads: default_offload_threads(),
            timeouts: Timeouts::default(),
            udp: UdpConfig::default(),
            tcp: TcpConfig::default(),
            timer: TimerConfig::default(),
        }
    }
}

fn default_nworkers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, 32)
}

fn default_load_balance() -> bool {
    true
}

fn default_offload_threads() -> usize {
    2
}

/* --------------------------------------------------------------------------------- */

/// Stream timeouts, in milliseconds.
///
/// `init` bounds the wait for the first message on an accepted connection, `idle` the wait for
/// each following message, and `keepalive` replaces `idle` on connections that negotiated
/// keepalive. `advertised` is the keepalive value announced to peers.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    #[serde(default = "default_timeout")]
    pub init: u32,
    #[serde(default = "default_timeout")]
    pub idle: u32,
    #[serde(default = "default_timeout")]
    pub keepalive: u32,
    #[serde(default = "default_timeout")]
    pub advertised: u32,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            init: default_timeout(),
            idle: default_timeout(),
            keepalive: default_timeout(),
            advertised: default_timeout(),
        }
    }
}

fn default_timeout() -> u32 {
    30_000
}

/* --------------------------------------------------------------------------------- */

/// UDP transport options.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct UdpConfig {
    /// Largest datagram accepted or sent, in bytes. `0` disables the limit. Defaults to `0`.
    #[serde(default)]
    pub max_udp: u32,

    /// `SO_RCVBUF` applied to UDP sockets, if set.
    #[serde(default)]
    pub recv_buffer_size: Option<usize>,

    /// `SO_SNDBUF` applied to UDP sockets, if set.
    #[serde(default)]
    pub send_buffer_size: Option<usize>,
}

/// TCP and TCP-DNS transport options.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TcpConfig {
    /// Listen backlog. Defaults to `128`.
    #[serde(default = "default_backlog")]
    pub backlog: i32,

    /// Number of concurrently outstanding TCP-DNS requests on one connection before reading is
    /// paused. Defaults to `23`.
    #[serde(default = "default_pipeline_limit")]
    pub pipeline_limit: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            backlog: default_backlog(),
            pipeline_limit: default_pipeline_limit(),
        }
    }
}

fn default_backlog() -> i32 {
    128
}

fn default_pipeline_limit() -> usize {
    23
}

/* --------------------------------------------------------------------------------- */

/// Timer wheel options.
///
/// Timers fire at most one `resolution_ms` late. A wheel covers `resolution_ms * slots`
/// milliseconds per revolution; longer timers are carried over to later revolutions.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TimerConfig {
    #[serde(default = "default_timer_resolution")]
    pub resolution_ms: u64,
    #[serde(default = "default_timer_slots")]
    pub slots: usize,
}

impl Default for TimerConfig {
    fn default() -> Self {
        TimerConfig {
            resolution_ms: default_timer_resolution(),
            slots: default_timer_slots(),
        }
    }
}

fn default_timer_resolution() -> u64 {
    5
}

fn default_timer_slots() -> usize {
    1024
}
