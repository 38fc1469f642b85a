//! Broker configuration.
//!
//! Read from an optional JSON file (`--config` or `IPC_BROKER_CONFIG`),
//! then overridden by environment variables and finally by command-line
//! flags. Every file field has a default, so an empty object is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

use crate::correlator::CorrelatorConfig;
use crate::dispatcher::DispatcherConfig;
use crate::pool::PoolConfig;
use crate::transport::unix::default_socket_path;

/// Path of the JSON configuration file.
pub const CONFIG_ENV: &str = "IPC_BROKER_CONFIG";
/// Broker socket path; also how spawned workers find the broker.
pub const SOCKET_ENV: &str = "IPC_BROKER_SOCKET";
/// Connection cap override.
pub const MAX_CONNECTIONS_ENV: &str = "IPC_BROKER_MAX_CONNECTIONS";
/// Log level handed from the broker to its workers.
pub const LOG_LEVEL_ENV: &str = "IPC_BROKER_LOG";

/// Configuration as written in the JSON file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfigFile {
    /// Socket path; defaults to the per-user runtime directory.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    /// Permission bits of the socket file.
    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,

    /// Connection cap.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Capacity one worker process may carry.
    #[serde(default = "default_max_cost")]
    pub max_cost_per_process: u32,

    /// Bound of each dispatcher queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Tasks draining each dispatcher queue.
    #[serde(default = "default_workers_per_queue")]
    pub workers_per_queue: usize,

    /// How long a spawned worker has to register.
    #[serde(default = "default_spawn_timeout")]
    pub spawn_timeout_seconds: u64,

    /// Wait slice of a pending request.
    #[serde(default = "default_wait_slice")]
    pub wait_slice_ms: u64,

    /// Slices without a response before a warning is logged.
    #[serde(default = "default_warn_after_slices")]
    pub warn_after_slices: u32,

    /// Idle time before an empty worker may be collected.
    #[serde(default = "default_idle_grace")]
    pub idle_grace_seconds: u64,

    /// Maximum time between garbage collection passes.
    #[serde(default = "default_gc_interval")]
    pub gc_interval_seconds: u64,

    /// Tick of the accept loop.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Restart units whose worker crashed.
    #[serde(default = "default_true")]
    pub restart_on_crash: bool,

    /// Worker program; defaults to this binary's `worker` subcommand.
    #[serde(default)]
    pub worker_exec: Option<PathBuf>,

    /// Arguments for `worker_exec`.
    #[serde(default)]
    pub worker_args: Vec<String>,
}

impl Default for BrokerConfigFile {
    fn default() -> Self {
        Self {
            socket_path: None,
            socket_mode: default_socket_mode(),
            max_connections: default_max_connections(),
            max_cost_per_process: default_max_cost(),
            queue_capacity: default_queue_capacity(),
            workers_per_queue: default_workers_per_queue(),
            spawn_timeout_seconds: default_spawn_timeout(),
            wait_slice_ms: default_wait_slice(),
            warn_after_slices: default_warn_after_slices(),
            idle_grace_seconds: default_idle_grace(),
            gc_interval_seconds: default_gc_interval(),
            poll_interval_ms: default_poll_interval(),
            restart_on_crash: true,
            worker_exec: None,
            worker_args: Vec::new(),
        }
    }
}

const fn default_socket_mode() -> u32 {
    0o660
}

const fn default_max_connections() -> usize {
    100
}

const fn default_max_cost() -> u32 {
    40
}

const fn default_queue_capacity() -> usize {
    1000
}

const fn default_workers_per_queue() -> usize {
    5
}

const fn default_spawn_timeout() -> u64 {
    30
}

const fn default_wait_slice() -> u64 {
    1000
}

const fn default_warn_after_slices() -> u32 {
    60
}

const fn default_idle_grace() -> u64 {
    60
}

const fn default_gc_interval() -> u64 {
    60
}

const fn default_poll_interval() -> u64 {
    100
}

const fn default_true() -> bool {
    true
}

/// Runtime configuration with `Duration` fields.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub socket_path: PathBuf,
    /// Permission bits of the socket file.
    pub socket_mode: u32,
    /// Connection cap.
    pub max_connections: usize,
    pub pool: PoolConfig,
    pub dispatcher: DispatcherConfig,
    pub correlator: CorrelatorConfig,
    /// Garbage collection runs at least this often.
    pub gc_interval: Duration,
    /// Tick of the accept loop.
    pub poll_interval: Duration,
    /// Worker program, `None` for this binary.
    pub worker_exec: Option<PathBuf>,
    pub worker_args: Vec<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::from_file_config(BrokerConfigFile::default())
    }
}

impl BrokerConfig {
    /// Convert file values to runtime units.
    pub fn from_file_config(file: BrokerConfigFile) -> Self {
        Self {
            socket_path: file.socket_path.unwrap_or_else(default_socket_path),
            socket_mode: file.socket_mode,
            max_connections: file.max_connections,
            pool: PoolConfig {
                max_cost_per_process: file.max_cost_per_process,
                spawn_timeout: Duration::from_secs(file.spawn_timeout_seconds),
                idle_grace: Duration::from_secs(file.idle_grace_seconds),
                restart_on_crash: file.restart_on_crash,
            },
            dispatcher: DispatcherConfig {
                queue_capacity: file.queue_capacity,
                workers_per_queue: file.workers_per_queue,
            },
            correlator: CorrelatorConfig {
                wait_slice: Duration::from_millis(file.wait_slice_ms),
                warn_after_slices: file.warn_after_slices,
            },
            gc_interval: Duration::from_secs(file.gc_interval_seconds),
            poll_interval: Duration::from_millis(file.poll_interval_ms),
            worker_exec: file.worker_exec,
            worker_args: file.worker_args,
        }
    }

    /// Parse a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let file: BrokerConfigFile = serde_json::from_str(json).context("Failed to parse broker configuration")?;
        Ok(Self::from_file_config(file))
    }

    /// Read a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_json(&json).with_context(|| format!("Invalid config file {}", path.display()))?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Load from `path`, else from `IPC_BROKER_CONFIG`, else defaults; then
    /// apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match path.or(from_env.as_deref()) {
            Some(path) => Self::from_file(path)?,
            None => {
                debug!("No config file, using defaults");
                Self::default()
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `IPC_BROKER_SOCKET` and `IPC_BROKER_MAX_CONNECTIONS` as seen by `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(socket) = lookup(SOCKET_ENV).filter(|s| !s.is_empty()) {
            self.socket_path = PathBuf::from(socket);
        }
        if let Some(max) = lookup(MAX_CONNECTIONS_ENV) {
            self.max_connections = max
                .parse()
                .with_context(|| format!("{MAX_CONNECTIONS_ENV} must be a number, got {max:?}"))?;
        }
        Ok(())
    }

    /// Check limits and the ordering spawn timeout < response warning
    /// horizon <= idle grace.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.max_connections > 0, "max_connections must be positive");
        anyhow::ensure!(self.pool.max_cost_per_process > 0, "max_cost_per_process must be positive");
        anyhow::ensure!(self.dispatcher.queue_capacity > 0, "queue_capacity must be positive");
        anyhow::ensure!(self.dispatcher.workers_per_queue > 0, "workers_per_queue must be positive");
        anyhow::ensure!(!self.correlator.wait_slice.is_zero(), "wait_slice_ms must be positive");
        anyhow::ensure!(!self.poll_interval.is_zero(), "poll_interval_ms must be positive");

        let horizon = self
            .correlator
            .wait_slice
            .checked_mul(self.correlator.warn_after_slices)
            .context("response warning horizon (wait_slice_ms x warn_after_slices) is out of range")?;
        anyhow::ensure!(
            self.pool.spawn_timeout < horizon,
            "spawn timeout ({:?}) must be shorter than the response warning horizon ({horizon:?})",
            self.pool.spawn_timeout
        );
        anyhow::ensure!(
            horizon <= self.pool.idle_grace,
            "response warning horizon ({horizon:?}) must not exceed the idle grace period ({:?})",
            self.pool.idle_grace
        );
        Ok(())
    }

    /// Connection count at which garbage collection runs early (89 %).
    pub const fn gc_pressure_threshold(&self) -> usize {
        self.max_connections.saturating_mul(89) / 100
    }

    /// Program and arguments used to spawn workers.
    pub fn worker_command(&self) -> Result<(PathBuf, Vec<String>)> {
        match &self.worker_exec {
            Some(exec) => Ok((exec.clone(), self.worker_args.clone())),
            None => {
                let exe = std::env::current_exe().context("Cannot locate the broker executable")?;
                Ok((exe, vec!["worker".to_string()]))
            }
        }
    }
}
