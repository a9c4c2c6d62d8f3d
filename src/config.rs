//! Worker pool configuration.
//!
//! # Environment Variables
//!
//! - `PWA_WORKERS` - Number of workers (default: available parallelism)
//! - `PWA_DUPLEX` - `true` for request/response workers, `false` for compute-once
//! - `PWA_BACKEND` - Execution unit: `fork` (default) or `thread`
//! - `PWA_SHUTDOWN_TIMEOUT_MS` - Bounded wait for workers on close

use crate::error::{ForemanError, Result};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default bounded wait for workers to exit on close.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// How workers talk to the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    /// Workers answer one request per `run` until shut down.
    #[default]
    Duplex,
    /// Workers compute once right after setup and report a single result.
    Simplex,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplex => write!(f, "duplex"),
            Self::Simplex => write!(f, "simplex"),
        }
    }
}

/// What kind of execution unit hosts each worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backend {
    /// Forked OS process with its own address space.
    #[default]
    Fork,
    /// OS thread in the parent process, speaking the same pipe protocol.
    ///
    /// Panics inside `process` are still reported per call, but a hard
    /// crash takes the parent down with it.
    Thread,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fork" | "process" => Ok(Self::Fork),
            "thread" => Ok(Self::Thread),
            _ => Err(format!(
                "Unknown backend: '{}'. Valid options: fork, thread",
                s
            )),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fork => write!(f, "fork"),
            Self::Thread => write!(f, "thread"),
        }
    }
}

/// Configuration for a worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of workers, one shard each.
    pub worker_count: usize,
    /// Duplex or simplex workers.
    pub mode: Mode,
    /// Process or thread workers.
    pub backend: Backend,
    /// How long `close` waits before force-terminating workers.
    pub shutdown_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            mode: Mode::Duplex,
            backend: Backend::Fork,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Host processor count, falling back to 1.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Shorthand for `with_mode(Mode::Duplex)` / `with_mode(Mode::Simplex)`.
    pub fn duplex(self, duplex: bool) -> Self {
        self.with_mode(if duplex { Mode::Duplex } else { Mode::Simplex })
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Apply environment variable overrides.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var("PWA_WORKERS") {
            match value.parse::<usize>() {
                Ok(n) => self.worker_count = n,
                Err(_) => tracing::warn!(value = %value, "Ignoring invalid PWA_WORKERS"),
            }
        }

        if let Ok(value) = std::env::var("PWA_DUPLEX") {
            match parse_bool(&value) {
                Some(duplex) => self = self.duplex(duplex),
                None => tracing::warn!(value = %value, "Ignoring invalid PWA_DUPLEX"),
            }
        }

        if let Ok(value) = std::env::var("PWA_BACKEND") {
            match value.parse() {
                Ok(backend) => self.backend = backend,
                Err(e) => tracing::warn!(error = %e, "Ignoring invalid PWA_BACKEND"),
            }
        }

        if let Ok(value) = std::env::var("PWA_SHUTDOWN_TIMEOUT_MS")
            && let Ok(ms) = value.parse::<u64>()
        {
            self.shutdown_timeout = Duration::from_millis(ms);
        }

        self
    }

    /// Check the configuration before any worker is spawned.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(ForemanError::Config(
                "worker_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
