//! Worker pool configuration.
//!
//! The worker count is resolved in this order: `<dir>/promise.json`, the
//! `PROMISE_WORKER_*` environment variables (a `.env` file is honoured), and
//! finally `available parallelism × 4`. Every configured count is clamped to
//! `[MIN_WORKER_LENGTH, MAX_WORKER_LENGTH]`.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::PromiseError;

/// Smallest worker count a configuration can produce.
pub const MIN_WORKER_LENGTH: usize = 8;
/// Largest worker count a pool accepts.
pub const MAX_WORKER_LENGTH: usize = 32_768;
/// Workers per available CPU when nothing is configured.
pub const WORKER_COEFFICIENT: usize = 4;
/// Default bounded wait of an idle worker before it re-checks its stop flag.
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 1_000;
/// File name looked up by [`PromiseWorkerConfig::load`].
pub const CONFIG_FILE_NAME: &str = "promise.json";
/// Environment variables consulted for the worker count, first numeric wins.
pub const WORKER_LENGTH_ENV_KEYS: [&str; 4] = [
    "PROMISE_WORKER_SIZE",
    "PROMISE_WORKER_LENGTH",
    "PROMISE_WORKER",
    "PROMISE_LENGTH",
];

const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;
const MIN_STACK_SIZE: usize = 64 * 1024;

/// Configuration for a promise [`WorkerPool`](crate::core::WorkerPool).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromiseWorkerConfig {
    /// Requested worker count; `None` uses the CPU-derived default.
    #[serde(alias = "workerLength")]
    pub worker_length: Option<usize>,
    /// Idle wait before a worker re-checks its stop flag, in milliseconds.
    pub wait_timeout_ms: u64,
    /// Stack size of each worker thread in bytes.
    pub thread_stack_size: usize,
    /// Thread name prefix; workers are named `<prefix>-<index>`.
    pub thread_name_prefix: String,
}

impl Default for PromiseWorkerConfig {
    fn default() -> Self {
        Self {
            worker_length: None,
            wait_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
            thread_stack_size: DEFAULT_STACK_SIZE,
            thread_name_prefix: "promise-worker".into(),
        }
    }
}

impl PromiseWorkerConfig {
    /// Create a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the requested worker count.
    #[must_use]
    pub fn with_worker_length(mut self, len: usize) -> Self {
        self.worker_length = Some(len);
        self
    }

    /// Set the idle wait timeout in milliseconds.
    #[must_use]
    pub fn with_wait_timeout_ms(mut self, ms: u64) -> Self {
        self.wait_timeout_ms = ms;
        self
    }

    /// Set the worker thread stack size.
    #[must_use]
    pub fn with_thread_stack_size(mut self, bytes: usize) -> Self {
        self.thread_stack_size = bytes;
        self
    }

    /// Set the worker thread name prefix.
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.wait_timeout_ms == 0 {
            return Err("wait_timeout_ms must be greater than 0".into());
        }
        if self.thread_stack_size < MIN_STACK_SIZE {
            return Err(format!("thread_stack_size must be at least {MIN_STACK_SIZE} bytes"));
        }
        if self.thread_name_prefix.trim().is_empty() {
            return Err("thread_name_prefix must not be empty".into());
        }
        Ok(())
    }

    /// Parse a configuration from a JSON string and validate it.
    ///
    /// # Errors
    ///
    /// `PromiseError::InvalidConfig` if the JSON does not parse or fails [`validate`](Self::validate).
    pub fn from_json_str(input: &str) -> Result<Self, PromiseError> {
        let cfg: Self = serde_json::from_str(input)
            .map_err(|e| PromiseError::InvalidConfig(format!("parse error: {e}")))?;
        cfg.validate().map_err(PromiseError::InvalidConfig)?;
        Ok(cfg)
    }

    /// Load `<dir>/promise.json`. Returns `Ok(None)` when the file does not exist.
    ///
    /// # Errors
    ///
    /// `PromiseError::InvalidConfig` if the file exists but cannot be read
    /// or does not hold a valid configuration.
    pub fn load(dir: &Path) -> Result<Option<Self>, PromiseError> {
        let path = dir.join(CONFIG_FILE_NAME);
        if !path.is_file() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            PromiseError::InvalidConfig(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw).map(Some)
    }

    /// Read the worker count from the environment, loading `.env` first.
    ///
    /// Returns `None` when no key holds a number.
    #[must_use]
    pub fn from_env() -> Option<Self> {
        let _ = dotenvy::dotenv();
        Self::worker_length_from(|key| std::env::var(key).ok())
            .map(|len| Self::default().with_worker_length(len))
    }

    fn worker_length_from<F>(lookup: F) -> Option<usize>
    where
        F: Fn(&str) -> Option<String>,
    {
        WORKER_LENGTH_ENV_KEYS
            .iter()
            .find_map(|key| lookup(key).and_then(|raw| raw.trim().parse::<usize>().ok()))
    }

    /// Resolve a configuration: JSON file in `dir`, then environment, then defaults.
    #[must_use]
    pub fn discover(dir: Option<&Path>) -> Self {
        if let Some(dir) = dir {
            match Self::load(dir) {
                Ok(Some(cfg)) => {
                    debug!(dir = %dir.display(), "promise worker config loaded from file");
                    return cfg;
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "ignoring unreadable promise worker config"),
            }
        }
        Self::from_env().unwrap_or_default()
    }

    /// Worker count this configuration produces, clamped to the allowed range.
    #[must_use]
    pub fn resolve_worker_length(&self) -> usize {
        self.worker_length
            .map_or_else(Self::default_worker_length, Self::clamp_worker_length)
    }

    /// CPU-derived default worker count.
    #[must_use]
    pub fn default_worker_length() -> usize {
        Self::clamp_worker_length(num_cpus::get().saturating_mul(WORKER_COEFFICIENT))
    }

    /// Clamp a worker count to `[MIN_WORKER_LENGTH, MAX_WORKER_LENGTH]`.
    #[must_use]
    pub fn clamp_worker_length(len: usize) -> usize {
        len.clamp(MIN_WORKER_LENGTH, MAX_WORKER_LENGTH)
    }
}
