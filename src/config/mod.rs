//! Configuration models for the promise worker pool.

pub mod worker;

pub use worker::{
    PromiseWorkerConfig, CONFIG_FILE_NAME, DEFAULT_WAIT_TIMEOUT_MS, MAX_WORKER_LENGTH,
    MIN_WORKER_LENGTH, WORKER_COEFFICIENT, WORKER_LENGTH_ENV_KEYS,
};
