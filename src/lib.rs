//! # Prometheus Promise
//!
//! A promise-style chaining engine running on a dedicated worker-thread pool.
//!
//! Work is described as a chain of stages. Each stage is a closure that
//! receives the value produced by the previous one and signals how the chain
//! continues: `resolve` moves on along the success track, `reject` along the
//! failure track, and `exit` ends the chain at once. Stages run on pool
//! threads, one at a time per chain, in registration order.
//!
//! ## Key Features
//!
//! - **Exactly-once finalization**: one atomic flip decides the final status and value
//! - **Auto-chaining**: a stage that forgets to signal advances the chain anyway
//! - **Failure capture**: a stage returning `Err` or panicking rejects the chain
//! - **Round-robin dispatch**: a CAS cursor spreads work over per-thread queues
//! - **Blocking or callback completion**: wait on a signal, or take a completion callback
//! - **Combinators**: `all`, `all_settled`, `any`, `race`
//!
//! ## Example
//!
//! ```rust,ignore
//! use prometheus_promise::config::PromiseWorkerConfig;
//! use prometheus_promise::core::{Promise, PromiseStatus, PromiseValue, WorkerPool};
//!
//! let pool = WorkerPool::new(PromiseWorkerConfig::discover(None))?;
//!
//! let promise = Promise::with_value(&pool, 1_i64);
//! promise
//!     .then(|action, v| {
//!         action.resolve(PromiseValue::Value(v.into_value().unwrap_or(0) + 1))?;
//!         Ok(())
//!     })?
//!     .then(|action, v| {
//!         action.resolve(PromiseValue::Value(v.into_value().unwrap_or(0) * 10))?;
//!         Ok(())
//!     })?
//!     .start()?;
//!
//! assert_eq!(promise.wait_to()?.into_value(), Some(20));
//! assert_eq!(promise.status(), PromiseStatus::Fulfilled);
//! ```
//!
//! ## Threading Model
//!
//! The pool owns a fixed set of detached OS threads created on first use.
//! Each thread has a private unbounded queue. Callers only block inside
//! `wait_to` / `wait_for`; `wait_async` bridges that wait into tokio when the
//! `tokio-runtime` feature is enabled.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Promise engine and worker pool.
pub mod core;
/// Worker pool configuration.
pub mod config;
/// Shared utilities.
pub mod util;
