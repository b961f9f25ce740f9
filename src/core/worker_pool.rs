//! Dedicated worker threads with round-robin dispatch.
//!
//! A `WorkerPool` owns a fixed array of OS threads, each with its own private
//! unbounded queue. Calls are assigned to threads in cyclic order through a
//! compare-and-swap cursor, so a producer never takes a lock to pick a thread.
//!
//! Work items implement [`WorkerCall`] and carry an integer call id. The pool
//! routes each item to the [`WorkerCallHandler`] registered under that id; the
//! promise engine registers itself under [`PROMISE_WORKER_CALL_ID`].
//!
//! # Example
//!
//! ```rust,ignore
//! use prometheus_promise::config::PromiseWorkerConfig;
//! use prometheus_promise::core::WorkerPool;
//!
//! let pool = WorkerPool::new(PromiseWorkerConfig::new().with_worker_length(16))?;
//! let slot = pool.push(Box::new(my_call))?;
//! pool.shutdown(std::time::Duration::from_secs(2));
//! ```

mod native;

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::core::PromiseFailure;

pub use native::{WorkerPool, WorkerThread};

/// Call id reserved for the HTTP server's worker calls.
pub const HTTP_SERVER_WORKER_CALL_ID: u32 = 0;
/// Call id under which the promise engine is registered.
pub const PROMISE_WORKER_CALL_ID: u32 = 1;
/// First call id available to custom handlers.
pub const START_CUSTOM_WORKER_CALL_ID: u32 = 100;

/// A unit of work executed by a worker thread.
pub trait WorkerCall: Send {
    /// Id of the handler this call is routed to.
    fn call_id(&self) -> u32;

    /// Run the call on worker `slot`. `false` reports a failed execution.
    fn execute_call(&mut self, slot: usize) -> bool;

    /// Invoked when `execute_call` panicked.
    fn error_call(&mut self, slot: usize, error: &PromiseFailure) {
        let _ = (slot, error);
    }
}

/// Handler for every [`WorkerCall`] whose id equals [`target_id`](Self::target_id).
///
/// All hooks have pass-through defaults, so a handler only overrides what it
/// needs.
pub trait WorkerCallHandler: Send + Sync {
    /// Call id this handler serves.
    fn target_id(&self) -> u32;

    /// Called once when the pool creates its threads.
    fn init_worker_call(&self, len: usize) {
        let _ = len;
    }

    /// Called on a worker thread right after it starts.
    fn start_thread_call(&self, slot: usize) {
        let _ = slot;
    }

    /// Called on a worker thread right before it exits.
    fn end_thread_call(&self, slot: usize) {
        let _ = slot;
    }

    /// Execute a call on worker `slot`.
    fn execute_call(&self, slot: usize, call: &mut dyn WorkerCall) -> bool {
        call.execute_call(slot)
    }

    /// Report a panic raised by [`execute_call`](Self::execute_call).
    ///
    /// A panic escaping this hook terminates the worker thread.
    fn error_call(&self, slot: usize, call: &mut dyn WorkerCall, error: &PromiseFailure) {
        call.error_call(slot, error);
    }
}

/// Handler used for calls whose id has no registered handler.
struct BlankHandler;

impl WorkerCallHandler for BlankHandler {
    fn target_id(&self) -> u32 {
        u32::MAX
    }
}

/// Statistics about pool utilization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of worker threads (0 before initialization).
    pub worker_count: usize,
    /// Calls waiting in worker queues.
    pub queued_calls: u64,
    /// Calls currently executing.
    pub active_calls: u64,
    /// Total calls accepted by `push`.
    pub submitted_calls: u64,
    /// Calls that executed and reported success.
    pub completed_calls: u64,
    /// Calls that reported failure or panicked.
    pub failed_calls: u64,
}

/// Internal counters for pool statistics.
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub queued_calls: AtomicU64,
    pub active_calls: AtomicU64,
    pub submitted_calls: AtomicU64,
    pub completed_calls: AtomicU64,
    pub failed_calls: AtomicU64,
}

impl PoolCounters {
    /// Get a snapshot of current statistics.
    pub fn snapshot(&self, worker_count: usize) -> PoolStats {
        PoolStats {
            worker_count,
            queued_calls: self.queued_calls.load(Ordering::Relaxed),
            active_calls: self.active_calls.load(Ordering::Relaxed),
            submitted_calls: self.submitted_calls.load(Ordering::Relaxed),
            completed_calls: self.completed_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
        }
    }
}

/// State shared between the pool and its worker threads.
pub(crate) struct PoolShared {
    handlers: RwLock<HashMap<u32, Arc<dyn WorkerCallHandler>>>,
    fallback: Arc<dyn WorkerCallHandler>,
    pub counters: PoolCounters,
    pub stop: AtomicBool,
}

impl PoolShared {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            fallback: Arc::new(BlankHandler),
            counters: PoolCounters::default(),
            stop: AtomicBool::new(false),
        }
    }

    /// Register a handler, returning the one it replaced.
    pub fn register(&self, handler: Arc<dyn WorkerCallHandler>) -> Option<Arc<dyn WorkerCallHandler>> {
        self.handlers.write().insert(handler.target_id(), handler)
    }

    pub fn handler_for(&self, call_id: u32) -> Arc<dyn WorkerCallHandler> {
        self.handlers
            .read()
            .get(&call_id)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    pub fn handlers(&self) -> Vec<Arc<dyn WorkerCallHandler>> {
        self.handlers.read().values().cloned().collect()
    }

    /// Run one call on worker `slot`, routing it through its handler.
    pub fn dispatch(&self, slot: usize, call: &mut dyn WorkerCall) {
        self.counters.queued_calls.fetch_sub(1, Ordering::Relaxed);
        self.counters.active_calls.fetch_add(1, Ordering::Relaxed);

        let call_id = call.call_id();
        let handler = self.handler_for(call_id);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.execute_call(slot, &mut *call)));

        self.counters.active_calls.fetch_sub(1, Ordering::Relaxed);
        match outcome {
            Ok(true) => {
                self.counters.completed_calls.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => {
                self.counters.failed_calls.fetch_add(1, Ordering::Relaxed);
                debug!(worker_id = slot, call_id, "Worker call reported failure");
            }
            Err(payload) => {
                self.counters.failed_calls.fetch_add(1, Ordering::Relaxed);
                let failure = PromiseFailure::from_panic(payload);
                warn!(worker_id = slot, call_id, error = %failure, "Worker call panicked");
                handler.error_call(slot, call, &failure);
            }
        }
    }
}
