//! Integration tests for WorkerPool
//!
//! These tests validate:
//! - Round-robin assignment
//! - Custom call handlers and their lifecycle hooks
//! - Failure isolation between worker threads
//! - Statistics and graceful shutdown

use parking_lot::Mutex;
use prometheus_promise::config::PromiseWorkerConfig;
use anyhow::anyhow;
use prometheus_promise::core::{
    Promise, PromiseError, PromiseFailure, PromiseStatus, WorkerCall, WorkerCallHandler, WorkerPool,
    START_CUSTOM_WORKER_CALL_ID,
};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

const WAIT: Duration = Duration::from_secs(5);

fn make_pool() -> Arc<WorkerPool> {
    WorkerPool::new(PromiseWorkerConfig::new().with_wait_timeout_ms(20)).unwrap()
}

fn wait_until<F: Fn() -> bool>(done: F) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

// ============================================================================
// TEST CALLS AND HANDLERS
// ============================================================================

/// Records the worker slot it ran on.
struct RecordSlot {
    id: u32,
    slots: Arc<Mutex<Vec<usize>>>,
}

impl WorkerCall for RecordSlot {
    fn call_id(&self) -> u32 {
        self.id
    }

    fn execute_call(&mut self, slot: usize) -> bool {
        self.slots.lock().push(slot);
        true
    }
}

/// Panics when executed.
struct Explode;

impl WorkerCall for Explode {
    fn call_id(&self) -> u32 {
        START_CUSTOM_WORKER_CALL_ID
    }

    fn execute_call(&mut self, _slot: usize) -> bool {
        panic!("call exploded")
    }
}

/// Holds its worker for a while, then panics.
struct SlowExplode;

impl WorkerCall for SlowExplode {
    fn call_id(&self) -> u32 {
        START_CUSTOM_WORKER_CALL_ID
    }

    fn execute_call(&mut self, _slot: usize) -> bool {
        thread::sleep(Duration::from_millis(100));
        panic!("call exploded late")
    }
}

/// Custom handler tracking lifecycle hooks. Its `error_call` panics, which
/// takes the worker thread down.
#[derive(Default)]
struct LifecycleHandler {
    init_len: AtomicUsize,
    started: AtomicUsize,
    ended: AtomicUsize,
    executed: AtomicUsize,
    errors: Mutex<Vec<String>>,
}

impl WorkerCallHandler for LifecycleHandler {
    fn target_id(&self) -> u32 {
        START_CUSTOM_WORKER_CALL_ID
    }

    fn init_worker_call(&self, len: usize) {
        self.init_len.store(len, Ordering::SeqCst);
    }

    fn start_thread_call(&self, _slot: usize) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn end_thread_call(&self, _slot: usize) {
        self.ended.fetch_add(1, Ordering::SeqCst);
    }

    fn execute_call(&self, slot: usize, call: &mut dyn WorkerCall) -> bool {
        self.executed.fetch_add(1, Ordering::SeqCst);
        call.execute_call(slot)
    }

    fn error_call(&self, _slot: usize, _call: &mut dyn WorkerCall, error: &PromiseFailure) {
        self.errors.lock().push(error.to_string());
        panic!("handler gave up");
    }
}

// ============================================================================
// ROUND ROBIN
// ============================================================================

#[test]
fn test_ten_pushes_on_four_threads() {
    let pool = make_pool();
    pool.init_with(4).unwrap();
    let slots = Arc::new(Mutex::new(Vec::new()));

    let assigned: Vec<usize> = (0..10)
        .map(|_| {
            pool.push(Box::new(RecordSlot {
                id: START_CUSTOM_WORKER_CALL_ID,
                slots: Arc::clone(&slots),
            }))
            .unwrap()
        })
        .collect();

    assert_eq!(assigned, vec![0, 1, 2, 3, 0, 1, 2, 3, 0, 1]);
    assert!(wait_until(|| slots.lock().len() == 10));
    let mut ran = slots.lock().clone();
    ran.sort_unstable();
    assert_eq!(ran, vec![0, 0, 0, 1, 1, 1, 2, 2, 3, 3]);
    assert!(pool.shutdown(WAIT));
}

#[test]
fn test_single_producer_assignment_is_modular() {
    let mut rng = rand::rng();
    let threads = rng.random_range(1..=12_usize);
    let pushes = rng.random_range(1..=100_usize);

    let pool = make_pool();
    pool.init_with(threads).unwrap();
    let slots = Arc::new(Mutex::new(Vec::new()));
    for i in 0..pushes {
        let assigned = pool
            .push(Box::new(RecordSlot {
                id: START_CUSTOM_WORKER_CALL_ID,
                slots: Arc::clone(&slots),
            }))
            .unwrap();
        assert_eq!(assigned, i % threads);
    }
    assert!(pool.shutdown(WAIT));
}

#[test]
fn test_configured_length_is_clamped() {
    let pool = WorkerPool::new(PromiseWorkerConfig::new().with_worker_length(2)).unwrap();
    assert!(pool.init().unwrap());
    assert_eq!(pool.size(), prometheus_promise::config::MIN_WORKER_LENGTH);
    assert!(pool.await_startup(WAIT));
    assert!(pool.shutdown(WAIT));
}

// ============================================================================
// HANDLERS
// ============================================================================

#[test]
fn test_custom_handler_hooks() {
    let pool = make_pool();
    let handler = Arc::new(LifecycleHandler::default());
    pool.register_handler(handler.clone()).unwrap();
    pool.init_with(3).unwrap();
    assert!(pool.await_startup(WAIT));

    assert_eq!(handler.init_len.load(Ordering::SeqCst), 3);
    assert_eq!(handler.started.load(Ordering::SeqCst), 3);

    let slots = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..6 {
        pool.push(Box::new(RecordSlot {
            id: START_CUSTOM_WORKER_CALL_ID,
            slots: Arc::clone(&slots),
        }))
        .unwrap();
    }
    assert!(wait_until(|| handler.executed.load(Ordering::SeqCst) == 6));

    assert!(pool.shutdown(WAIT));
    assert_eq!(handler.ended.load(Ordering::SeqCst), 3);
}

#[test]
fn test_unknown_call_id_runs_directly() {
    let pool = make_pool();
    pool.init_with(1).unwrap();
    let slots = Arc::new(Mutex::new(Vec::new()));
    pool.push(Box::new(RecordSlot {
        id: 4_242,
        slots: Arc::clone(&slots),
    }))
    .unwrap();
    assert!(wait_until(|| slots.lock().len() == 1));
    pool.stop_thread();
}

#[test]
fn test_fatal_error_ends_only_one_thread() {
    let pool = make_pool();
    let handler = Arc::new(LifecycleHandler::default());
    pool.register_handler(handler.clone()).unwrap();
    pool.init_with(2).unwrap();
    assert!(pool.await_startup(WAIT));

    assert_eq!(pool.push(Box::new(Explode)).unwrap(), 0);
    let dead = pool.thread(0).unwrap();
    assert!(wait_until(|| dead.is_exit_thread()));
    assert_eq!(handler.errors.lock().as_slice(), ["stage panicked: call exploded"]);
    assert!(!pool.thread(1).unwrap().is_exit_thread());
    assert!(!pool.is_exit_thread());

    let slots = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..4 {
        let assigned = pool
            .push(Box::new(RecordSlot {
                id: START_CUSTOM_WORKER_CALL_ID,
                slots: Arc::clone(&slots),
            }))
            .unwrap();
        assert_eq!(assigned, 1);
    }
    assert!(wait_until(|| slots.lock().len() == 4));
    assert!(slots.lock().iter().all(|&slot| slot == 1));
    assert!(pool.shutdown(WAIT));
}

#[test]
fn test_dead_worker_rejects_queued_promise() {
    let pool = make_pool();
    let handler = Arc::new(LifecycleHandler::default());
    pool.register_handler(handler.clone()).unwrap();
    pool.init_with(2).unwrap();
    assert!(pool.await_startup(WAIT));

    assert_eq!(pool.push(Box::new(SlowExplode)).unwrap(), 0);
    let slots = Arc::new(Mutex::new(Vec::new()));
    let assigned = pool
        .push(Box::new(RecordSlot {
            id: START_CUSTOM_WORKER_CALL_ID,
            slots: Arc::clone(&slots),
        }))
        .unwrap();
    assert_eq!(assigned, 1);

    // The stage lands behind the exploding call on worker 0.
    let ran = Arc::new(AtomicUsize::new(0));
    let stage_ran = Arc::clone(&ran);
    let promise = Promise::with_value(&pool, 1_i32);
    promise
        .then(move |_, _| {
            stage_ran.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap()
        .start()
        .unwrap();

    let value = promise.wait_for(WAIT).unwrap().expect("queued promise did not finalize");
    assert_eq!(promise.status(), PromiseStatus::Rejected);
    let failure = value.failure().expect("error-like final value");
    assert!(failure.to_string().contains("terminated"), "{failure}");
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert!(pool.thread(0).unwrap().is_exit_thread());
    assert!(wait_until(|| pool.stats().failed_calls == 2));
    assert!(pool.shutdown(WAIT));
}

// ============================================================================
// STATS AND SHUTDOWN
// ============================================================================

#[test]
fn test_stats_track_calls() {
    let pool = make_pool();
    assert_eq!(pool.stats().worker_count, 0);
    pool.init_with(2).unwrap();

    let slots = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..8 {
        pool.push(Box::new(RecordSlot {
            id: START_CUSTOM_WORKER_CALL_ID,
            slots: Arc::clone(&slots),
        }))
        .unwrap();
    }
    assert!(wait_until(|| pool.stats().completed_calls == 8));

    let stats = pool.stats();
    assert_eq!(stats.worker_count, 2);
    assert_eq!(stats.submitted_calls, 8);
    assert_eq!(stats.failed_calls, 0);
    assert_eq!(stats.queued_calls, 0);
    assert!(pool.shutdown(WAIT));
}

#[test]
fn test_failed_first_call_counts_as_failure() {
    let pool = make_pool();
    pool.init_with(1).unwrap();

    let promise = Promise::<i32>::with_call(&pool, |_| Err(anyhow!("no connection")));
    promise.start().unwrap();
    promise.wait_for(WAIT).unwrap().expect("promise did not finalize");
    assert_eq!(promise.status(), PromiseStatus::Rejected);

    assert!(wait_until(|| pool.stats().failed_calls == 1));
    assert_eq!(pool.stats().completed_calls, 0);
    assert!(pool.shutdown(WAIT));
}

#[test]
fn test_shutdown_state_flags() {
    let pool = make_pool();
    assert!(!pool.is_init());
    assert!(!pool.is_start_call());
    assert!(!pool.is_startup_thread());
    assert!(pool.is_exit_thread());

    pool.init_with(2).unwrap();
    assert!(pool.is_start_call());
    assert!(pool.await_startup(WAIT));
    assert!(pool.is_startup_thread());
    assert_eq!(pool.thread(0).map(|t| t.length()), Some(0));

    assert!(pool.shutdown(WAIT));
    assert!(pool.is_stop_call());
    assert!(pool.is_exit_thread());

    let slots = Arc::new(Mutex::new(Vec::new()));
    let rejected = pool.push(Box::new(RecordSlot {
        id: START_CUSTOM_WORKER_CALL_ID,
        slots,
    }));
    assert_eq!(rejected, Err(PromiseError::PoolShutdown));
}
