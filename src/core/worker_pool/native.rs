//! Native implementation of `WorkerPool` using OS threads.
//!
//! Each worker owns a private unbounded crossbeam channel. An idle worker
//! blocks in `recv_timeout` with the configured wait timeout so a stop
//! request is observed without polling the queue.
//!
//! Threads are created lazily on the first `push` (or an explicit `init`),
//! and are detached: the pool never keeps the process alive.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::config::{PromiseWorkerConfig, MAX_WORKER_LENGTH};
use crate::core::chain::PromiseCallHandler;
use crate::core::{PromiseError, PromiseFailure};

use super::{PoolShared, PoolStats, WorkerCall, WorkerCallHandler};

const STATE_POLL_INTERVAL: Duration = Duration::from_millis(5);

type CallBox = Box<dyn WorkerCall>;

/// Per-thread lifecycle flags.
#[derive(Debug)]
struct ThreadState {
    stop: AtomicBool,
    started: AtomicBool,
    exited: AtomicBool,
    /// Set before the exiting worker drains its queue; `push` checks it under the lock.
    closed: Mutex<bool>,
}

/// One worker thread and its private queue.
pub struct WorkerThread {
    no: usize,
    tx: Sender<CallBox>,
    /// Moved into the OS thread by `start_thread`.
    rx: Mutex<Option<Receiver<CallBox>>>,
    state: Arc<ThreadState>,
}

impl WorkerThread {
    fn new(no: usize) -> Self {
        let (tx, rx) = unbounded();
        Self {
            no,
            tx,
            rx: Mutex::new(Some(rx)),
            state: Arc::new(ThreadState {
                stop: AtomicBool::new(true),
                started: AtomicBool::new(false),
                exited: AtomicBool::new(false),
                closed: Mutex::new(false),
            }),
        }
    }

    /// Index of this worker within its pool.
    #[must_use]
    pub const fn worker_no(&self) -> usize {
        self.no
    }

    /// Calls queued on this worker and not yet picked up.
    #[must_use]
    pub fn length(&self) -> usize {
        self.tx.len()
    }

    /// Spawn the OS thread. A second call is a no-op.
    fn start_thread(
        &self,
        config: &PromiseWorkerConfig,
        shared: Arc<PoolShared>,
    ) -> Result<(), PromiseError> {
        let Some(rx) = self.rx.lock().take() else {
            return Ok(());
        };
        self.state.stop.store(false, Ordering::Release);

        let no = self.no;
        let state = Arc::clone(&self.state);
        let wait_timeout = Duration::from_millis(config.wait_timeout_ms);
        thread::Builder::new()
            .name(format!("{}-{no}", config.thread_name_prefix))
            .stack_size(config.thread_stack_size)
            .spawn(move || run_worker(no, &rx, &state, &shared, wait_timeout))
            .map(drop)
            .map_err(|e| {
                self.state.stop.store(true, Ordering::Release);
                PromiseError::Spawn(e.to_string())
            })
    }

    /// Ask the worker to exit after its current call.
    pub fn stop_thread(&self) {
        self.state.stop.store(true, Ordering::Release);
    }

    /// Whether a stop was requested (or the thread was never started).
    #[must_use]
    pub fn is_stop_thread(&self) -> bool {
        self.state.stop.load(Ordering::Acquire)
    }

    /// Whether the worker loop has started.
    #[must_use]
    pub fn is_startup_thread(&self) -> bool {
        self.state.started.load(Ordering::Acquire)
    }

    /// Whether the worker loop has exited.
    #[must_use]
    pub fn is_exit_thread(&self) -> bool {
        self.state.exited.load(Ordering::Acquire)
    }

    /// Queue a call; hands it back when the worker has gone away.
    fn push(&self, call: CallBox) -> Result<(), CallBox> {
        let closed = self.state.closed.lock();
        if *closed {
            return Err(call);
        }
        self.tx.send(call).map_err(|e| e.into_inner())
    }
}

/// Closes and drains the queue and marks the worker as exited however the
/// loop ends, including a panic.
struct ExitGuard<'a> {
    no: usize,
    rx: &'a Receiver<CallBox>,
    state: &'a ThreadState,
    shared: &'a PoolShared,
    /// Failure that ended the loop, if a call's error handling panicked.
    fatal: Option<PromiseFailure>,
}

impl ExitGuard<'_> {
    fn count_discarded(&self, discarded: u64) {
        if discarded == 0 {
            return;
        }
        let counters = &self.shared.counters;
        counters.queued_calls.fetch_sub(discarded, Ordering::Relaxed);
        counters.failed_calls.fetch_add(discarded, Ordering::Relaxed);
        warn!(worker_id = self.no, discarded, "Discarded queued calls on worker exit");
    }

    /// Hand every queued call to its handler's `error_call`.
    fn fail_queued(&self, failure: &PromiseFailure) {
        let mut discarded = 0;
        for mut call in self.rx.try_iter() {
            discarded += 1;
            let call_id = call.call_id();
            let handler = self.shared.handler_for(call_id);
            let handled = panic::catch_unwind(AssertUnwindSafe(|| {
                handler.error_call(self.no, call.as_mut(), failure);
            }));
            if handled.is_err() {
                warn!(worker_id = self.no, call_id, "Error handler panicked for a discarded call");
            }
        }
        self.count_discarded(discarded);
    }
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        *self.state.closed.lock() = true;
        if thread::panicking() {
            // No handler code while unwinding.
            let discarded = self.rx.try_iter().count() as u64;
            self.count_discarded(discarded);
            error!(worker_id = self.no, "Promise worker terminated by a fatal error");
        } else if let Some(fatal) = self.fatal.take() {
            let failure = PromiseFailure::msg(format!("promise worker {} terminated: {fatal}", self.no));
            self.fail_queued(&failure);
            error!(worker_id = self.no, error = %fatal, "Promise worker terminated by a fatal error");
        } else {
            self.fail_queued(&PromiseError::PoolShutdown.into());
            for handler in self.shared.handlers() {
                handler.end_thread_call(self.no);
            }
            debug!(worker_id = self.no, "Promise worker exiting");
        }
        self.state.exited.store(true, Ordering::Release);
    }
}

fn run_worker(
    no: usize,
    rx: &Receiver<CallBox>,
    state: &ThreadState,
    shared: &PoolShared,
    wait_timeout: Duration,
) {
    let mut guard = ExitGuard {
        no,
        rx,
        state,
        shared,
        fatal: None,
    };
    for handler in shared.handlers() {
        handler.start_thread_call(no);
    }
    state.started.store(true, Ordering::Release);
    debug!(worker_id = no, "Promise worker started");

    while !state.stop.load(Ordering::Acquire) {
        match rx.recv_timeout(wait_timeout) {
            Ok(mut call) => {
                // Only a panicking `error_call` escapes dispatch; it ends this thread.
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| shared.dispatch(no, call.as_mut()))) {
                    guard.fatal = Some(PromiseFailure::from_panic(payload));
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Pool of dedicated worker threads with lock-free round-robin assignment.
///
/// # Design
///
/// - **Lazy**: threads are spawned on first use, sized from configuration
/// - **Round-robin**: a CAS loop on an atomic cursor picks the target thread
/// - **Isolated**: a fatal error ends one thread; the rest keep serving
pub struct WorkerPool {
    config: PromiseWorkerConfig,
    shared: Arc<PoolShared>,
    threads: OnceLock<Box<[WorkerThread]>>,
    init_lock: Mutex<()>,
    next_assign: AtomicUsize,
    start_called: AtomicBool,
}

impl WorkerPool {
    /// Create a pool. No thread is spawned until [`init`](Self::init) or the
    /// first [`push`](Self::push).
    ///
    /// The promise engine's handler is registered under
    /// [`PROMISE_WORKER_CALL_ID`](super::PROMISE_WORKER_CALL_ID).
    ///
    /// # Errors
    ///
    /// Returns `PromiseError::InvalidConfig` if the configuration is invalid.
    pub fn new(config: PromiseWorkerConfig) -> Result<Arc<Self>, PromiseError> {
        config.validate().map_err(PromiseError::InvalidConfig)?;
        let shared = Arc::new(PoolShared::new());
        shared.register(Arc::new(PromiseCallHandler::default()));
        Ok(Arc::new(Self {
            config,
            shared,
            threads: OnceLock::new(),
            init_lock: Mutex::new(()),
            next_assign: AtomicUsize::new(0),
            start_called: AtomicBool::new(false),
        }))
    }

    /// Configuration this pool was built with.
    #[must_use]
    pub const fn config(&self) -> &PromiseWorkerConfig {
        &self.config
    }

    /// Register a handler for its `target_id`. Only allowed before init.
    ///
    /// # Errors
    ///
    /// Returns `PromiseError::AlreadyStarted` once the threads exist.
    pub fn register_handler(&self, handler: Arc<dyn WorkerCallHandler>) -> Result<(), PromiseError> {
        let _guard = self.init_lock.lock();
        if self.is_init() {
            return Err(PromiseError::AlreadyStarted);
        }
        let id = handler.target_id();
        if self.shared.register(handler).is_some() {
            warn!(call_id = id, "Replaced worker call handler");
        }
        Ok(())
    }

    /// Spawn the configured number of threads. Returns `false` if already initialized.
    ///
    /// # Errors
    ///
    /// `PoolShutdown` after a stop, `Spawn` if a thread cannot be created.
    pub fn init(&self) -> Result<bool, PromiseError> {
        self.init_threads(self.config.resolve_worker_length())
    }

    /// Spawn exactly `len` threads, bypassing the configured minimum.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` unless `1 <= len <= MAX_WORKER_LENGTH`, otherwise as [`init`](Self::init).
    pub fn init_with(&self, len: usize) -> Result<bool, PromiseError> {
        if len == 0 || len > MAX_WORKER_LENGTH {
            return Err(PromiseError::InvalidConfig(format!(
                "worker length must be within 1..={MAX_WORKER_LENGTH}, got {len}"
            )));
        }
        self.init_threads(len)
    }

    fn init_threads(&self, len: usize) -> Result<bool, PromiseError> {
        if self.is_init() {
            return Ok(false);
        }
        let _guard = self.init_lock.lock();
        if self.is_init() {
            return Ok(false);
        }
        if self.is_stop_call() {
            return Err(PromiseError::PoolShutdown);
        }

        for handler in self.shared.handlers() {
            handler.init_worker_call(len);
        }
        let threads: Box<[WorkerThread]> = (0..len).map(WorkerThread::new).collect();

        self.start_called.store(true, Ordering::Release);
        for thread in threads.iter() {
            if let Err(e) = thread.start_thread(&self.config, Arc::clone(&self.shared)) {
                error!(worker_id = thread.worker_no(), error = %e, "Failed to spawn promise worker");
                threads.iter().for_each(WorkerThread::stop_thread);
                return Err(e);
            }
        }

        if self.threads.set(threads).is_err() {
            return Err(PromiseError::Internal("worker threads initialized twice".into()));
        }
        info!(
            worker_count = len,
            wait_timeout_ms = self.config.wait_timeout_ms,
            "Promise worker pool initialized"
        );
        Ok(true)
    }

    /// Whether the threads have been created.
    #[must_use]
    pub fn is_init(&self) -> bool {
        self.threads.get().is_some()
    }

    /// Number of worker threads (0 before init).
    #[must_use]
    pub fn size(&self) -> usize {
        self.threads.get().map_or(0, |t| t.len())
    }

    /// Borrow worker `no`, if the pool is initialized.
    #[must_use]
    pub fn thread(&self, no: usize) -> Option<&WorkerThread> {
        self.threads.get().and_then(|t| t.get(no))
    }

    fn threads(&self) -> Result<&[WorkerThread], PromiseError> {
        if let Some(threads) = self.threads.get() {
            return Ok(threads);
        }
        self.init()?;
        self.threads
            .get()
            .map(|t| &**t)
            .ok_or_else(|| PromiseError::Internal("worker threads missing after init".into()))
    }

    /// Next slot of the round-robin cursor.
    fn next_slot(&self, len: usize) -> usize {
        let mut no = self.next_assign.load(Ordering::Acquire);
        loop {
            let next = if no + 1 >= len { 0 } else { no + 1 };
            match self
                .next_assign
                .compare_exchange_weak(no, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return no % len,
                Err(actual) => no = actual,
            }
        }
    }

    /// Queue a call on the next worker in round-robin order.
    ///
    /// Initializes the pool on first use. A worker that has exited is
    /// skipped and the call moves on to the following slot.
    ///
    /// # Returns
    ///
    /// The index of the worker the call was assigned to.
    ///
    /// # Errors
    ///
    /// - `PromiseError::PoolShutdown` after a stop, or when every worker has exited
    /// - init errors on first use
    pub fn push(&self, call: Box<dyn WorkerCall>) -> Result<usize, PromiseError> {
        if self.is_stop_call() {
            return Err(PromiseError::PoolShutdown);
        }
        let threads = self.threads()?;
        let len = threads.len();

        let counters = &self.shared.counters;
        // Counted before the send so a fast worker never sees the queue below zero.
        counters.queued_calls.fetch_add(1, Ordering::Relaxed);
        let mut call = call;
        for _ in 0..len {
            let no = self.next_slot(len);
            match threads[no].push(call) {
                Ok(()) => {
                    counters.submitted_calls.fetch_add(1, Ordering::Relaxed);
                    trace!(worker_id = no, "Call queued on promise worker");
                    return Ok(no);
                }
                Err(back) => {
                    warn!(worker_id = no, "Promise worker has exited; reassigning call");
                    call = back;
                }
            }
        }
        counters.queued_calls.fetch_sub(1, Ordering::Relaxed);
        Err(PromiseError::PoolShutdown)
    }

    /// Whether thread creation has been triggered.
    #[must_use]
    pub fn is_start_call(&self) -> bool {
        self.start_called.load(Ordering::Acquire)
    }

    /// Whether [`stop_thread`](Self::stop_thread) has been called.
    #[must_use]
    pub fn is_stop_call(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }

    /// Whether every worker loop has started. `false` before init.
    #[must_use]
    pub fn is_startup_thread(&self) -> bool {
        self.threads
            .get()
            .is_some_and(|t| t.iter().all(WorkerThread::is_startup_thread))
    }

    /// Whether every worker loop has exited. `true` before init.
    #[must_use]
    pub fn is_exit_thread(&self) -> bool {
        self.threads
            .get()
            .is_none_or(|t| t.iter().all(WorkerThread::is_exit_thread))
    }

    /// Poll until every worker has started, or `timeout` elapses.
    pub fn await_startup(&self, timeout: Duration) -> bool {
        poll_until(timeout, || self.is_startup_thread())
    }

    /// Poll until every worker has exited, or `timeout` elapses.
    pub fn await_exit(&self, timeout: Duration) -> bool {
        poll_until(timeout, || self.is_exit_thread())
    }

    /// Ask every worker to stop. Queued calls are failed with `PoolShutdown`
    /// through their handler's `error_call`.
    pub fn stop_thread(&self) {
        if !self.shared.stop.swap(true, Ordering::AcqRel) {
            info!("Stopping promise worker pool");
        }
        // Serializes with `init_threads`, so threads created concurrently are stopped too.
        let _guard = self.init_lock.lock();
        if let Some(threads) = self.threads.get() {
            threads.iter().for_each(WorkerThread::stop_thread);
        }
    }

    /// Stop the pool and wait up to `timeout` for the workers to exit.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.stop_thread();
        let exited = self.await_exit(timeout);
        if exited {
            info!(worker_count = self.size(), "Promise worker pool shut down complete");
        } else {
            warn!("Promise workers did not exit within timeout - detaching");
        }
        exited
    }

    /// Get current pool statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.shared.counters.snapshot(self.size())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.is_stop_call() {
            debug!("WorkerPool dropped without explicit shutdown - workers will be detached");
        }
        self.stop_thread();
    }
}

fn poll_until<F>(timeout: Duration, mut done: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(STATE_POLL_INTERVAL);
    }
}
