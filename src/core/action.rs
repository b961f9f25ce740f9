//! The promise state machine.
//!
//! A [`PromiseAction`] owns an ordered list of stages. Stages are registered
//! before `start`, frozen at `start`, and dispatched one at a time to the
//! worker pool as the chain is resolved or rejected. At most one stage of a
//! chain is in flight at any moment.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use super::chain::{ChainUnit, FirstCallUnit};
use super::error::{AppResult, PromiseError, PromiseFailure};
use super::signal::WaitSignal;
use super::value::{PromiseData, PromiseStatus, PromiseValue};
use super::worker_pool::WorkerPool;

/// Longest single block inside `wait_to`; the pool stop flag is re-checked
/// between slices.
const WAIT_SLICE: Duration = Duration::from_millis(100);

const NO_STAGE: usize = usize::MAX;

/// Stage callback: receives the action (to resolve, reject or exit) and the value.
pub type StageCall<T> = Box<dyn FnOnce(&PromiseAction<T>, PromiseValue<T>) -> AppResult<()> + Send>;

/// Call run on a worker right after `start`, in place of an initial value.
pub type InitialCall<T> = Box<dyn FnOnce(&PromiseAction<T>) -> AppResult<()> + Send>;

/// End call run once at finalize.
pub type EndCall<T> = Box<dyn FnOnce(&PromiseAction<T>) -> AppResult<()> + Send>;

/// Completion callback receiving the final status and value.
pub type CompleteCall<T> = Box<dyn FnOnce(PromiseStatus, PromiseValue<T>) + Send>;

/// Hook run on the starting thread by `start`, after the stages are frozen.
pub type StartHook<T> = Box<dyn FnOnce(Arc<PromiseAction<T>>) -> Result<(), PromiseError> + Send>;

/// Opaque context handed to `start_with`.
pub type PromiseContext = Arc<dyn Any + Send + Sync>;

/// Which track(s) a stage accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StageMode {
    /// Runs on resolve.
    Then = 1,
    /// Runs on reject.
    Error = 2,
    /// Runs on either.
    Any = 3,
}

impl StageMode {
    /// Whether a stage of this mode accepts values delivered on `track`.
    #[must_use]
    pub const fn accepts(self, track: Self) -> bool {
        (self as u8) & (track as u8) != 0
    }

    /// Status a chain takes when a value travels on this track.
    const fn track_status(self) -> PromiseStatus {
        match self {
            Self::Error => PromiseStatus::Rejected,
            Self::Then | Self::Any => PromiseStatus::Fulfilled,
        }
    }
}

impl fmt::Display for StageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Then => "then",
            Self::Error => "error",
            Self::Any => "allways",
        })
    }
}

/// How a chain is set in motion by `start`.
pub enum Launch<T> {
    /// Resolve with this value right away.
    Resolve(PromiseValue<T>),
    /// Run this call on a worker; an empty resolve follows if it does not
    /// resolve or reject itself.
    Call(InitialCall<T>),
    /// Run this hook synchronously; it decides when the chain is resolved.
    Hook(StartHook<T>),
    /// Start without dispatching; an outside caller resolves later.
    Manual,
}

impl<T> fmt::Debug for Launch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Resolve(_) => "Launch::Resolve",
            Self::Call(_) => "Launch::Call",
            Self::Hook(_) => "Launch::Hook",
            Self::Manual => "Launch::Manual",
        })
    }
}

struct Stage<T> {
    mode: StageMode,
    call: Mutex<Option<StageCall<T>>>,
}

enum WaitGate<T> {
    Unset,
    Signal(Arc<WaitSignal>),
    Callback(Option<CompleteCall<T>>),
}

/// Promise state machine shared by the façade, queued chain units and stage callbacks.
pub struct PromiseAction<T> {
    id: Uuid,
    me: Weak<Self>,
    pool: Arc<WorkerPool>,
    pending: Mutex<Vec<Stage<T>>>,
    stages: OnceLock<Box<[Stage<T>]>>,
    started: AtomicBool,
    finalized: AtomicBool,
    settled: AtomicBool,
    status: AtomicU8,
    resolve_reject_count: AtomicU64,
    last_executed: AtomicUsize,
    final_value: Mutex<Option<PromiseValue<T>>>,
    end_call: Mutex<Option<EndCall<T>>>,
    gate: Mutex<WaitGate<T>>,
    context: OnceLock<PromiseContext>,
}

impl<T: PromiseData> PromiseAction<T> {
    /// Create an action bound to `pool`.
    #[must_use]
    pub fn new(pool: Arc<WorkerPool>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id: Uuid::new_v4(),
            me: me.clone(),
            pool,
            pending: Mutex::new(Vec::new()),
            stages: OnceLock::new(),
            started: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            settled: AtomicBool::new(false),
            status: AtomicU8::new(PromiseStatus::None as u8),
            resolve_reject_count: AtomicU64::new(0),
            last_executed: AtomicUsize::new(NO_STAGE),
            final_value: Mutex::new(None),
            end_call: Mutex::new(None),
            gate: Mutex::new(WaitGate::Unset),
            context: OnceLock::new(),
        })
    }

    /// Unique id, used in log fields.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Pool this action dispatches to.
    #[must_use]
    pub const fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Append a stage.
    ///
    /// # Errors
    ///
    /// `PromiseError::AlreadyStarted` after `start`.
    pub fn register(&self, mode: StageMode, call: StageCall<T>) -> Result<(), PromiseError> {
        let mut pending = self.pending.lock();
        if self.started.load(Ordering::Acquire) {
            return Err(PromiseError::AlreadyStarted);
        }
        pending.push(Stage {
            mode,
            call: Mutex::new(Some(call)),
        });
        Ok(())
    }

    /// Append a stage run on resolve.
    ///
    /// # Errors
    ///
    /// `PromiseError::AlreadyStarted` after `start`.
    pub fn register_then<F>(&self, call: F) -> Result<(), PromiseError>
    where
        F: FnOnce(&Self, PromiseValue<T>) -> AppResult<()> + Send + 'static,
    {
        self.register(StageMode::Then, Box::new(call))
    }

    /// Append a stage run on reject.
    ///
    /// # Errors
    ///
    /// `PromiseError::AlreadyStarted` after `start`.
    pub fn register_error<F>(&self, call: F) -> Result<(), PromiseError>
    where
        F: FnOnce(&Self, PromiseValue<T>) -> AppResult<()> + Send + 'static,
    {
        self.register(StageMode::Error, Box::new(call))
    }

    /// Append a stage run on either track.
    ///
    /// # Errors
    ///
    /// `PromiseError::AlreadyStarted` after `start`.
    pub fn register_any<F>(&self, call: F) -> Result<(), PromiseError>
    where
        F: FnOnce(&Self, PromiseValue<T>) -> AppResult<()> + Send + 'static,
    {
        self.register(StageMode::Any, Box::new(call))
    }

    /// Set the end call run once at finalize, replacing any earlier one.
    ///
    /// # Errors
    ///
    /// `PromiseError::AlreadyStarted` after `start`.
    pub fn set_end_call(&self, call: EndCall<T>) -> Result<(), PromiseError> {
        let _pending = self.pending.lock();
        if self.started.load(Ordering::Acquire) {
            return Err(PromiseError::AlreadyStarted);
        }
        *self.end_call.lock() = Some(call);
        Ok(())
    }

    /// Block waiters on `signal` instead of a private one.
    ///
    /// # Errors
    ///
    /// `AlreadyStarted` after `start`, `WaitGateAlreadySet` if a gate exists.
    pub fn set_wait_signal(&self, signal: Arc<WaitSignal>) -> Result<(), PromiseError> {
        self.set_gate(WaitGate::Signal(signal))
    }

    /// Deliver the final status and value to `call` instead of waking waiters.
    ///
    /// # Errors
    ///
    /// `AlreadyStarted` after `start`, `WaitGateAlreadySet` if a gate exists.
    pub fn set_complete_call(&self, call: CompleteCall<T>) -> Result<(), PromiseError> {
        self.set_gate(WaitGate::Callback(Some(call)))
    }

    fn set_gate(&self, gate: WaitGate<T>) -> Result<(), PromiseError> {
        let _pending = self.pending.lock();
        if self.started.load(Ordering::Acquire) {
            return Err(PromiseError::AlreadyStarted);
        }
        let mut current = self.gate.lock();
        if !matches!(*current, WaitGate::Unset) {
            return Err(PromiseError::WaitGateAlreadySet);
        }
        *current = gate;
        Ok(())
    }

    /// Freeze the stages and set the chain in motion.
    ///
    /// # Errors
    ///
    /// - `PromiseError::AlreadyStarted` on a second call
    /// - a pool error if the first dispatch fails; the chain is then
    ///   finalized `Rejected`
    pub fn start(&self, launch: Launch<T>, context: Option<PromiseContext>) -> Result<(), PromiseError> {
        let stage_count = {
            let mut pending = self.pending.lock();
            if self.started.swap(true, Ordering::AcqRel) {
                return Err(PromiseError::AlreadyStarted);
            }
            if let Some(context) = context {
                let _ = self.context.set(context);
            }
            {
                let mut gate = self.gate.lock();
                if matches!(*gate, WaitGate::Unset) {
                    *gate = WaitGate::Signal(Arc::new(WaitSignal::new()));
                }
            }
            self.status.store(PromiseStatus::Pending as u8, Ordering::Release);

            // Stages are published last; `is_start` keys off them.
            let stages = std::mem::take(&mut *pending).into_boxed_slice();
            let count = stages.len();
            if self.stages.set(stages).is_err() {
                return Err(PromiseError::Internal("stages frozen twice".into()));
            }
            count
        };
        debug!(promise_id = %self.id, stages = stage_count, launch = ?launch, "Promise started");

        match launch {
            Launch::Resolve(value) => self.advance(StageMode::Then, value).map(drop),
            Launch::Call(call) => {
                let unit = FirstCallUnit::new(self.shared()?, call);
                self.submit(Box::new(unit)).map(drop)
            }
            Launch::Hook(hook) => hook(self.shared()?).inspect_err(|e| {
                warn!(promise_id = %self.id, error = %e, "Start hook failed");
                self.finalize(Some(PromiseStatus::Rejected), PromiseValue::Error(e.clone().into()));
            }),
            Launch::Manual => Ok(()),
        }
    }

    /// Hand `value` to the next stage accepting resolve.
    ///
    /// # Returns
    ///
    /// `true` if a stage was dispatched; `false` if the chain finalized
    /// `Fulfilled` instead, or was already finalized.
    ///
    /// # Errors
    ///
    /// `NotStarted` before `start`, or a pool error if the dispatch fails.
    pub fn resolve(&self, value: PromiseValue<T>) -> Result<bool, PromiseError> {
        self.advance(StageMode::Then, value)
    }

    /// Hand `value` to the next stage accepting reject.
    ///
    /// # Returns
    ///
    /// `true` if a stage was dispatched; `false` if the chain finalized
    /// `Rejected` instead, or was already finalized.
    ///
    /// # Errors
    ///
    /// `NotStarted` before `start`, or a pool error if the dispatch fails.
    pub fn reject(&self, value: PromiseValue<T>) -> Result<bool, PromiseError> {
        self.advance(StageMode::Error, value)
    }

    /// Finalize now with `value`, skipping the remaining stages.
    ///
    /// The final status is `Rejected` iff the value is error-like.
    ///
    /// # Errors
    ///
    /// `NotStarted` before `start`.
    pub fn exit(&self, value: PromiseValue<T>) -> Result<bool, PromiseError> {
        if !self.is_start() {
            return Err(PromiseError::NotStarted);
        }
        self.resolve_reject_count.fetch_add(1, Ordering::AcqRel);
        let status = if value.is_error_like() {
            PromiseStatus::Rejected
        } else {
            PromiseStatus::Fulfilled
        };
        Ok(self.finalize(Some(status), value))
    }

    fn advance(&self, track: StageMode, value: PromiseValue<T>) -> Result<bool, PromiseError> {
        let stages = self.stages.get().ok_or(PromiseError::NotStarted)?;
        self.resolve_reject_count.fetch_add(1, Ordering::AcqRel);
        if self.finalized.load(Ordering::Acquire) {
            trace!(promise_id = %self.id, track = %track, "Ignoring signal on a finalized promise");
            return Ok(false);
        }

        let from = match self.last_executed.load(Ordering::Acquire) {
            NO_STAGE => 0,
            n => n + 1,
        };
        let next = stages
            .iter()
            .enumerate()
            .skip(from)
            .find(|(_, stage)| stage.mode.accepts(track));
        let Some((index, stage)) = next else {
            self.finalize(Some(track.track_status()), value);
            return Ok(false);
        };
        let Some(call) = stage.call.lock().take() else {
            return Err(PromiseError::Internal(format!("stage {index} dispatched twice")));
        };

        let payload = if stage.mode == StageMode::Any {
            PromiseValue::Settled {
                status: track.track_status(),
                value: Box::new(value.untagged()),
            }
        } else {
            value
        };
        self.last_executed.store(index, Ordering::Release);
        self.status.store(track.track_status() as u8, Ordering::Release);

        let unit = ChainUnit::new(self.shared()?, stage.mode, index, payload, call);
        self.submit(Box::new(unit))?;
        Ok(true)
    }

    fn submit(&self, unit: Box<dyn super::worker_pool::WorkerCall>) -> Result<usize, PromiseError> {
        match self.pool.push(unit) {
            Ok(worker_id) => {
                trace!(promise_id = %self.id, worker_id, "Stage queued");
                Ok(worker_id)
            }
            Err(e) => {
                error!(promise_id = %self.id, error = %e, "Failed to queue stage");
                self.finalize(Some(PromiseStatus::Rejected), PromiseValue::Error(e.clone().into()));
                Err(e)
            }
        }
    }

    fn shared(&self) -> Result<Arc<Self>, PromiseError> {
        self.me
            .upgrade()
            .ok_or_else(|| PromiseError::Internal("promise action dropped while in use".into()))
    }

    fn derived_status(&self) -> PromiseStatus {
        let last = self.last_executed.load(Ordering::Acquire);
        match self.stages.get().and_then(|s| s.get(last)) {
            Some(stage) if !stage.mode.accepts(StageMode::Then) => PromiseStatus::Rejected,
            _ => PromiseStatus::Fulfilled,
        }
    }

    /// Run the finalize side effects once. Returns `false` if already finalized.
    fn finalize(&self, status: Option<PromiseStatus>, value: PromiseValue<T>) -> bool {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return false;
        }
        let status = status.unwrap_or_else(|| self.derived_status());
        *self.final_value.lock() = Some(value);
        self.status.store(status as u8, Ordering::Release);

        let end_call = self.end_call.lock().take();
        if let Some(end_call) = end_call {
            match panic::catch_unwind(AssertUnwindSafe(|| end_call(self))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(promise_id = %self.id, error = %e, "End call failed"),
                Err(payload) => {
                    let failure = PromiseFailure::from_panic(payload);
                    warn!(promise_id = %self.id, error = %failure, "End call panicked");
                }
            }
        }

        self.settled.store(true, Ordering::Release);
        debug!(promise_id = %self.id, status = ?status, "Promise finalized");

        let callback = {
            let mut gate = self.gate.lock();
            match &mut *gate {
                WaitGate::Signal(signal) => {
                    signal.notify_all();
                    None
                }
                WaitGate::Callback(call) => call.take(),
                WaitGate::Unset => None,
            }
        };
        if let Some(callback) = callback {
            let value = self.final_value().unwrap_or_default();
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(status, value))) {
                let failure = PromiseFailure::from_panic(payload);
                warn!(promise_id = %self.id, error = %failure, "Completion callback panicked");
            }
        }
        true
    }

    /// Block until the chain finalizes and return the final value.
    ///
    /// # Errors
    ///
    /// - `NotStarted` before `start`
    /// - `AwaitUnavailable` when a completion callback was installed
    /// - `PoolShutdown` if the pool stops before the chain finalizes
    pub fn wait_to(&self) -> Result<PromiseValue<T>, PromiseError> {
        self.wait_inner(None)?
            .ok_or_else(|| PromiseError::Internal("unbounded wait timed out".into()))
    }

    /// Like [`wait_to`](Self::wait_to), giving up after `timeout`.
    ///
    /// `Ok(None)` reports a timeout; the chain keeps running.
    ///
    /// # Errors
    ///
    /// As [`wait_to`](Self::wait_to).
    pub fn wait_for(&self, timeout: Duration) -> Result<Option<PromiseValue<T>>, PromiseError> {
        self.wait_inner(Some(timeout))
    }

    fn wait_inner(&self, timeout: Option<Duration>) -> Result<Option<PromiseValue<T>>, PromiseError> {
        if !self.is_start() {
            return Err(PromiseError::NotStarted);
        }
        if self.is_exit() {
            return Ok(self.final_value());
        }
        let signal = match &*self.gate.lock() {
            WaitGate::Signal(signal) => Arc::clone(signal),
            WaitGate::Callback(_) => return Err(PromiseError::AwaitUnavailable),
            WaitGate::Unset => return Err(PromiseError::Internal("started without a wait gate".into())),
        };

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let slice = match deadline {
                None => WAIT_SLICE,
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Ok(None);
                    }
                    left.min(WAIT_SLICE)
                }
            };
            if signal.wait_until(Some(slice), || self.is_exit()) {
                return Ok(self.final_value());
            }
            if self.pool.is_stop_call() {
                debug!(promise_id = %self.id, "Pool stopped while waiting on promise");
                return Err(PromiseError::PoolShutdown);
            }
        }
    }

    /// Current status; lock-free.
    #[must_use]
    pub fn status(&self) -> PromiseStatus {
        PromiseStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Whether `start` has completed its state change.
    #[must_use]
    pub fn is_start(&self) -> bool {
        self.stages.get().is_some()
    }

    /// Whether the chain has finalized and its final value is readable.
    #[must_use]
    pub fn is_exit(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Number of resolve, reject and exit calls so far.
    #[must_use]
    pub fn resolve_reject_count(&self) -> u64 {
        self.resolve_reject_count.load(Ordering::Acquire)
    }

    /// A clone of the final value, once finalized.
    #[must_use]
    pub fn final_value(&self) -> Option<PromiseValue<T>> {
        self.final_value.lock().clone()
    }

    /// Context passed to `start`, if any.
    #[must_use]
    pub fn context(&self) -> Option<&PromiseContext> {
        self.context.get()
    }

    /// Context downcast to `C`.
    #[must_use]
    pub fn context_as<C: Any + Send + Sync>(&self) -> Option<&C> {
        self.context.get()?.downcast_ref::<C>()
    }

    /// Whether the chain was started with a context.
    #[must_use]
    pub fn is_call_send_method(&self) -> bool {
        self.context.get().is_some()
    }
}

impl<T: PromiseData> fmt::Debug for PromiseAction<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseAction")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("resolve_reject_count", &self.resolve_reject_count())
            .field("exited", &self.is_exit())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PromiseWorkerConfig;

    fn pool() -> Arc<WorkerPool> {
        let pool = WorkerPool::new(PromiseWorkerConfig::new().with_wait_timeout_ms(20)).unwrap();
        pool.init_with(2).unwrap();
        pool
    }

    #[test]
    fn test_stage_mode_tracks() {
        assert!(StageMode::Then.accepts(StageMode::Then));
        assert!(!StageMode::Then.accepts(StageMode::Error));
        assert!(StageMode::Error.accepts(StageMode::Error));
        assert!(StageMode::Any.accepts(StageMode::Then));
        assert!(StageMode::Any.accepts(StageMode::Error));
    }

    #[test]
    fn test_signals_before_start_fail() {
        let action = PromiseAction::<i32>::new(pool());
        assert_eq!(action.resolve(PromiseValue::Value(1)), Err(PromiseError::NotStarted));
        assert_eq!(action.reject(PromiseValue::Empty), Err(PromiseError::NotStarted));
        assert_eq!(action.exit(PromiseValue::Empty), Err(PromiseError::NotStarted));
        assert!(matches!(action.wait_to(), Err(PromiseError::NotStarted)));
        assert_eq!(action.status(), PromiseStatus::None);
        assert_eq!(action.resolve_reject_count(), 0);
    }

    #[test]
    fn test_manual_start_then_resolve_without_stages() {
        let action = PromiseAction::<i32>::new(pool());
        action.start(Launch::Manual, None).unwrap();
        assert_eq!(action.status(), PromiseStatus::Pending);
        assert!(!action.is_exit());

        assert_eq!(action.resolve(PromiseValue::Value(7)), Ok(false));
        assert!(action.is_exit());
        assert_eq!(action.status(), PromiseStatus::Fulfilled);
        assert_eq!(action.wait_to().unwrap().into_value(), Some(7));

        assert_eq!(action.reject(PromiseValue::Value(9)), Ok(false));
        assert_eq!(action.final_value().and_then(PromiseValue::into_value), Some(7));
        assert_eq!(action.resolve_reject_count(), 2);
    }

    #[test]
    fn test_gate_is_set_once() {
        let action = PromiseAction::<i32>::new(pool());
        action.set_wait_signal(Arc::new(WaitSignal::new())).unwrap();
        let second = action.set_complete_call(Box::new(|_, _| {}));
        assert_eq!(second, Err(PromiseError::WaitGateAlreadySet));
    }

    #[test]
    fn test_complete_call_blocks_wait() {
        let action = PromiseAction::<i32>::new(pool());
        action.set_complete_call(Box::new(|_, _| {})).unwrap();
        action.start(Launch::Manual, None).unwrap();
        assert!(matches!(action.wait_for(Duration::from_millis(10)), Err(PromiseError::AwaitUnavailable)));
    }

    #[test]
    fn test_context_downcast() {
        let action = PromiseAction::<i32>::new(pool());
        assert!(!action.is_call_send_method());
        action
            .start(Launch::Manual, Some(Arc::new(String::from("request-1"))))
            .unwrap();
        assert!(action.is_call_send_method());
        assert_eq!(action.context_as::<String>().map(String::as_str), Some("request-1"));
        assert!(action.context_as::<u32>().is_none());
    }
}
