//! Chain units: what a promise pushes onto the worker pool.
//!
//! A [`ChainUnit`] carries one stage callback and its payload. After the
//! callback returns, the unit applies the auto-chaining rule: if the callback
//! neither resolved, rejected nor exited, the chain is advanced for it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use super::action::{InitialCall, PromiseAction, StageCall, StageMode};
use super::error::{AppResult, PromiseFailure};
use super::value::{PromiseData, PromiseValue};
use super::worker_pool::{WorkerCall, WorkerCallHandler, PROMISE_WORKER_CALL_ID};

/// A queued stage of one chain.
pub(crate) struct ChainUnit<T: PromiseData> {
    action: Arc<PromiseAction<T>>,
    mode: StageMode,
    index: usize,
    payload: Option<PromiseValue<T>>,
    call: Option<StageCall<T>>,
}

impl<T: PromiseData> ChainUnit<T> {
    pub(crate) fn new(
        action: Arc<PromiseAction<T>>,
        mode: StageMode,
        index: usize,
        payload: PromiseValue<T>,
        call: StageCall<T>,
    ) -> Self {
        Self {
            action,
            mode,
            index,
            payload: Some(payload),
            call: Some(call),
        }
    }
}

impl<T: PromiseData> WorkerCall for ChainUnit<T> {
    fn call_id(&self) -> u32 {
        PROMISE_WORKER_CALL_ID
    }

    fn execute_call(&mut self, slot: usize) -> bool {
        let (Some(call), Some(payload)) = (self.call.take(), self.payload.take()) else {
            return false;
        };
        let action = &*self.action;
        let before = action.resolve_reject_count();
        // An allways stage sees its payload wrapped in `Settled`; the fallback looks through it.
        let fallback =
            (self.mode == StageMode::Error || payload.failure().is_some()).then(|| payload.clone().untagged());

        trace!(
            promise_id = %action.id(),
            worker_id = slot,
            stage = self.index,
            mode = %self.mode,
            "Running stage"
        );
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| call(action, payload)));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(PromiseFailure::new(e)),
            Err(payload) => Some(PromiseFailure::from_panic(payload)),
        };

        let advanced = match &failure {
            Some(failure) => {
                debug!(
                    promise_id = %action.id(),
                    stage = self.index,
                    error = %failure,
                    "Stage failed; rejecting chain"
                );
                action.reject(PromiseValue::Error(failure.clone()))
            }
            None if action.resolve_reject_count() == before => match fallback {
                Some(value) => action.reject(value),
                None => action.resolve(PromiseValue::Empty),
            },
            None => Ok(false),
        };
        if let Err(e) = advanced {
            warn!(promise_id = %action.id(), stage = self.index, error = %e, "Could not advance chain");
        }
        failure.is_none()
    }

    fn error_call(&mut self, slot: usize, error: &PromiseFailure) {
        error!(
            promise_id = %self.action.id(),
            worker_id = slot,
            stage = self.index,
            error = %error,
            "Chain unit failed outside its stage"
        );
        if let Err(e) = self.action.exit(PromiseValue::Error(error.clone())) {
            warn!(promise_id = %self.action.id(), stage = self.index, error = %e, "Could not exit chain");
        }
    }
}

/// The call given to `Promise::with_call`, run once at start.
pub(crate) struct FirstCallUnit<T: PromiseData> {
    action: Arc<PromiseAction<T>>,
    call: Option<InitialCall<T>>,
}

impl<T: PromiseData> FirstCallUnit<T> {
    pub(crate) fn new(action: Arc<PromiseAction<T>>, call: InitialCall<T>) -> Self {
        Self {
            action,
            call: Some(call),
        }
    }
}

impl<T: PromiseData> WorkerCall for FirstCallUnit<T> {
    fn call_id(&self) -> u32 {
        PROMISE_WORKER_CALL_ID
    }

    fn execute_call(&mut self, _slot: usize) -> bool {
        let Some(call) = self.call.take() else {
            return false;
        };
        let action = &*self.action;
        let before = action.resolve_reject_count();
        let outcome: std::thread::Result<AppResult<()>> =
            panic::catch_unwind(AssertUnwindSafe(|| call(action)));

        let (advanced, succeeded) = match outcome {
            Ok(Ok(())) if action.resolve_reject_count() == before => (action.resolve(PromiseValue::Empty), true),
            Ok(Ok(())) => return true,
            Ok(Err(e)) => (action.reject(PromiseValue::Error(PromiseFailure::new(e))), false),
            Err(payload) => (
                action.reject(PromiseValue::Error(PromiseFailure::from_panic(payload))),
                false,
            ),
        };
        if let Err(e) = advanced {
            warn!(promise_id = %action.id(), error = %e, "Could not advance chain after first call");
            return false;
        }
        succeeded
    }

    fn error_call(&mut self, slot: usize, error: &PromiseFailure) {
        error!(promise_id = %self.action.id(), worker_id = slot, error = %error, "First call failed outside its body");
        if let Err(e) = self.action.exit(PromiseValue::Error(error.clone())) {
            warn!(promise_id = %self.action.id(), error = %e, "Could not exit chain");
        }
    }
}

/// Handler under which every promise chain unit runs.
///
/// Tracks how many worker threads are live, for diagnostics.
#[derive(Debug, Default)]
pub struct PromiseCallHandler {
    live_threads: AtomicUsize,
}

impl PromiseCallHandler {
    /// Worker threads that have started and not yet exited.
    #[must_use]
    pub fn live_threads(&self) -> usize {
        self.live_threads.load(Ordering::Acquire)
    }
}

impl WorkerCallHandler for PromiseCallHandler {
    fn target_id(&self) -> u32 {
        PROMISE_WORKER_CALL_ID
    }

    fn init_worker_call(&self, len: usize) {
        debug!(worker_count = len, "Promise call handler attached to pool");
    }

    fn start_thread_call(&self, slot: usize) {
        self.live_threads.fetch_add(1, Ordering::AcqRel);
        trace!(worker_id = slot, "Promise worker ready");
    }

    fn end_thread_call(&self, slot: usize) {
        self.live_threads.fetch_sub(1, Ordering::AcqRel);
        trace!(worker_id = slot, "Promise worker released");
    }
}
