//! Promise combinators.
//!
//! Each combinator installs a completion callback on its inputs and returns
//! an aggregate promise. Starting the aggregate starts the inputs; the
//! aggregate is resolved or rejected from whichever input completes the
//! condition, so no worker thread ever blocks on another promise.
//!
//! Inputs must not be started and must not have a wait gate yet.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::action::{Launch, PromiseAction};
use super::error::PromiseError;
use super::promise::Promise;
use super::value::{PromiseData, PromiseStatus, PromiseValue};
use super::worker_pool::WorkerPool;

/// Result of [`Tally::first_in_order`].
enum InOrder<R> {
    /// An earlier input is still pending.
    Pending,
    Found(R),
    /// Every input completed without a hit.
    Exhausted,
}

/// Completion bookkeeping shared by the inputs of one combinator.
struct Tally<V> {
    slots: Mutex<Vec<Option<V>>>,
    remaining: AtomicUsize,
    decided: AtomicBool,
}

impl<V> Tally<V> {
    fn new(len: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new((0..len).map(|_| None).collect()),
            remaining: AtomicUsize::new(len),
            decided: AtomicBool::new(false),
        })
    }

    /// Claim the right to settle the aggregate. Only the first caller wins.
    fn decide(&self) -> bool {
        !self.decided.swap(true, Ordering::AcqRel)
    }

    /// Record one completion; returns `true` for the last one.
    fn complete(&self, index: usize, value: V) -> bool {
        if let Some(slot) = self.slots.lock().get_mut(index) {
            *slot = Some(value);
        }
        self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Walk the slots in input order and return the first hit of `find`.
    /// Stops at the first input that has not completed yet.
    fn first_in_order<R>(&self, mut find: impl FnMut(usize, &V) -> Option<R>) -> InOrder<R> {
        let slots = self.slots.lock();
        for (index, slot) in slots.iter().enumerate() {
            let Some(value) = slot else {
                return InOrder::Pending;
            };
            if let Some(found) = find(index, value) {
                return InOrder::Found(found);
            }
        }
        InOrder::Exhausted
    }

    fn take_all(&self) -> Vec<V> {
        self.slots.lock().iter_mut().filter_map(Option::take).collect()
    }
}

/// Start every input from the aggregate's start hook; an empty input list
/// settles the aggregate through `on_empty`.
fn start_inputs<T, A, F>(aggregate: &Promise<A>, inputs: Vec<Promise<T>>, on_empty: F)
where
    T: PromiseData,
    A: PromiseData,
    F: FnOnce(&PromiseAction<A>) -> Result<bool, PromiseError> + Send + 'static,
{
    aggregate.set_launch(Launch::Hook(Box::new(move |action: Arc<PromiseAction<A>>| {
        if inputs.is_empty() {
            return on_empty(&action).map(drop);
        }
        debug!(promise_id = %action.id(), inputs = inputs.len(), "Starting combinator inputs");
        inputs.iter().try_for_each(|input| input.start().map(drop))
    })));
}

impl<T: PromiseData> Promise<T> {
    /// Resolve with every input's value, in input order, once all are fulfilled.
    ///
    /// Rejects with the first rejected input in list order, once every input
    /// before it is fulfilled. The failure is that input's own, or
    /// [`PromiseError::Rejected`] if it was rejected with a plain value.
    ///
    /// # Errors
    ///
    /// `AlreadyStarted` or `WaitGateAlreadySet` if an input cannot take a completion callback.
    pub fn all(pool: &Arc<WorkerPool>, inputs: Vec<Self>) -> Result<Promise<Vec<PromiseValue<T>>>, PromiseError> {
        let aggregate = Promise::deferred(pool);
        let tally = Tally::new(inputs.len());
        for (index, input) in inputs.iter().enumerate() {
            let action = Arc::clone(aggregate.action());
            let tally = Arc::clone(&tally);
            input.on_complete(move |status, value| {
                let settled = PromiseValue::Settled {
                    status,
                    value: Box::new(value.untagged()),
                };
                tally.complete(index, settled);
                let rejection = tally.first_in_order(|index, settled| match settled {
                    PromiseValue::Settled {
                        status: PromiseStatus::Rejected,
                        value,
                    } => Some(
                        value
                            .failure()
                            .cloned()
                            .unwrap_or_else(|| PromiseError::Rejected { index }.into()),
                    ),
                    _ => None,
                });
                match rejection {
                    InOrder::Pending => {}
                    InOrder::Found(failure) => {
                        if tally.decide() {
                            let _ = action.reject(PromiseValue::Error(failure));
                        }
                    }
                    InOrder::Exhausted => {
                        if tally.decide() {
                            let values = tally.take_all().into_iter().map(PromiseValue::untagged).collect();
                            let _ = action.resolve(PromiseValue::Value(values));
                        }
                    }
                }
            })?;
        }
        start_inputs(&aggregate, inputs, |action| action.resolve(PromiseValue::Value(Vec::new())));
        Ok(aggregate)
    }

    /// Resolve with every input's outcome as [`PromiseValue::Settled`], in input order.
    ///
    /// # Errors
    ///
    /// As [`all`](Self::all).
    pub fn all_settled(
        pool: &Arc<WorkerPool>,
        inputs: Vec<Self>,
    ) -> Result<Promise<Vec<PromiseValue<T>>>, PromiseError> {
        let aggregate = Promise::deferred(pool);
        let tally = Tally::new(inputs.len());
        for (index, input) in inputs.iter().enumerate() {
            let action = Arc::clone(aggregate.action());
            let tally = Arc::clone(&tally);
            input.on_complete(move |status, value| {
                let settled = PromiseValue::Settled {
                    status,
                    value: Box::new(value.untagged()),
                };
                if tally.complete(index, settled) && tally.decide() {
                    let _ = action.resolve(PromiseValue::Value(tally.take_all()));
                }
            })?;
        }
        start_inputs(&aggregate, inputs, |action| action.resolve(PromiseValue::Value(Vec::new())));
        Ok(aggregate)
    }

    /// Resolve with the first fulfilled input's value.
    ///
    /// Rejects with [`PromiseError::NoneResolved`] once every input is
    /// rejected, or right away for an empty input list.
    ///
    /// # Errors
    ///
    /// As [`all`](Self::all).
    pub fn any(pool: &Arc<WorkerPool>, inputs: Vec<Self>) -> Result<Self, PromiseError> {
        let aggregate = Self::deferred(pool);
        let tally = Tally::<()>::new(inputs.len());
        for (index, input) in inputs.iter().enumerate() {
            let action = Arc::clone(aggregate.action());
            let tally = Arc::clone(&tally);
            input.on_complete(move |status, value| {
                if status == PromiseStatus::Fulfilled {
                    if tally.decide() {
                        let _ = action.resolve(value.untagged());
                    }
                } else if tally.complete(index, ()) && tally.decide() {
                    let _ = action.reject(PromiseValue::Error(PromiseError::NoneResolved.into()));
                }
            })?;
        }
        start_inputs(&aggregate, inputs, |action| {
            action.reject(PromiseValue::Error(PromiseError::NoneResolved.into()))
        });
        Ok(aggregate)
    }

    /// Settle like the first input to finalize.
    ///
    /// An empty input list resolves with [`PromiseValue::Empty`].
    ///
    /// # Errors
    ///
    /// As [`all`](Self::all).
    pub fn race(pool: &Arc<WorkerPool>, inputs: Vec<Self>) -> Result<Self, PromiseError> {
        let aggregate = Self::deferred(pool);
        let tally = Tally::<()>::new(inputs.len());
        for input in &inputs {
            let action = Arc::clone(aggregate.action());
            let tally = Arc::clone(&tally);
            input.on_complete(move |status, value| {
                if !tally.decide() {
                    return;
                }
                let value = value.untagged();
                let _ = if status == PromiseStatus::Rejected {
                    action.reject(value)
                } else {
                    action.resolve(value)
                };
            })?;
        }
        start_inputs(&aggregate, inputs, |action| action.resolve(PromiseValue::Empty));
        Ok(aggregate)
    }
}
