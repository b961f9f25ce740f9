//! Builder-style façade over [`PromiseAction`].
//!
//! ```rust,ignore
//! use prometheus_promise::config::PromiseWorkerConfig;
//! use prometheus_promise::core::{Promise, PromiseValue, WorkerPool};
//!
//! let pool = WorkerPool::new(PromiseWorkerConfig::default())?;
//! let promise = Promise::with_value(&pool, String::from("a"));
//! promise
//!     .then(|action, value| {
//!         let v = value.into_value().unwrap_or_default();
//!         action.resolve(format!("{v}b").into())?;
//!         Ok(())
//!     })?
//!     .start()?;
//! assert_eq!(promise.wait_to()?.into_value().as_deref(), Some("ab"));
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::action::{Launch, PromiseAction, PromiseContext, StageMode};
use super::error::{AppResult, PromiseError};
use super::signal::WaitSignal;
use super::value::{PromiseData, PromiseStatus, PromiseValue};
use super::worker_pool::WorkerPool;

/// A promise chain bound to a worker pool.
///
/// Stages are registered with [`then`](Self::then), [`error`](Self::error)
/// and [`allways`](Self::allways), then the chain is set in motion with
/// [`start`](Self::start). Registration returns `&Self`, so calls chain with `?`.
pub struct Promise<T: PromiseData> {
    action: Arc<PromiseAction<T>>,
    launch: Mutex<Option<Launch<T>>>,
}

impl<T: PromiseData> Promise<T> {
    fn from_launch(pool: &Arc<WorkerPool>, launch: Launch<T>) -> Self {
        Self {
            action: PromiseAction::new(Arc::clone(pool)),
            launch: Mutex::new(Some(launch)),
        }
    }

    /// A promise whose first stage receives [`PromiseValue::Empty`].
    #[must_use]
    pub fn new(pool: &Arc<WorkerPool>) -> Self {
        Self::from_launch(pool, Launch::Resolve(PromiseValue::Empty))
    }

    /// A promise whose first stage receives `value`.
    #[must_use]
    pub fn with_value(pool: &Arc<WorkerPool>, value: T) -> Self {
        Self::from_launch(pool, Launch::Resolve(PromiseValue::Value(value)))
    }

    /// A promise started by running `call` on a worker.
    ///
    /// If `call` returns without resolving or rejecting, the chain is
    /// resolved with an empty value; an error rejects it.
    #[must_use]
    pub fn with_call<F>(pool: &Arc<WorkerPool>, call: F) -> Self
    where
        F: FnOnce(&PromiseAction<T>) -> AppResult<()> + Send + 'static,
    {
        Self::from_launch(pool, Launch::Call(Box::new(call)))
    }

    /// A promise that starts without dispatching anything. The holder of
    /// [`action`](Self::action) resolves or rejects it later.
    #[must_use]
    pub fn deferred(pool: &Arc<WorkerPool>) -> Self {
        Self::from_launch(pool, Launch::Manual)
    }

    pub(crate) fn set_launch(&self, launch: Launch<T>) {
        *self.launch.lock() = Some(launch);
    }

    /// Register a stage run when the chain is resolved.
    ///
    /// # Errors
    ///
    /// `PromiseError::AlreadyStarted` after `start`.
    pub fn then<F>(&self, call: F) -> Result<&Self, PromiseError>
    where
        F: FnOnce(&PromiseAction<T>, PromiseValue<T>) -> AppResult<()> + Send + 'static,
    {
        self.action.register(StageMode::Then, Box::new(call))?;
        Ok(self)
    }

    /// Register a stage run when the chain is rejected.
    ///
    /// # Errors
    ///
    /// `PromiseError::AlreadyStarted` after `start`.
    pub fn error<F>(&self, call: F) -> Result<&Self, PromiseError>
    where
        F: FnOnce(&PromiseAction<T>, PromiseValue<T>) -> AppResult<()> + Send + 'static,
    {
        self.action.register(StageMode::Error, Box::new(call))?;
        Ok(self)
    }

    /// Register a stage run on either track.
    ///
    /// The stage receives [`PromiseValue::Settled`], tagged with the track
    /// that delivered the value.
    ///
    /// # Errors
    ///
    /// `PromiseError::AlreadyStarted` after `start`.
    pub fn allways<F>(&self, call: F) -> Result<&Self, PromiseError>
    where
        F: FnOnce(&PromiseAction<T>, PromiseValue<T>) -> AppResult<()> + Send + 'static,
    {
        self.action.register(StageMode::Any, Box::new(call))?;
        Ok(self)
    }

    /// Register `ok` as a THEN stage followed by `err` as an ERROR stage.
    ///
    /// # Errors
    ///
    /// `PromiseError::AlreadyStarted` after `start`.
    pub fn then_or_error<F, E>(&self, ok: F, err: E) -> Result<&Self, PromiseError>
    where
        F: FnOnce(&PromiseAction<T>, PromiseValue<T>) -> AppResult<()> + Send + 'static,
        E: FnOnce(&PromiseAction<T>, PromiseValue<T>) -> AppResult<()> + Send + 'static,
    {
        self.then(ok)?.error(err)
    }

    /// Run `call` once when the chain finalizes. Its errors are logged and dropped.
    ///
    /// # Errors
    ///
    /// `PromiseError::AlreadyStarted` after `start`.
    pub fn finally_to<F>(&self, call: F) -> Result<&Self, PromiseError>
    where
        F: FnOnce(&PromiseAction<T>) -> AppResult<()> + Send + 'static,
    {
        self.action.set_end_call(Box::new(call))?;
        Ok(self)
    }

    /// Deliver the final status and value to `call` instead of waking waiters.
    ///
    /// A promise with a completion callback cannot be awaited.
    ///
    /// # Errors
    ///
    /// `AlreadyStarted` after `start`, `WaitGateAlreadySet` if a gate exists.
    pub fn on_complete<F>(&self, call: F) -> Result<&Self, PromiseError>
    where
        F: FnOnce(PromiseStatus, PromiseValue<T>) + Send + 'static,
    {
        self.action.set_complete_call(Box::new(call))?;
        Ok(self)
    }

    /// Wake `signal` when the chain finalizes.
    ///
    /// Several promises may share one signal; see [`WaitSignal`].
    ///
    /// # Errors
    ///
    /// `AlreadyStarted` after `start`, `WaitGateAlreadySet` if a gate exists.
    pub fn with_wait_signal(&self, signal: Arc<WaitSignal>) -> Result<&Self, PromiseError> {
        self.action.set_wait_signal(signal)?;
        Ok(self)
    }

    /// Start the chain.
    ///
    /// # Errors
    ///
    /// `AlreadyStarted` on a second call; a pool error if the first dispatch fails.
    pub fn start(&self) -> Result<&Self, PromiseError> {
        self.launch(None)
    }

    /// Start the chain with a context readable from stages through
    /// [`PromiseAction::context`].
    ///
    /// # Errors
    ///
    /// As [`start`](Self::start).
    pub fn start_with(&self, context: PromiseContext) -> Result<&Self, PromiseError> {
        self.launch(Some(context))
    }

    fn launch(&self, context: Option<PromiseContext>) -> Result<&Self, PromiseError> {
        let launch = self.launch.lock().take().ok_or(PromiseError::AlreadyStarted)?;
        self.action.start(launch, context)?;
        Ok(self)
    }

    /// Block until the chain finalizes and return the final value.
    ///
    /// # Errors
    ///
    /// See [`PromiseAction::wait_to`].
    pub fn wait_to(&self) -> Result<PromiseValue<T>, PromiseError> {
        self.action.wait_to()
    }

    /// Block for at most `timeout`; `Ok(None)` reports a timeout.
    ///
    /// # Errors
    ///
    /// See [`PromiseAction::wait_to`].
    pub fn wait_for(&self, timeout: Duration) -> Result<Option<PromiseValue<T>>, PromiseError> {
        self.action.wait_for(timeout)
    }

    /// Await the final value from async code without blocking the runtime.
    ///
    /// # Errors
    ///
    /// See [`PromiseAction::wait_to`]; `Internal` if the blocking task fails.
    #[cfg(feature = "tokio-runtime")]
    pub async fn wait_async(&self) -> Result<PromiseValue<T>, PromiseError> {
        let action = Arc::clone(&self.action);
        tokio::task::spawn_blocking(move || action.wait_to())
            .await
            .map_err(|e| PromiseError::Internal(format!("wait task failed: {e}")))?
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> PromiseStatus {
        self.action.status()
    }

    /// Whether the chain has finalized.
    #[must_use]
    pub fn is_exit(&self) -> bool {
        self.action.is_exit()
    }

    /// Whether the chain has started.
    #[must_use]
    pub fn is_start(&self) -> bool {
        self.action.is_start()
    }

    /// The underlying state machine.
    #[must_use]
    pub const fn action(&self) -> &Arc<PromiseAction<T>> {
        &self.action
    }
}

impl<T: PromiseData> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").field("action", &self.action).finish()
    }
}
