//! Error types for promise chains and the worker pool.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Errors produced by promise registration, dispatch and the worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PromiseError {
    /// A registration or start call arrived after the promise was started.
    #[error("promise has already started")]
    AlreadyStarted,
    /// A chain operation arrived before the promise was started.
    #[error("promise has not started")]
    NotStarted,
    /// The promise delivers its result to a completion callback, so it cannot be awaited.
    #[error("promise completion is delivered to a callback and cannot be awaited")]
    AwaitUnavailable,
    /// A wait signal or completion callback was already installed.
    #[error("wait gate is already set")]
    WaitGateAlreadySet,
    /// The worker pool has been stopped.
    #[error("worker pool has been stopped")]
    PoolShutdown,
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
    /// No promise handed to `any` was fulfilled.
    #[error("no promise in any() was resolved")]
    NoneResolved,
    /// A promise handed to `all` was rejected with a non-error value.
    #[error("promise #{index} in all() was rejected")]
    Rejected {
        /// Position of the rejected promise in the input list.
        index: usize,
    },
    /// Internal invariant failure.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Application-facing result using anyhow; stage callbacks and end calls return it.
pub type AppResult<T> = Result<T, anyhow::Error>;

/// Failure raised when a stage callback panics instead of returning.
#[derive(Debug, Clone, Error)]
#[error("stage panicked: {0}")]
pub struct StagePanic(pub String);

/// Error-like chain value.
///
/// Cheap to clone; every stage error, panic or dispatch failure that ends up
/// on the rejection track travels as a `PromiseFailure`.
#[derive(Clone)]
pub struct PromiseFailure {
    inner: Arc<anyhow::Error>,
}

impl PromiseFailure {
    /// Wrap any error.
    pub fn new(error: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: Arc::new(error.into()),
        }
    }

    /// Build a failure from a plain message.
    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self::new(anyhow::Error::msg(message))
    }

    /// Convert a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::new(StagePanic(message))
    }

    /// Borrow the underlying error.
    #[must_use]
    pub fn error(&self) -> &anyhow::Error {
        &self.inner
    }

    /// Attempt to downcast the underlying error.
    #[must_use]
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.inner.downcast_ref::<E>()
    }
}

impl fmt::Display for PromiseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.inner, f)
    }
}

impl fmt::Debug for PromiseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PromiseFailure").field(&format_args!("{}", self.inner)).finish()
    }
}

impl std::error::Error for PromiseFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for PromiseFailure {
    fn from(error: anyhow::Error) -> Self {
        Self {
            inner: Arc::new(error),
        }
    }
}

impl From<PromiseError> for PromiseFailure {
    fn from(error: PromiseError) -> Self {
        Self::new(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promise_error_display() {
        assert_eq!(PromiseError::AlreadyStarted.to_string(), "promise has already started");
        assert_eq!(PromiseError::NotStarted.to_string(), "promise has not started");
        assert_eq!(
            PromiseError::Rejected { index: 2 }.to_string(),
            "promise #2 in all() was rejected"
        );
    }

    #[test]
    fn test_failure_from_panic_payloads() {
        let failure = PromiseFailure::from_panic(Box::new("boom"));
        assert_eq!(failure.to_string(), "stage panicked: boom");
        assert!(failure.downcast_ref::<StagePanic>().is_some());

        let failure = PromiseFailure::from_panic(Box::new(String::from("owned")));
        assert_eq!(failure.to_string(), "stage panicked: owned");

        let failure = PromiseFailure::from_panic(Box::new(7_u8));
        assert_eq!(failure.to_string(), "stage panicked: non-string panic payload");
    }

    #[test]
    fn test_failure_downcast_promise_error() {
        let failure = PromiseFailure::from(PromiseError::PoolShutdown);
        assert_eq!(failure.downcast_ref::<PromiseError>(), Some(&PromiseError::PoolShutdown));
        let cloned = failure.clone();
        assert_eq!(cloned.to_string(), "worker pool has been stopped");
    }
}
