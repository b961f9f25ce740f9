//! Chain values and promise status.

use serde::{Deserialize, Serialize};

use super::error::PromiseFailure;

/// Marker trait for values carried through a promise chain.
///
/// Values cross thread boundaries and are cloned when a stage may need to be
/// re-rejected with its own payload, or when several waiters read the result.
pub trait PromiseData: Clone + Send + 'static {}

impl<T> PromiseData for T where T: Clone + Send + 'static {}

/// Lifecycle status of a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PromiseStatus {
    /// Not started yet.
    None = 0,
    /// Started, no stage has settled the track yet.
    Pending = 1,
    /// On, or finished on, the success track.
    Fulfilled = 2,
    /// On, or finished on, the rejection track.
    Rejected = 3,
}

impl PromiseStatus {
    pub(crate) const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Pending,
            2 => Self::Fulfilled,
            3 => Self::Rejected,
            _ => Self::None,
        }
    }

    /// Whether the status is terminal-capable (`Fulfilled` or `Rejected`).
    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Fulfilled | Self::Rejected)
    }
}

/// A value flowing through a chain.
#[derive(Debug, Clone)]
pub enum PromiseValue<T> {
    /// No value; what an implicit resolve delivers.
    Empty,
    /// A plain value.
    Value(T),
    /// An error-like value.
    Error(PromiseFailure),
    /// The value handed to an `allways` stage, tagged with the track that delivered it.
    Settled {
        /// `Fulfilled` when delivered by resolve, `Rejected` when delivered by reject.
        status: PromiseStatus,
        /// The delivered value.
        value: Box<PromiseValue<T>>,
    },
}

impl<T> PromiseValue<T> {
    /// Build an error-like value from any error.
    pub fn error(error: impl Into<anyhow::Error>) -> Self {
        Self::Error(PromiseFailure::new(error))
    }

    /// Whether this value is error-like; decides the final status of `exit`.
    #[must_use]
    pub const fn is_error_like(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Whether this value is `Empty`.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Borrow the plain value, looking through `Settled`.
    #[must_use]
    pub fn as_value(&self) -> Option<&T> {
        match self {
            Self::Value(v) => Some(v),
            Self::Settled { value, .. } => value.as_value(),
            _ => None,
        }
    }

    /// Take the plain value, looking through `Settled`.
    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Value(v) => Some(v),
            Self::Settled { value, .. } => value.into_value(),
            _ => None,
        }
    }

    /// Borrow the failure, looking through `Settled`.
    #[must_use]
    pub fn failure(&self) -> Option<&PromiseFailure> {
        match self {
            Self::Error(f) => Some(f),
            Self::Settled { value, .. } => value.failure(),
            _ => None,
        }
    }

    /// Track that delivered an `allways` stage payload, if tagged.
    #[must_use]
    pub const fn settled_status(&self) -> Option<PromiseStatus> {
        match self {
            Self::Settled { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Strip a `Settled` tag.
    pub fn untagged(self) -> Self {
        match self {
            Self::Settled { value, .. } => value.untagged(),
            other => other,
        }
    }
}

impl<T> Default for PromiseValue<T> {
    fn default() -> Self {
        Self::Empty
    }
}

impl<T> From<T> for PromiseValue<T> {
    fn from(value: T) -> Self {
        Self::Value(value)
    }
}
