//! Failure taxonomy of the bridge.
//!
//! Nothing in here is a routine condition: a [`CoverageError::Protocol`] means the
//! managed runtime drove the bridge out of order, a [`CoverageError::CrossBoundary`]
//! means one of its own hooks failed underneath us.

use thiserror::Error;

/// Caller bugs detected by the bridge itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("coverage tracker is already initialized")]
    AlreadyInitialized,
    #[error("coverage tracker must be initialized before registering counters")]
    NotInitialized,
    #[error("count must not decrease (old = {old}, new = {new})")]
    CountDecreased { old: usize, new: usize },
    #[error("counter range [{old}, {new}) does not match the {registered} registered counters")]
    CountMismatch {
        old: usize,
        new: usize,
        registered: usize,
    },
    #[error("{requested} counters exceed the capacity of {capacity}")]
    CapacityExceeded { requested: usize, capacity: usize },
    #[error("coverage queried before any counters were registered")]
    EmptyTable,
    #[error("address {address:#x} is not a synthetic pc of this tracker")]
    ForeignAddress { address: usize },
    #[error("counter count must not be negative (got {count})")]
    NegativeCount { count: i64 },
    #[error("`{operation}` re-entered the bridge while another call was in progress")]
    Reentrant { operation: &'static str },
    #[error("counter buffer must not be null")]
    NullCounters,
}

#[derive(Debug, Error)]
pub enum CoverageError {
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
    /// A managed-runtime hook reported failure.
    #[error("managed runtime call `{hook}` failed: {diagnostic}")]
    CrossBoundary {
        hook: &'static str,
        diagnostic: String,
    },
    #[error("failed to write coverage report: {0}")]
    Io(#[from] std::io::Error),
}

impl CoverageError {
    pub fn cross_boundary(hook: &'static str, diagnostic: impl Into<String>) -> Self {
        Self::CrossBoundary {
            hook,
            diagnostic: diagnostic.into(),
        }
    }

    /// The protocol violation behind this error, if that is what it is.
    pub fn protocol(&self) -> Option<&ProtocolViolation> {
        match self {
            Self::Protocol(violation) => Some(violation),
            _ => None,
        }
    }
}

pub type Result<T, E = CoverageError> = core::result::Result<T, E>;
