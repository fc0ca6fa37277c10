//! Error types for the chat guard.
use std::time::Duration;

use thiserror::Error;

/// Failure talking to the durable store.
///
/// Never surfaced to end users directly: the guard converts it into a fallback
/// decision, a degraded mirror update, or [`GuardError::StoreUnavailable`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The command did not complete within the configured bound.
    #[error("store command `{command}` timed out after {timeout:?}")]
    Timeout {
        /// Command name, e.g. `INCR`.
        command: &'static str,
        /// Bound that was exceeded.
        timeout: Duration,
    },
    /// No connection could be established.
    #[error("store connection failed: {0}")]
    Connection(String),
    /// The store answered with an error or an unexpected reply.
    #[error("store command `{command}` failed: {message}")]
    Command {
        /// Command name, e.g. `INCR`.
        command: &'static str,
        /// Backend message.
        message: String,
    },
}

/// Why a request was not let through to the upstream completion service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
    /// The client exhausted its quota for the current window.
    #[error("rate limit exceeded, retry after {retry_after_ms} ms")]
    RateLimited {
        /// Milliseconds until the window rolls over.
        retry_after_ms: u64,
    },
    /// The breaker is shielding the upstream service.
    #[error("circuit breaker open, upstream temporarily unavailable")]
    CircuitOpen,
    /// The durable store is unreachable and fallback is not permitted.
    #[error("guard store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
}

impl GuardError {
    /// HTTP status the request handler should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::RateLimited { .. } => 429,
            Self::CircuitOpen | Self::StoreUnavailable(_) => 503,
        }
    }

    /// Check if this error is a quota denial.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Check if this error is due to the circuit breaker.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen)
    }

    /// Retry hint for quota denials.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

/// Error returned by a guarded upstream call.
#[derive(Debug)]
pub enum GuardedCallError<E> {
    /// The guard refused the request; the upstream service was not called.
    Rejected(GuardError),
    /// The upstream service was called and failed.
    Upstream(E),
}

impl<E> GuardedCallError<E> {
    /// The refusal, if the guard stopped the call.
    pub fn rejection(&self) -> Option<&GuardError> {
        match self {
            GuardedCallError::Rejected(error) => Some(error),
            GuardedCallError::Upstream(_) => None,
        }
    }

    /// HTTP status for the response: the guard's for refusals, 502 otherwise.
    pub fn status_code(&self) -> u16 {
        match self {
            GuardedCallError::Rejected(error) => error.status_code(),
            GuardedCallError::Upstream(_) => 502,
        }
    }
}

impl<E: std::fmt::Display> std::fmt::Display for GuardedCallError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuardedCallError::Rejected(error) => write!(f, "request rejected: {}", error),
            GuardedCallError::Upstream(error) => write!(f, "upstream call failed: {}", error),
        }
    }
}

impl<E> std::error::Error for GuardedCallError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GuardedCallError::Rejected(error) => Some(error),
            GuardedCallError::Upstream(error) => Some(error),
        }
    }
}

/// Outcome of a guard operation that may have run against the fallback path.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Guarded<T> {
    /// The configured backend answered.
    Ok(T),
    /// The durable store failed; `value` was computed from in-process state.
    Degraded {
        /// Decision taken in fallback mode.
        value: T,
        /// Store failure that forced the fallback.
        cause: StoreError,
    },
    /// The durable store failed and fallback is not permitted.
    Fatal(StoreError),
}

impl<T> Guarded<T> {
    /// Check if the configured backend answered.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// Check if the fallback path was taken.
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }

    /// Check if no decision could be made.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Borrow the decision, whichever path produced it.
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Ok(value) | Self::Degraded { value, .. } => Some(value),
            Self::Fatal(_) => None,
        }
    }

    /// Collapse into a `Result`, treating degraded decisions as successful.
    pub fn into_result(self) -> Result<T, GuardError> {
        match self {
            Self::Ok(value) | Self::Degraded { value, .. } => Ok(value),
            Self::Fatal(cause) => Err(GuardError::StoreUnavailable(cause)),
        }
    }

    /// Transform the decision while keeping the path taken.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Guarded<U> {
        match self {
            Self::Ok(value) => Guarded::Ok(f(value)),
            Self::Degraded { value, cause } => Guarded::Degraded { value: f(value), cause },
            Self::Fatal(cause) => Guarded::Fatal(cause),
        }
    }
}
