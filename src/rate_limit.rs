//! Per-client admission control.
//!
//! - [`RateLimiter`]: emits telemetry and falls back when the durable backend fails.
//! - [`AdmissionStrategy`]: the counting algorithm behind it.
//! - [`FixedWindow`]: in-process buckets over a bounded [`FallbackStore`](crate::store::FallbackStore).
//! - [`SlidingWindow`]: two-bucket weighted estimate over a [`DurableStore`](crate::store::DurableStore).
//!
//! The backend is chosen once at construction; a failing durable call is answered
//! by the fixed window for that call only.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub mod fixed_window;
pub mod sliding_window;
pub use fixed_window::FixedWindow;
pub use sliding_window::SlidingWindow;

use crate::config::ConfigError;
use crate::error::{Guarded, StoreError};
use crate::store::duration_millis;
use crate::telemetry::{
    emit_best_effort, DegradeReason, DegradedEvent, GuardEvent, LogSink, RateLimitEvent,
    TelemetrySink,
};

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// The request may proceed.
    Allowed {
        /// Requests left in the current window.
        remaining: u32,
    },
    /// The client exhausted its quota.
    Denied {
        /// Milliseconds until the window rolls over.
        retry_after_ms: u64,
        /// Epoch millis at which the window rolls over.
        reset_at_ms: u64,
    },
}

impl RateLimitDecision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }

    /// Retry hint for denials.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            RateLimitDecision::Allowed { .. } => None,
            RateLimitDecision::Denied { retry_after_ms, .. } => Some(*retry_after_ms),
        }
    }
}

/// Quota shared by every strategy: `max_requests` per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    max_requests: u32,
    window: Duration,
}

impl RateLimitPolicy {
    /// Validate and build a policy. Both values must be non-zero.
    pub fn new(max_requests: u32, window: Duration) -> Result<Self, ConfigError> {
        if max_requests == 0 {
            return Err(ConfigError::Invalid {
                name: "RATE_LIMIT_MAX_REQUESTS",
                reason: "must be > 0".into(),
            });
        }
        if duration_millis(window) == 0 {
            return Err(ConfigError::Invalid {
                name: "RATE_LIMIT_WINDOW_MS",
                reason: "must be at least 1ms".into(),
            });
        }
        Ok(Self { max_requests, window })
    }

    /// Requests admitted per window.
    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Window length in whole milliseconds (never zero).
    pub fn window_ms(&self) -> u64 {
        duration_millis(self.window).max(1)
    }
}

/// Counting algorithm behind a [`RateLimiter`].
#[async_trait]
pub trait AdmissionStrategy: Send + Sync + fmt::Debug {
    /// Count one request for `identifier` and decide whether it may proceed.
    async fn check(&self, identifier: &str) -> Result<RateLimitDecision, StoreError>;

    /// Forget in-process state. Durable counters expire on their own.
    fn reset(&self) {}
}

/// Rate limiter with telemetry and optional in-process fallback.
///
/// Cheap to clone; clones share counters.
#[derive(Clone)]
pub struct RateLimiter<S = LogSink> {
    primary: Arc<dyn AdmissionStrategy>,
    fallback: Option<Arc<FixedWindow>>,
    sink: S,
}

impl<S: fmt::Debug> fmt::Debug for RateLimiter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("primary", &self.primary)
            .field("fallback", &self.fallback.is_some())
            .field("sink", &self.sink)
            .finish()
    }
}

impl<S: TelemetrySink> RateLimiter<S> {
    /// Limit purely in-process.
    pub fn in_memory(window: FixedWindow, sink: S) -> Self {
        Self { primary: Arc::new(window), fallback: None, sink }
    }

    /// Limit against a durable store. `fallback` answers when the store fails;
    /// without it such calls are [`Guarded::Fatal`].
    pub fn durable(primary: SlidingWindow, fallback: Option<FixedWindow>, sink: S) -> Self {
        Self { primary: Arc::new(primary), fallback: fallback.map(Arc::new), sink }
    }

    /// Limit with an arbitrary strategy.
    pub fn with_strategy<A>(primary: A, fallback: Option<FixedWindow>, sink: S) -> Self
    where
        A: AdmissionStrategy + 'static,
    {
        Self { primary: Arc::new(primary), fallback: fallback.map(Arc::new), sink }
    }

    /// Count one request for `identifier`.
    pub async fn admit(&self, identifier: &str) -> Guarded<RateLimitDecision> {
        match self.primary.check(identifier).await {
            Ok(decision) => {
                self.observe(identifier, &decision).await;
                Guarded::Ok(decision)
            }
            Err(cause) => {
                emit_best_effort(
                    self.sink.clone(),
                    GuardEvent::Degraded(DegradedEvent {
                        reason: DegradeReason::RateLimitFailure,
                        message: cause.to_string(),
                        identifier: Some(identifier.to_owned()),
                    }),
                )
                .await;

                let Some(fallback) = &self.fallback else {
                    return Guarded::Fatal(cause);
                };
                let value = fallback.evaluate(identifier);
                self.observe(identifier, &value).await;
                Guarded::Degraded { value, cause }
            }
        }
    }

    /// Forget all in-process counters.
    pub fn reset(&self) {
        self.primary.reset();
        if let Some(fallback) = &self.fallback {
            fallback.reset();
        }
    }

    async fn observe(&self, identifier: &str, decision: &RateLimitDecision) {
        if let RateLimitDecision::Denied { reset_at_ms, .. } = *decision {
            emit_best_effort(
                self.sink.clone(),
                GuardEvent::RateLimit(RateLimitEvent::Blocked {
                    identifier: identifier.to_owned(),
                    remaining: 0,
                    reset_at_ms,
                }),
            )
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryDurableStore;
    use crate::telemetry::{MemorySink, NullSink};

    fn policy(max: u32, window_ms: u64) -> RateLimitPolicy {
        RateLimitPolicy::new(max, Duration::from_millis(window_ms)).unwrap()
    }

    #[test]
    fn policy_rejects_zero_values() {
        assert!(RateLimitPolicy::new(0, Duration::from_secs(1)).is_err());
        assert!(RateLimitPolicy::new(1, Duration::ZERO).is_err());
        assert!(RateLimitPolicy::new(1, Duration::from_micros(10)).is_err());
        assert_eq!(policy(3, 250).window_ms(), 250);
    }

    #[tokio::test]
    async fn denial_emits_blocked_event() {
        let clock = ManualClock::starting_at(1_000);
        let sink = MemorySink::new();
        let limiter =
            RateLimiter::in_memory(FixedWindow::new(policy(1, 500), 10, clock.clone()), sink.clone());

        assert!(limiter.admit("a").await.value().is_some_and(RateLimitDecision::is_allowed));
        let denied = limiter.admit("a").await;
        assert!(denied.is_ok());
        assert_eq!(denied.value().and_then(RateLimitDecision::retry_after_ms), Some(500));
        assert_eq!(sink.names(), vec!["rate_limit_blocked"]);
    }

    #[tokio::test]
    async fn store_failure_uses_fallback_and_reports_degraded() {
        let clock = ManualClock::starting_at(0);
        let store = InMemoryDurableStore::with_clock(clock.clone());
        store.set_available(false);
        let sink = MemorySink::new();
        let limiter = RateLimiter::durable(
            SlidingWindow::new(Arc::new(store), "test", policy(2, 1_000), clock.clone()),
            Some(FixedWindow::new(policy(2, 1_000), 10, clock.clone())),
            sink.clone(),
        );

        let first = limiter.admit("ip").await;
        assert!(first.is_degraded());
        assert_eq!(first.value(), Some(&RateLimitDecision::Allowed { remaining: 1 }));
        assert_eq!(sink.names(), vec!["chat_rate_guard_error"]);
    }

    #[tokio::test]
    async fn store_failure_without_fallback_is_fatal() {
        let clock = ManualClock::starting_at(0);
        let store = InMemoryDurableStore::with_clock(clock.clone());
        store.set_available(false);
        let limiter = RateLimiter::durable(
            SlidingWindow::new(Arc::new(store), "test", policy(2, 1_000), clock),
            None,
            MemorySink::new(),
        );
        assert!(limiter.admit("ip").await.is_fatal());
    }

    #[tokio::test]
    async fn reset_clears_fallback_counters() {
        let clock = ManualClock::starting_at(0);
        let limiter =
            RateLimiter::in_memory(FixedWindow::new(policy(1, 1_000), 10, clock), NullSink);
        assert!(limiter.admit("a").await.value().is_some_and(RateLimitDecision::is_allowed));
        assert!(!limiter.admit("a").await.value().is_some_and(RateLimitDecision::is_allowed));
        limiter.reset();
        assert!(limiter.admit("a").await.value().is_some_and(RateLimitDecision::is_allowed));
    }
}
