use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use super::{AdmissionStrategy, RateLimitDecision, RateLimitPolicy};
use crate::clock::Clock;
use crate::error::StoreError;
use crate::store::{Bucket, FallbackStore};

/// Fixed-window counter held in process memory.
///
/// The first request for an identifier, or the first one at or after its
/// bucket's `reset_at`, opens a fresh window. The backing map is pruned before
/// every evaluation so it never grows past `max_keys` for long.
#[derive(Debug)]
pub struct FixedWindow {
    policy: RateLimitPolicy,
    buckets: Mutex<FallbackStore>,
    clock: Arc<dyn Clock>,
}

impl FixedWindow {
    /// Track at most `max_keys` identifiers.
    pub fn new<C: Clock + 'static>(policy: RateLimitPolicy, max_keys: usize, clock: C) -> Self {
        Self { policy, buckets: Mutex::new(FallbackStore::new(max_keys)), clock: Arc::new(clock) }
    }

    /// Count one request for `identifier`. Never fails.
    pub fn evaluate(&self, identifier: &str) -> RateLimitDecision {
        let now = self.clock.now_millis();
        let max = self.policy.max_requests();
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        buckets.prune(now);

        match buckets.get(identifier) {
            Some(bucket) if !bucket.is_expired(now) => {
                if bucket.count < max {
                    let count = bucket.count + 1;
                    buckets.set(identifier, Bucket { count, ..bucket });
                    RateLimitDecision::Allowed { remaining: max - count }
                } else {
                    RateLimitDecision::Denied {
                        retry_after_ms: bucket.reset_at_ms.saturating_sub(now),
                        reset_at_ms: bucket.reset_at_ms,
                    }
                }
            }
            _ => {
                let reset_at_ms = now.saturating_add(self.policy.window_ms());
                buckets.set(identifier, Bucket { count: 1, reset_at_ms });
                RateLimitDecision::Allowed { remaining: max - 1 }
            }
        }
    }

    /// Identifiers currently tracked.
    pub fn tracked(&self) -> usize {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Forget every bucket.
    pub fn reset(&self) {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[async_trait]
impl AdmissionStrategy for FixedWindow {
    async fn check(&self, identifier: &str) -> Result<RateLimitDecision, StoreError> {
        Ok(self.evaluate(identifier))
    }

    fn reset(&self) {
        FixedWindow::reset(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn window(max: u32, window_ms: u64, max_keys: usize, clock: &ManualClock) -> FixedWindow {
        let policy = RateLimitPolicy::new(max, Duration::from_millis(window_ms)).unwrap();
        FixedWindow::new(policy, max_keys, clock.clone())
    }

    #[test]
    fn counts_down_then_denies() {
        let clock = ManualClock::starting_at(10_000);
        let limiter = window(3, 1_000, 10, &clock);
        assert_eq!(limiter.evaluate("a"), RateLimitDecision::Allowed { remaining: 2 });
        assert_eq!(limiter.evaluate("a"), RateLimitDecision::Allowed { remaining: 1 });
        assert_eq!(limiter.evaluate("a"), RateLimitDecision::Allowed { remaining: 0 });
        clock.advance(400);
        assert_eq!(
            limiter.evaluate("a"),
            RateLimitDecision::Denied { retry_after_ms: 600, reset_at_ms: 11_000 }
        );
    }

    #[test]
    fn identifiers_are_independent() {
        let clock = ManualClock::starting_at(0);
        let limiter = window(1, 1_000, 10, &clock);
        assert!(limiter.evaluate("a").is_allowed());
        assert!(limiter.evaluate("b").is_allowed());
        assert!(!limiter.evaluate("a").is_allowed());
    }

    #[test]
    fn window_reopens_exactly_at_reset() {
        let clock = ManualClock::starting_at(0);
        let limiter = window(1, 1_000, 10, &clock);
        assert!(limiter.evaluate("a").is_allowed());
        clock.set(999);
        assert!(!limiter.evaluate("a").is_allowed());
        clock.set(1_000);
        assert_eq!(limiter.evaluate("a"), RateLimitDecision::Allowed { remaining: 0 });
    }

    #[test]
    fn map_stays_bounded() {
        let clock = ManualClock::starting_at(0);
        let limiter = window(5, 60_000, 3, &clock);
        for i in 0..50 {
            limiter.evaluate(&format!("client-{i}"));
        }
        // Pruning runs before the insert, so one extra key may be present.
        assert!(limiter.tracked() <= 4);
    }

    #[test]
    fn expired_buckets_are_pruned_on_next_call() {
        let clock = ManualClock::starting_at(0);
        let limiter = window(5, 100, 10, &clock);
        limiter.evaluate("a");
        limiter.evaluate("b");
        clock.advance(100);
        limiter.evaluate("c");
        assert_eq!(limiter.tracked(), 1);
    }
}
