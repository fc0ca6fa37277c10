use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{AdmissionStrategy, RateLimitDecision, RateLimitPolicy};
use crate::clock::Clock;
use crate::error::StoreError;
use crate::store::{DurableStore, Expiry};

/// Sliding-window estimate over two fixed sub-windows in a durable store.
///
/// The estimate is `floor(previous * (window - elapsed) / window) + current`.
/// The current counter is incremented before the estimate is computed and rolled
/// back on denial, so concurrent callers each see a distinct count and the limit
/// holds across every process sharing the store.
#[derive(Debug)]
pub struct SlidingWindow {
    store: Arc<dyn DurableStore>,
    prefix: String,
    policy: RateLimitPolicy,
    clock: Arc<dyn Clock>,
}

impl SlidingWindow {
    /// Count under `"{prefix}:rate:{identifier}:{window_index}"`.
    pub fn new<C: Clock + 'static>(
        store: Arc<dyn DurableStore>,
        prefix: impl Into<String>,
        policy: RateLimitPolicy,
        clock: C,
    ) -> Self {
        Self { store, prefix: prefix.into(), policy, clock: Arc::new(clock) }
    }

    fn key(&self, identifier: &str, window_index: u64) -> String {
        format!("{}:rate:{}:{}", self.prefix, identifier, window_index)
    }
}

#[async_trait]
impl AdmissionStrategy for SlidingWindow {
    async fn check(&self, identifier: &str) -> Result<RateLimitDecision, StoreError> {
        let now = self.clock.now_millis();
        let window = self.policy.window_ms();
        let index = now / window;
        let elapsed = now % window;
        let current_key = self.key(identifier, index);

        let ttl = Duration::from_millis(window.saturating_mul(2));
        let current = self.store.increment_with_expiry(&current_key, ttl, Expiry::IfMissing).await?;
        let previous = match index.checked_sub(1) {
            Some(previous_index) => {
                self.store.get(&self.key(identifier, previous_index)).await?.unwrap_or(0)
            }
            None => 0,
        };

        let previous = u128::from(previous.max(0).unsigned_abs());
        let current = u128::from(current.max(0).unsigned_abs());
        let estimate = previous * u128::from(window - elapsed) / u128::from(window) + current;
        let max = u128::from(self.policy.max_requests());

        if estimate > max {
            self.store.decrement(&current_key).await?;
            let reset_at_ms = index.saturating_add(1).saturating_mul(window);
            return Ok(RateLimitDecision::Denied {
                retry_after_ms: reset_at_ms.saturating_sub(now),
                reset_at_ms,
            });
        }

        let remaining = u32::try_from(max - estimate).unwrap_or(u32::MAX);
        Ok(RateLimitDecision::Allowed { remaining })
    }
}
