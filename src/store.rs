//! Storage for guard state.
//!
//! - [`DurableStore`]: the key/value contract a shared backend must satisfy. All
//!   operations are async and independently failable; increments are atomic so
//!   several process instances can share one view without lost updates.
//! - [`RedisStore`]: the production backend.
//! - [`InMemoryDurableStore`]: a process-local implementation of the same contract.
//! - [`FallbackStore`]: the bounded bucket map used by the in-process rate limiter.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

pub mod fallback;
pub mod memory;
pub mod redis;

pub use fallback::{Bucket, FallbackStore};
pub use memory::InMemoryDurableStore;
pub use self::redis::RedisStore;

/// How [`DurableStore::increment_with_expiry`] treats an existing expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Restart the countdown on every increment.
    Refresh,
    /// Keep a running countdown; set one only when the key has none.
    IfMissing,
}

/// Abstract key/value interface for shared guard state.
///
/// Values are integers: request counters, failure counters and timestamps.
#[async_trait]
pub trait DurableStore: Send + Sync + std::fmt::Debug {
    /// Read a value; `None` when the key is absent or expired.
    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError>;

    /// Atomically add one, creating the key at 1 when absent. Returns the new value.
    async fn increment(&self, key: &str) -> Result<i64, StoreError>;

    /// Atomically subtract one. Returns the new value.
    async fn decrement(&self, key: &str) -> Result<i64, StoreError>;

    /// Atomically add one and apply `ttl` according to `expiry`, as a single unit.
    ///
    /// A counter written this way can never be left without an expiry.
    async fn increment_with_expiry(
        &self,
        key: &str,
        ttl: Duration,
        expiry: Expiry,
    ) -> Result<i64, StoreError>;

    /// Expire `key` after `ttl`. No-op when the key is absent.
    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Overwrite `key` with `value`, expiring after `ttl`.
    async fn set_with_expiry(&self, key: &str, value: i64, ttl: Duration)
        -> Result<(), StoreError>;

    /// Remove every listed key.
    async fn delete(&self, keys: &[&str]) -> Result<(), StoreError>;
}

pub(crate) fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
