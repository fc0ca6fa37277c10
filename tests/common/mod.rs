#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatguard::telemetry::MemorySink;
use chatguard::{
    ChatGuard, DurableStore, Expiry, GuardConfig, InMemoryDurableStore, ManualClock, StoreError,
};

/// Store whose every call times out.
#[derive(Debug, Default)]
pub struct FailingStore {
    calls: AtomicUsize,
}

impl FailingStore {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail<T>(&self, command: &'static str) -> Result<T, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Timeout { command, timeout: Duration::from_millis(500) })
    }
}

#[async_trait]
impl DurableStore for FailingStore {
    async fn get(&self, _key: &str) -> Result<Option<i64>, StoreError> {
        self.fail("GET")
    }

    async fn increment(&self, _key: &str) -> Result<i64, StoreError> {
        self.fail("INCR")
    }

    async fn decrement(&self, _key: &str) -> Result<i64, StoreError> {
        self.fail("DECR")
    }

    async fn increment_with_expiry(
        &self,
        _key: &str,
        _ttl: Duration,
        _expiry: Expiry,
    ) -> Result<i64, StoreError> {
        self.fail("INCR+PEXPIRE")
    }

    async fn set_expiry(&self, _key: &str, _ttl: Duration) -> Result<(), StoreError> {
        self.fail("PEXPIRE")
    }

    async fn set_with_expiry(
        &self,
        _key: &str,
        _value: i64,
        _ttl: Duration,
    ) -> Result<(), StoreError> {
        self.fail("SET")
    }

    async fn delete(&self, _keys: &[&str]) -> Result<(), StoreError> {
        self.fail("DEL")
    }
}

/// In-process store whose standalone `PEXPIRE` always fails; everything else works.
#[derive(Debug, Clone)]
pub struct ExpiryFailingStore {
    inner: InMemoryDurableStore,
}

impl ExpiryFailingStore {
    pub fn new(clock: &ManualClock) -> Self {
        Self { inner: InMemoryDurableStore::with_clock(clock.clone()) }
    }
}

#[async_trait]
impl DurableStore for ExpiryFailingStore {
    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        self.inner.get(key).await
    }

    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        self.inner.increment(key).await
    }

    async fn decrement(&self, key: &str) -> Result<i64, StoreError> {
        self.inner.decrement(key).await
    }

    async fn increment_with_expiry(
        &self,
        key: &str,
        ttl: Duration,
        expiry: Expiry,
    ) -> Result<i64, StoreError> {
        self.inner.increment_with_expiry(key, ttl, expiry).await
    }

    async fn set_expiry(&self, _key: &str, _ttl: Duration) -> Result<(), StoreError> {
        Err(StoreError::Command { command: "PEXPIRE", message: "READONLY replica".into() })
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: i64,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.inner.set_with_expiry(key, value, ttl).await
    }

    async fn delete(&self, keys: &[&str]) -> Result<(), StoreError> {
        self.inner.delete(keys).await
    }
}

/// Defaults from the environment table: 10 requests per 15s, 5 failures, 30s cooldown.
pub fn default_config() -> GuardConfig {
    GuardConfig::default()
}

/// Guard on a manual clock, optionally backed by `store`.
pub fn guard(
    config: GuardConfig,
    clock: &ManualClock,
    store: Option<Arc<dyn DurableStore>>,
) -> (ChatGuard<MemorySink>, MemorySink) {
    let sink = MemorySink::new();
    let mut builder = ChatGuard::builder(config).sink(sink.clone()).clock(clock.clone());
    if let Some(store) = store {
        builder = builder.durable_store(store);
    }
    (builder.build().expect("valid guard config"), sink)
}
