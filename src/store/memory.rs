use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{duration_millis, DurableStore, Expiry};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    expires_at_ms: Option<u64>,
}

/// Process-local [`DurableStore`] with Redis-like expiry semantics.
///
/// Expiry is evaluated lazily against the injected clock. Clones share data.
/// [`set_available`](Self::set_available) makes every call fail, which lets tests
/// exercise degraded paths.
#[derive(Debug, Clone)]
pub struct InMemoryDurableStore {
    data: Arc<Mutex<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
    available: Arc<AtomicBool>,
}

impl Default for InMemoryDurableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDurableStore {
    /// Store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Store driven by `clock`.
    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self {
            data: Arc::new(Mutex::new(HashMap::new())),
            clock: Arc::new(clock),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Toggle simulated outages.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.lock().values().filter(|entry| !Self::expired(entry, now)).count()
    }

    /// True when no live keys remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expired(entry: &Entry, now_ms: u64) -> bool {
        entry.expires_at_ms.is_some_and(|at| at <= now_ms)
    }

    fn check_available(&self, command: &'static str) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Command { command, message: "store marked unavailable".into() })
        }
    }

    fn live_entry(
        data: &mut HashMap<String, Entry>,
        key: &str,
        now_ms: u64,
    ) -> Option<Entry> {
        match data.get(key) {
            Some(entry) if Self::expired(entry, now_ms) => {
                data.remove(key);
                None
            }
            other => other.copied(),
        }
    }

    fn add(
        &self,
        command: &'static str,
        key: &str,
        delta: i64,
        expiry: Option<(Duration, Expiry)>,
    ) -> Result<i64, StoreError> {
        self.check_available(command)?;
        let now = self.clock.now_millis();
        let mut data = self.lock();
        let entry = Self::live_entry(&mut data, key, now)
            .unwrap_or(Entry { value: 0, expires_at_ms: None });
        let value = entry.value.checked_add(delta).ok_or_else(|| StoreError::Command {
            command,
            message: "increment or decrement would overflow".into(),
        })?;
        let expires_at_ms = match (expiry, entry.expires_at_ms) {
            (None, current) | (Some((_, Expiry::IfMissing)), current @ Some(_)) => current,
            (Some((ttl, _)), _) => Some(now.saturating_add(duration_millis(ttl))),
        };
        data.insert(key.to_owned(), Entry { value, expires_at_ms });
        Ok(value)
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        self.check_available("GET")?;
        let now = self.clock.now_millis();
        Ok(Self::live_entry(&mut self.lock(), key, now).map(|entry| entry.value))
    }

    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        self.add("INCR", key, 1, None)
    }

    async fn decrement(&self, key: &str) -> Result<i64, StoreError> {
        self.add("DECR", key, -1, None)
    }

    async fn increment_with_expiry(
        &self,
        key: &str,
        ttl: Duration,
        expiry: Expiry,
    ) -> Result<i64, StoreError> {
        self.add("INCR+PEXPIRE", key, 1, Some((ttl, expiry)))
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check_available("PEXPIRE")?;
        let now = self.clock.now_millis();
        let mut data = self.lock();
        if let Some(entry) = Self::live_entry(&mut data, key, now) {
            let expires_at_ms = Some(now.saturating_add(duration_millis(ttl)));
            data.insert(key.to_owned(), Entry { expires_at_ms, ..entry });
        }
        Ok(())
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: i64,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.check_available("SET")?;
        let now = self.clock.now_millis();
        let expires_at_ms = Some(now.saturating_add(duration_millis(ttl)));
        self.lock().insert(key.to_owned(), Entry { value, expires_at_ms });
        Ok(())
    }

    async fn delete(&self, keys: &[&str]) -> Result<(), StoreError> {
        self.check_available("DEL")?;
        let mut data = self.lock();
        for key in keys {
            data.remove(*key);
        }
        Ok(())
    }
}
