//! Global failure-count circuit breaker.
//!
//! The breaker opens once `failure_threshold` upstream failures are recorded
//! within `cooldown` of each other and closes lazily when `cooldown` has elapsed
//! since the last failure. There is no half-open state: a single success clears
//! the count.
//!
//! With a durable store the failure counter lives under
//! `"{prefix}:circuit:failures"` and expires one millisecond after the cooldown,
//! so every process sharing the store sees the same state. A process-local
//! mirror is always kept in step and answers whenever the store cannot.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::config::ConfigError;
use crate::error::{Guarded, StoreError};
use crate::store::{duration_millis, DurableStore, Expiry};
use crate::telemetry::{
    emit_best_effort, CircuitBreakerEvent, DegradeReason, DegradedEvent, GuardEvent, LogSink,
    TelemetrySink,
};

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow to the upstream service.
    Closed,
    /// Requests are refused until the cooldown elapses or a success is recorded.
    Open,
}

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    failure_threshold: u64,
    cooldown: Duration,
}

impl CircuitBreakerConfig {
    /// Create a config with validation.
    pub fn new(failure_threshold: u64, cooldown: Duration) -> Result<Self, ConfigError> {
        if failure_threshold == 0 {
            return Err(ConfigError::Invalid {
                name: "CIRCUIT_FAILURE_THRESHOLD",
                reason: "must be > 0".into(),
            });
        }
        if duration_millis(cooldown) == 0 {
            return Err(ConfigError::Invalid {
                name: "CIRCUIT_COOLDOWN_MS",
                reason: "must be at least 1ms".into(),
            });
        }
        Ok(Self { failure_threshold, cooldown })
    }

    /// Failures needed to open.
    pub fn failure_threshold(&self) -> u64 {
        self.failure_threshold
    }

    /// Time after the last failure before the breaker closes again.
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    fn cooldown_ms(&self) -> u64 {
        duration_millis(self.cooldown)
    }
}

#[derive(Debug, Default)]
struct Mirror {
    failures: u64,
    last_failure_at_ms: Option<u64>,
}

impl Mirror {
    fn cooled_down(&self, now_ms: u64, cooldown_ms: u64) -> bool {
        match self.last_failure_at_ms {
            Some(at) => now_ms.saturating_sub(at) > cooldown_ms,
            None => true,
        }
    }
}

#[derive(Debug)]
struct DurableCounter {
    store: Arc<dyn DurableStore>,
    failures_key: String,
    last_failure_key: String,
    allow_fallback: bool,
}

impl DurableCounter {
    async fn read(&self) -> Result<Option<i64>, StoreError> {
        self.store.get(&self.failures_key).await
    }

    // Keys outlive the cooldown by 1ms: the breaker closes strictly after it.
    async fn record(&self, now_ms: u64, cooldown: Duration) -> Result<u64, StoreError> {
        let ttl = cooldown.saturating_add(Duration::from_millis(1));
        let failures =
            self.store.increment_with_expiry(&self.failures_key, ttl, Expiry::Refresh).await?;
        let stamp = i64::try_from(now_ms).unwrap_or(i64::MAX);
        self.store.set_with_expiry(&self.last_failure_key, stamp, ttl).await?;
        Ok(failures.max(0).unsigned_abs())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.store.delete(&[self.failures_key.as_str(), self.last_failure_key.as_str()]).await
    }
}

/// Circuit breaker guarding the upstream completion service.
///
/// Clones share the same underlying state via `Arc`.
#[derive(Clone)]
pub struct CircuitBreaker<S = LogSink> {
    config: CircuitBreakerConfig,
    mirror: Arc<Mutex<Mirror>>,
    durable: Option<Arc<DurableCounter>>,
    clock: Arc<dyn Clock>,
    sink: S,
}

impl<S: fmt::Debug> fmt::Debug for CircuitBreaker<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("durable", &self.durable.is_some())
            .field("sink", &self.sink)
            .finish()
    }
}

impl<S: TelemetrySink> CircuitBreaker<S> {
    /// Process-local breaker on the system clock.
    pub fn new(config: CircuitBreakerConfig, sink: S) -> Self {
        Self {
            config,
            mirror: Arc::new(Mutex::new(Mirror::default())),
            durable: None,
            clock: Arc::new(SystemClock),
            sink,
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Share breaker state through `store` under `"{prefix}:circuit:*"`.
    ///
    /// When `allow_fallback` is false a failed read yields [`Guarded::Fatal`]
    /// instead of the local decision.
    pub fn with_durable_store(
        mut self,
        store: Arc<dyn DurableStore>,
        prefix: &str,
        allow_fallback: bool,
    ) -> Self {
        self.durable = Some(Arc::new(DurableCounter {
            store,
            failures_key: format!("{prefix}:circuit:failures"),
            last_failure_key: format!("{prefix}:circuit:last_failure"),
            allow_fallback,
        }));
        self
    }

    /// Configuration in effect.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether upstream calls should be refused right now.
    pub async fn is_open(&self) -> Guarded<bool> {
        let Some(durable) = &self.durable else {
            return Guarded::Ok(self.local_is_open().await);
        };

        match durable.read().await {
            Ok(count) => Guarded::Ok(count.is_some_and(|failures| self.tripped(failures))),
            Err(cause) => {
                self.degraded(DegradeReason::RedisReadFailure, &cause).await;
                if durable.allow_fallback {
                    Guarded::Degraded { value: self.local_is_open().await, cause }
                } else {
                    Guarded::Fatal(cause)
                }
            }
        }
    }

    /// Count one upstream failure.
    pub async fn record_failure(&self, reason: &str) -> Guarded<()> {
        emit_best_effort(
            self.sink.clone(),
            GuardEvent::CircuitBreaker(CircuitBreakerEvent::FailureRecorded {
                reason: reason.to_owned(),
            }),
        )
        .await;

        let now = self.clock.now_millis();
        let local = {
            let mut mirror = self.lock();
            if mirror.cooled_down(now, self.config.cooldown_ms()) {
                mirror.failures = 0;
            }
            mirror.failures = mirror.failures.saturating_add(1);
            mirror.last_failure_at_ms = Some(now);
            mirror.failures
        };

        let (failures, outcome) = match &self.durable {
            None => (local, Guarded::Ok(())),
            Some(durable) => match durable.record(now, self.config.cooldown).await {
                Ok(failures) => (failures, Guarded::Ok(())),
                Err(cause) => {
                    self.degraded(DegradeReason::RedisWriteFailure, &cause).await;
                    (local, Guarded::Degraded { value: (), cause })
                }
            },
        };

        self.emit(CircuitBreakerEvent::FailureCounted { failures }).await;
        if failures == self.config.failure_threshold {
            tracing::error!(failures, "circuit breaker opened");
            self.emit(CircuitBreakerEvent::Opened { failure_count: failures }).await;
        }
        outcome
    }

    /// Clear the failure count after an upstream success.
    pub async fn record_success(&self) -> Guarded<()> {
        let now = self.clock.now_millis();
        let locally_open = {
            let mut mirror = self.lock();
            let open = mirror.failures >= self.config.failure_threshold
                && !mirror.cooled_down(now, self.config.cooldown_ms());
            *mirror = Mirror::default();
            open
        };

        let (was_open, outcome) = match &self.durable {
            None => (locally_open, Guarded::Ok(())),
            Some(durable) => {
                // Another instance may have opened the shared breaker.
                let was_open = match durable.read().await {
                    Ok(count) => count.is_some_and(|failures| self.tripped(failures)),
                    Err(_) => locally_open,
                };
                match durable.clear().await {
                    Ok(()) => (was_open, Guarded::Ok(())),
                    Err(cause) => {
                        self.degraded(DegradeReason::RedisClearFailure, &cause).await;
                        (was_open, Guarded::Degraded { value: (), cause })
                    }
                }
            }
        };

        if was_open {
            self.emit(CircuitBreakerEvent::Closed).await;
        }
        outcome
    }

    /// Forget every recorded failure, locally and in the durable store.
    pub async fn reset(&self) {
        *self.lock() = Mirror::default();
        if let Some(durable) = &self.durable {
            if let Err(error) = durable.clear().await {
                tracing::debug!(%error, "failed to clear durable breaker state on reset");
            }
        }
    }

    /// State according to the local mirror. Does not consult the durable store.
    pub fn state(&self) -> CircuitState {
        let now = self.clock.now_millis();
        let mirror = self.lock();
        if mirror.failures >= self.config.failure_threshold
            && !mirror.cooled_down(now, self.config.cooldown_ms())
        {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    /// Failures counted by the local mirror.
    pub fn failure_count(&self) -> u64 {
        self.lock().failures
    }

    fn tripped(&self, failures: i64) -> bool {
        failures.max(0).unsigned_abs() >= self.config.failure_threshold
    }

    async fn local_is_open(&self) -> bool {
        let now = self.clock.now_millis();
        let (open, closed) = {
            let mut mirror = self.lock();
            if mirror.failures < self.config.failure_threshold {
                (false, false)
            } else if mirror.cooled_down(now, self.config.cooldown_ms()) {
                *mirror = Mirror::default();
                (false, true)
            } else {
                (true, false)
            }
        };
        if closed {
            tracing::info!("circuit breaker closed after cooldown");
            self.emit(CircuitBreakerEvent::Closed).await;
        }
        open
    }

    async fn degraded(&self, reason: DegradeReason, cause: &StoreError) {
        emit_best_effort(
            self.sink.clone(),
            GuardEvent::Degraded(DegradedEvent {
                reason,
                message: cause.to_string(),
                identifier: None,
            }),
        )
        .await;
    }

    async fn emit(&self, event: CircuitBreakerEvent) {
        emit_best_effort(self.sink.clone(), GuardEvent::CircuitBreaker(event)).await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Mirror> {
        self.mirror.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
