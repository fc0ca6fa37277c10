//! The single entry point in front of the upstream completion service.
//!
//! A request is checked against the per-client rate limiter first and the
//! global circuit breaker second; a rate-limited client never touches breaker
//! statistics. After an admitted request the caller reports exactly one
//! [`UpstreamOutcome`].
//!
//! ```rust
//! use chatguard::{ChatGuard, GuardConfig, UpstreamOutcome};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let guard = ChatGuard::builder(GuardConfig::default()).build().unwrap();
//!
//! let admission = guard.admit("203.0.113.7").await.unwrap();
//! assert_eq!(admission.remaining, 9);
//!
//! let _ = guard.report_outcome(UpstreamOutcome::Success).await;
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

pub mod middleware;
pub use middleware::{ClientIdentified, GuardLayer, GuardService};

use crate::chat::{ChatLimits, ChatRequest, PayloadError};
use crate::circuit_breaker::CircuitBreaker;
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, GuardConfig};
use crate::error::{GuardError, Guarded};
use crate::rate_limit::{FixedWindow, RateLimitDecision, RateLimiter, SlidingWindow};
use crate::store::{DurableStore, RedisStore};
use crate::telemetry::{emit_best_effort, CircuitBreakerEvent, GuardEvent, LogSink, TelemetrySink};

/// Result of the single upstream call made for an admitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamOutcome {
    /// A usable reply was produced.
    Success,
    /// The call failed; the reason is recorded with the failure.
    Failure(String),
}

/// A request that passed both checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Requests left for this client in the current window.
    pub remaining: u32,
    /// True when either check answered from in-process state after a store failure.
    pub degraded: bool,
}

/// Rate limiter and circuit breaker behind one handle.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ChatGuard<S = LogSink> {
    limiter: RateLimiter<S>,
    breaker: CircuitBreaker<S>,
    sink: S,
    limits: ChatLimits,
}

impl<S: fmt::Debug> fmt::Debug for ChatGuard<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatGuard")
            .field("limiter", &self.limiter)
            .field("breaker", &self.breaker)
            .field("limits", &self.limits)
            .finish()
    }
}

impl ChatGuard<LogSink> {
    /// Start building a guard that logs through `tracing`.
    pub fn builder(config: GuardConfig) -> ChatGuardBuilder<LogSink> {
        ChatGuardBuilder {
            config,
            sink: LogSink,
            clock: Arc::new(SystemClock),
            store: None,
        }
    }
}

impl<S: TelemetrySink> ChatGuard<S> {
    /// Build from configuration, connecting to `REDIS_URL` lazily when set.
    pub fn from_config(config: &GuardConfig, sink: S) -> Result<Self, ConfigError> {
        ChatGuard::builder(config.clone()).sink(sink).build()
    }

    /// Count one request for `identifier` against its quota.
    pub async fn check_admission(&self, identifier: &str) -> Guarded<RateLimitDecision> {
        self.limiter.admit(identifier).await
    }

    /// Whether the breaker is refusing upstream calls.
    pub async fn check_circuit(&self) -> Guarded<bool> {
        self.breaker.is_open().await
    }

    /// Run both checks and map the result onto [`GuardError`].
    pub async fn admit(&self, identifier: &str) -> Result<Admission, GuardError> {
        let decision = self.limiter.admit(identifier).await;
        let mut degraded = decision.is_degraded();
        let remaining = match decision.into_result()? {
            RateLimitDecision::Allowed { remaining } => remaining,
            RateLimitDecision::Denied { retry_after_ms, .. } => {
                return Err(GuardError::RateLimited { retry_after_ms });
            }
        };

        let circuit = self.breaker.is_open().await;
        degraded |= circuit.is_degraded();
        if circuit.into_result()? {
            emit_best_effort(
                self.sink.clone(),
                GuardEvent::CircuitBreaker(CircuitBreakerEvent::Rejected),
            )
            .await;
            return Err(GuardError::CircuitOpen);
        }

        Ok(Admission { remaining, degraded })
    }

    /// Tell the breaker how the upstream call went.
    pub async fn report_outcome(&self, outcome: UpstreamOutcome) -> Guarded<()> {
        match outcome {
            UpstreamOutcome::Success => self.breaker.record_success().await,
            UpstreamOutcome::Failure(reason) => self.breaker.record_failure(&reason).await,
        }
    }

    /// Validate a chat body against the configured limits, reporting rejections.
    pub async fn validate_request(&self, body: &str) -> Result<ChatRequest, PayloadError> {
        match ChatRequest::parse(body, &self.limits) {
            Ok(request) => Ok(request),
            Err(error) => {
                emit_best_effort(self.sink.clone(), error.event()).await;
                Err(error)
            }
        }
    }

    /// Clear limiter buckets and breaker state.
    pub async fn reset(&self) {
        self.limiter.reset();
        self.breaker.reset().await;
    }

    /// The rate limiter.
    pub fn limiter(&self) -> &RateLimiter<S> {
        &self.limiter
    }

    /// The circuit breaker.
    pub fn breaker(&self) -> &CircuitBreaker<S> {
        &self.breaker
    }

    /// Chat payload limits.
    pub fn limits(&self) -> &ChatLimits {
        &self.limits
    }
}

/// Builder for [`ChatGuard`].
pub struct ChatGuardBuilder<S = LogSink> {
    config: GuardConfig,
    sink: S,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn DurableStore>>,
}

impl<S: TelemetrySink> ChatGuardBuilder<S> {
    /// Deliver events to `sink` instead.
    pub fn sink<T: TelemetrySink>(self, sink: T) -> ChatGuardBuilder<T> {
        ChatGuardBuilder { config: self.config, sink, clock: self.clock, store: self.store }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Keep limiter and breaker state in `store` instead of `REDIS_URL`.
    pub fn durable_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Validate the configuration and assemble the guard.
    ///
    /// Without an injected store, a configured `REDIS_URL` is opened here.
    pub fn build(self) -> Result<ChatGuard<S>, ConfigError> {
        let Self { config, sink, clock, store } = self;
        match config.validate() {
            Err(ConfigError::DurableStoreRequired) if store.is_some() => {}
            other => other?,
        }
        let store = match (store, &config.redis_url) {
            (Some(store), _) => Some(store),
            (None, Some(url)) => Some(open_redis(url, &config)?),
            (None, None) => None,
        };
        let durable = store.is_some();
        let policy = config.rate_limit_policy()?;
        let fallback = || FixedWindow::new(policy, config.max_keys, clock.clone());

        let (limiter, breaker) = match store {
            None => (
                RateLimiter::in_memory(fallback(), sink.clone()),
                CircuitBreaker::new(config.circuit_config()?, sink.clone()),
            ),
            Some(store) => (
                RateLimiter::durable(
                    SlidingWindow::new(store.clone(), &config.key_prefix, policy, clock.clone()),
                    config.allow_memory_fallback.then(fallback),
                    sink.clone(),
                ),
                CircuitBreaker::new(config.circuit_config()?, sink.clone()).with_durable_store(
                    store,
                    &config.key_prefix,
                    config.allow_memory_fallback,
                ),
            ),
        };

        tracing::debug!(
            durable,
            allow_memory_fallback = config.allow_memory_fallback,
            "chat guard assembled"
        );

        Ok(ChatGuard {
            limiter,
            breaker: breaker.with_clock(clock),
            sink,
            limits: config.chat,
        })
    }
}

fn open_redis(url: &str, config: &GuardConfig) -> Result<Arc<dyn DurableStore>, ConfigError> {
    let store = RedisStore::open(url, config.store_timeout)
        .map_err(|error| ConfigError::Invalid { name: "REDIS_URL", reason: error.to_string() })?;
    Ok(Arc::new(store))
}
