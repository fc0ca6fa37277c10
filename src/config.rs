//! Environment-sourced guard configuration.
//!
//! Loaded once at process start. A configuration that cannot be honoured
//! (unparseable numbers, zero windows, or a production deployment without a
//! durable store) is rejected here so the process never serves traffic with it.

use std::time::Duration;

use thiserror::Error;

use crate::chat::ChatLimits;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::rate_limit::RateLimitPolicy;

/// Errors produced when loading or validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A setting is present but unusable.
    #[error("invalid {name}: {reason}")]
    Invalid {
        /// Environment variable or setting name.
        name: &'static str,
        /// What is wrong with it.
        reason: String,
    },
    /// In-process fallback is forbidden and no durable store is configured.
    #[error("REDIS_URL must be configured when in-memory rate limiting is not allowed")]
    DurableStoreRequired,
}

/// Settings shared by the rate limiter, circuit breaker and chat helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardConfig {
    /// Rate limit window length.
    pub window: Duration,
    /// Requests admitted per identifier per window.
    pub max_requests: u32,
    /// Failures that open the breaker.
    pub failure_threshold: u64,
    /// How long the breaker stays open after the last failure.
    pub cooldown: Duration,
    /// Cap on identifiers tracked by the in-process fallback.
    pub max_keys: usize,
    /// Whether the in-process fallback may be used at all.
    pub allow_memory_fallback: bool,
    /// Durable store URL; `None` runs purely in-process.
    pub redis_url: Option<String>,
    /// Prefix for every durable key.
    pub key_prefix: String,
    /// Upper bound on each durable store call.
    pub store_timeout: Duration,
    /// Chat payload bounds.
    pub chat: ChatLimits,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(15_000),
            max_requests: 10,
            failure_threshold: 5,
            cooldown: Duration::from_millis(30_000),
            max_keys: 1_000,
            allow_memory_fallback: true,
            redis_url: None,
            key_prefix: "chatbot".to_owned(),
            store_timeout: Duration::from_millis(500),
            chat: ChatLimits::default(),
        }
    }
}

impl GuardConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source; unset variables take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let production = var("APP_ENV").is_some_and(|env| env.trim() == "production");
        let allow_memory = var("RATE_LIMIT_ALLOW_MEMORY")
            .is_some_and(|value| value.trim().eq_ignore_ascii_case("true"));

        let config = Self {
            window: millis(&var, "RATE_LIMIT_WINDOW_MS", defaults.window)?,
            max_requests: number(&var, "RATE_LIMIT_MAX_REQUESTS", defaults.max_requests)?,
            failure_threshold: number(
                &var,
                "CIRCUIT_FAILURE_THRESHOLD",
                defaults.failure_threshold,
            )?,
            cooldown: millis(&var, "CIRCUIT_COOLDOWN_MS", defaults.cooldown)?,
            max_keys: number(&var, "RATE_LIMIT_MEMORY_MAX_KEYS", defaults.max_keys)?,
            allow_memory_fallback: allow_memory || !production,
            redis_url: var("REDIS_URL").map(|url| url.trim().to_owned()),
            key_prefix: var("GUARD_KEY_PREFIX")
                .map(|prefix| prefix.trim().to_owned())
                .unwrap_or(defaults.key_prefix),
            store_timeout: millis(&var, "GUARD_STORE_TIMEOUT_MS", defaults.store_timeout)?,
            chat: ChatLimits {
                max_messages: number(&var, "MAX_CONTEXT_MESSAGES", defaults.chat.max_messages)?,
                max_message_chars: number(
                    &var,
                    "MAX_MESSAGE_CHARS",
                    defaults.chat.max_message_chars,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Check invariants that defaults and explicit construction must also satisfy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window.is_zero() {
            return Err(invalid("RATE_LIMIT_WINDOW_MS", "must be > 0"));
        }
        if self.max_requests == 0 {
            return Err(invalid("RATE_LIMIT_MAX_REQUESTS", "must be > 0"));
        }
        if self.failure_threshold == 0 {
            return Err(invalid("CIRCUIT_FAILURE_THRESHOLD", "must be > 0"));
        }
        if self.cooldown.is_zero() {
            return Err(invalid("CIRCUIT_COOLDOWN_MS", "must be > 0"));
        }
        if self.max_keys == 0 {
            return Err(invalid("RATE_LIMIT_MEMORY_MAX_KEYS", "must be > 0"));
        }
        if self.store_timeout.is_zero() {
            return Err(invalid("GUARD_STORE_TIMEOUT_MS", "must be > 0"));
        }
        if self.key_prefix.is_empty() {
            return Err(invalid("GUARD_KEY_PREFIX", "must not be empty"));
        }
        if self.chat.max_messages == 0 {
            return Err(invalid("MAX_CONTEXT_MESSAGES", "must be > 0"));
        }
        if self.chat.max_message_chars == 0 {
            return Err(invalid("MAX_MESSAGE_CHARS", "must be > 0"));
        }
        if self.redis_url.is_none() && !self.allow_memory_fallback {
            return Err(ConfigError::DurableStoreRequired);
        }
        Ok(())
    }

    /// Rate limit quota.
    pub fn rate_limit_policy(&self) -> Result<RateLimitPolicy, ConfigError> {
        RateLimitPolicy::new(self.max_requests, self.window)
    }

    /// Breaker thresholds.
    pub fn circuit_config(&self) -> Result<CircuitBreakerConfig, ConfigError> {
        CircuitBreakerConfig::new(self.failure_threshold, self.cooldown)
    }
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { name, reason: reason.into() }
}

fn number<T, F>(var: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|error| {
                invalid(name, format!("'{}' is not a valid number: {error}", raw.trim()))
            }),
        None => Ok(default),
    }
}

fn millis<F>(var: &F, name: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    number(var, name, default_ms).map(Duration::from_millis)
}
