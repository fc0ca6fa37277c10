use std::fmt;

#[cfg(feature = "telemetry-json")]
use serde_json::{json, Map, Value};

/// Severity attached to every guard event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Verbose bookkeeping.
    Debug,
    /// Normal state changes.
    Info,
    /// Expected but noteworthy: denials, degraded mode, upstream failures.
    Warn,
    /// The breaker tripped.
    Error,
}

impl Severity {
    /// Lower-case label used in structured output.
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted by the guard subsystem.
///
/// Every event has a stable name, a severity, and a flat key/value payload, so
/// sinks can forward them without knowing the variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardEvent {
    /// Rate limiter events
    RateLimit(RateLimitEvent),
    /// Circuit breaker events
    CircuitBreaker(CircuitBreakerEvent),
    /// The durable store failed and the guard fell back
    Degraded(DegradedEvent),
    /// A chat request body was refused before reaching the guard
    Payload(PayloadEvent),
}

/// Events emitted by the rate limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitEvent {
    /// A request was denied.
    Blocked {
        /// Client identifier that exhausted its quota.
        identifier: String,
        /// Requests left in the window (always 0 on denial).
        remaining: u32,
        /// Epoch millis at which the window rolls over.
        reset_at_ms: u64,
    },
}

/// Events emitted by the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitBreakerEvent {
    /// An upstream failure was reported.
    FailureRecorded {
        /// Caller-supplied reason, e.g. `status 502`.
        reason: String,
    },
    /// The shared failure counter was incremented.
    FailureCounted {
        /// Counter value after the increment.
        failures: u64,
    },
    /// The failure count reached the threshold.
    Opened {
        /// Failures observed when the breaker tripped.
        failure_count: u64,
    },
    /// The breaker closed after a success or an elapsed cooldown.
    Closed,
    /// An admitted request was turned away because the breaker is open.
    Rejected,
}

/// Which durable operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DegradeReason {
    /// Sliding-window admission check.
    RateLimitFailure,
    /// Breaker counter read.
    RedisReadFailure,
    /// Breaker counter increment.
    RedisWriteFailure,
    /// Breaker counter delete.
    RedisClearFailure,
}

impl DegradeReason {
    /// Stable label used in the event payload.
    pub fn as_str(self) -> &'static str {
        match self {
            DegradeReason::RateLimitFailure => "ratelimit_failure",
            DegradeReason::RedisReadFailure => "redis_read_failure",
            DegradeReason::RedisWriteFailure => "redis_write_failure",
            DegradeReason::RedisClearFailure => "redis_clear_failure",
        }
    }
}

/// The durable store failed and in-process state was used instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DegradedEvent {
    /// Failed operation.
    pub reason: DegradeReason,
    /// Store error text.
    pub message: String,
    /// Client identifier, for admission failures.
    pub identifier: Option<String>,
}

/// Events emitted while validating chat request bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadEvent {
    /// The body was refused.
    Rejected {
        /// Why it was refused.
        reason: String,
        /// Number of messages, when the body had a message list.
        size: Option<usize>,
    },
}

impl GuardEvent {
    /// Stable event name.
    pub fn name(&self) -> &'static str {
        match self {
            GuardEvent::RateLimit(RateLimitEvent::Blocked { .. }) => "rate_limit_blocked",
            GuardEvent::CircuitBreaker(event) => match event {
                CircuitBreakerEvent::FailureRecorded { .. } => "chat_failure",
                CircuitBreakerEvent::FailureCounted { .. } => "chat_circuit_failure_incremented",
                CircuitBreakerEvent::Opened { .. } => "chat_circuit_opened",
                CircuitBreakerEvent::Closed => "chat_circuit_closed",
                CircuitBreakerEvent::Rejected => "chat_circuit_open",
            },
            GuardEvent::Degraded(_) => "chat_rate_guard_error",
            GuardEvent::Payload(PayloadEvent::Rejected { .. }) => "chat_payload_rejected",
        }
    }

    /// Severity the event should be logged at.
    pub fn severity(&self) -> Severity {
        match self {
            GuardEvent::RateLimit(_) | GuardEvent::Degraded(_) | GuardEvent::Payload(_) => {
                Severity::Warn
            }
            GuardEvent::CircuitBreaker(event) => match event {
                CircuitBreakerEvent::FailureRecorded { .. } | CircuitBreakerEvent::Rejected => {
                    Severity::Warn
                }
                CircuitBreakerEvent::FailureCounted { .. } => Severity::Debug,
                CircuitBreakerEvent::Opened { .. } => Severity::Error,
                CircuitBreakerEvent::Closed => Severity::Info,
            },
        }
    }

    /// Flat key/value payload.
    pub fn payload(&self) -> Vec<(&'static str, String)> {
        match self {
            GuardEvent::RateLimit(RateLimitEvent::Blocked { identifier, remaining, reset_at_ms }) => {
                vec![
                    ("identifier", identifier.clone()),
                    ("remaining", remaining.to_string()),
                    ("reset", reset_at_ms.to_string()),
                ]
            }
            GuardEvent::CircuitBreaker(event) => match event {
                CircuitBreakerEvent::FailureRecorded { reason } => vec![("reason", reason.clone())],
                CircuitBreakerEvent::FailureCounted { failures } => {
                    vec![("failures", failures.to_string())]
                }
                CircuitBreakerEvent::Opened { failure_count } => {
                    vec![("failures", failure_count.to_string())]
                }
                CircuitBreakerEvent::Closed | CircuitBreakerEvent::Rejected => Vec::new(),
            },
            GuardEvent::Degraded(DegradedEvent { reason, message, identifier }) => {
                let mut fields =
                    vec![("reason", reason.as_str().to_owned()), ("message", message.clone())];
                if let Some(identifier) = identifier {
                    fields.push(("identifier", identifier.clone()));
                }
                fields
            }
            GuardEvent::Payload(PayloadEvent::Rejected { reason, size }) => {
                let mut fields = vec![("reason", reason.clone())];
                if let Some(size) = size {
                    fields.push(("size", size.to_string()));
                }
                fields
            }
        }
    }
}

impl fmt::Display for GuardEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())?;
        for (key, value) in self.payload() {
            write!(f, " {}={}", key, value)?;
        }
        Ok(())
    }
}

/// Render an event as `{event, level, timestamp, ...payload}`.
///
/// Numeric payload values are emitted as JSON numbers.
#[cfg(feature = "telemetry-json")]
pub fn event_to_json(event: &GuardEvent, timestamp_ms: u64) -> Value {
    let mut object = Map::new();
    object.insert("event".into(), json!(event.name()));
    object.insert("level".into(), json!(event.severity().as_str()));
    object.insert("timestamp".into(), json!(timestamp_ms));
    for (key, value) in event.payload() {
        let rendered = value.parse::<u64>().map(Value::from).unwrap_or(Value::String(value));
        object.insert(key.into(), rendered);
    }
    Value::Object(object)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_event_display() {
        let event = GuardEvent::RateLimit(RateLimitEvent::Blocked {
            identifier: "burst".into(),
            remaining: 0,
            reset_at_ms: 42,
        });
        assert_eq!(event.to_string(), "rate_limit_blocked identifier=burst remaining=0 reset=42");
        assert_eq!(event.severity(), Severity::Warn);
    }

    #[test]
    fn opened_is_error_severity() {
        let event = GuardEvent::CircuitBreaker(CircuitBreakerEvent::Opened { failure_count: 5 });
        assert_eq!(event.severity(), Severity::Error);
        assert_eq!(event.name(), "chat_circuit_opened");
        assert!(event.to_string().contains("failures=5"));
    }

    #[test]
    fn degraded_payload_includes_identifier_when_known() {
        let event = GuardEvent::Degraded(DegradedEvent {
            reason: DegradeReason::RateLimitFailure,
            message: "timed out".into(),
            identifier: Some("abc".into()),
        });
        let payload = event.payload();
        assert_eq!(payload[0], ("reason", "ratelimit_failure".to_owned()));
        assert!(payload.contains(&("identifier", "abc".to_owned())));
    }

    #[test]
    fn severities_are_ordered() {
        assert!(Severity::Debug < Severity::Info);
        assert!(Severity::Warn < Severity::Error);
    }
}
