//! Telemetry and observability for the chat guard.
//!
//! Every admission denial, breaker state change, degraded-mode fallback and
//! rejected chat payload produces one [`GuardEvent`]. Events flow through
//! [`TelemetrySink`] implementations which can log, collect, or forward them.
//!
//! # Event Types
//!
//! - **Rate limiter**: `rate_limit_blocked`
//! - **Circuit breaker**: `chat_failure`, `chat_circuit_failure_incremented`,
//!   `chat_circuit_opened`, `chat_circuit_closed`, `chat_circuit_open`
//! - **Degraded mode**: `chat_rate_guard_error`
//! - **Payload validation**: `chat_payload_rejected`
//!
//! # Telemetry Sinks
//!
//! The `TelemetrySink` trait defines how events are consumed. It's implemented
//! as a `tower::Service<GuardEvent>` for composability. Emission is best effort:
//! sink errors are swallowed and never retried.

pub mod events;
pub mod sinks;

pub use events::{
    CircuitBreakerEvent, DegradeReason, DegradedEvent, GuardEvent, PayloadEvent, RateLimitEvent,
    Severity,
};
#[cfg(feature = "telemetry-json")]
pub use events::event_to_json;
pub use sinks::{emit_best_effort, LogSink, MemorySink, NullSink, SinkFuture, TelemetrySink};
