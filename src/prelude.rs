//! Convenient re-exports for wiring a guard into a request handler.
pub use crate::{
    chat::{client_identifier, ChatRequest, Completion, PayloadError},
    error::{GuardError, Guarded, GuardedCallError},
    guard::{Admission, ChatGuard, ClientIdentified, GuardLayer, UpstreamOutcome},
    telemetry::{GuardEvent, LogSink, TelemetrySink},
    GuardConfig,
};
