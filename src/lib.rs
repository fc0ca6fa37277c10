#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # chatguard
//!
//! Request admission for a proxied LLM chat endpoint: a per-client rate
//! limiter and a global failure-count circuit breaker, each able to keep its
//! state in Redis or in process memory.
//!
//! ## Features
//!
//! - **Sliding-window rate limiting** over Redis, shared by every instance
//! - **Bounded fixed-window fallback** when Redis is absent or unreachable
//! - **Circuit breaker** with lazy cooldown and reset-on-success
//! - **Explicit degradation**: every decision says whether it came from the fallback path
//! - **Structured telemetry** through `tower::Service` sinks
//! - **Tower middleware** wrapping any upstream client
//!
//! ## Quick Start
//!
//! ```rust
//! use chatguard::{chat, ChatGuard, Completion, GuardConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = GuardConfig::default();
//!     let guard = ChatGuard::from_config(&config, chatguard::telemetry::LogSink).unwrap();
//!
//!     let body = r#"{"messages":[{"role":"user","content":"Where is my order?"}]}"#;
//!     let request = guard.validate_request(body).await.unwrap();
//!     let client = chat::client_identifier(Some("203.0.113.7, 10.0.0.1"));
//!
//!     match guard.admit(&client).await {
//!         Ok(_) => {
//!             let _upstream_body = request.upstream_body("openai/gpt-3.5-turbo", "Be helpful.");
//!             // ... send it, then classify what came back:
//!             let reply = r#"{"choices":[{"message":{"content":"Today."}}]}"#;
//!             let completion = Completion::classify(200, reply);
//!             let _ = guard.report_outcome(completion.outcome()).await;
//!         }
//!         Err(rejection) => eprintln!("{} {}", rejection.status_code(), rejection),
//!     }
//! }
//! ```

pub mod chat;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod guard;
pub mod prelude;
pub mod rate_limit;
pub mod store;
pub mod telemetry;

// Re-exports
pub use chat::{client_identifier, ChatLimits, ChatMessage, ChatRequest, ChatRole, Completion};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, GuardConfig};
pub use error::{GuardError, Guarded, GuardedCallError, StoreError};
pub use guard::{Admission, ChatGuard, ChatGuardBuilder, GuardLayer, UpstreamOutcome};
pub use rate_limit::{RateLimitDecision, RateLimitPolicy, RateLimiter};
pub use store::{DurableStore, Expiry, FallbackStore, InMemoryDurableStore, RedisStore};
