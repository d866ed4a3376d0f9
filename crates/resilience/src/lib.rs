//! Retry and circuit breaking around calls into unreliable dependencies.
//!
//! ## Design
//!
//! - Dependency adapters return `ProviderError` with an explicit kind; the kind
//!   decides whether a failure is transient. Free-text matching is only a
//!   fallback for `ProviderErrorKind::Unknown` (see `classify_message`)
//! - Pipeline composition is `with_retry(with_circuit_breaker(call))`: every
//!   attempt passes the breaker, and an open circuit is never retried
//! - Circuits are keyed by dependency + operation, not by job
//! - Caller cancellation is checked before every attempt and interrupts backoff
//!
//! ## Components
//!
//! - `RetryPolicy`: attempts and exponential backoff with jitter
//! - `CircuitBreaker`: per-key Closed/Open/HalfOpen state table
//! - `ResiliencePipeline`: the composed executor

pub mod circuit;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod retry;

pub use circuit::{
    CallOutcome, CallPermit, CircuitBreaker, CircuitBreakerPolicy, CircuitSnapshot,
    CircuitState, CircuitTransition, Permit,
};
pub use config::ResilienceConfig;
pub use error::{ErrorClass, ProviderError, ProviderErrorKind, ResilienceError, classify_message};
pub use pipeline::{AttemptError, ResiliencePipeline, with_circuit_breaker, with_retry};
pub use retry::{BackoffStrategy, RetryPolicy};
