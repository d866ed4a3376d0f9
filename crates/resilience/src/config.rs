//! Pipeline configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit::CircuitBreakerPolicy;
use crate::retry::RetryPolicy;

/// Retry, breaker and per-attempt limits for one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResilienceConfig {
    pub retry: RetryPolicy,
    pub breaker: CircuitBreakerPolicy,
    /// Upper bound for a single attempt; exceeding it is a transient timeout
    pub attempt_timeout: Option<Duration>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            breaker: CircuitBreakerPolicy::default(),
            attempt_timeout: Some(Duration::from_secs(120)),
        }
    }
}

impl ResilienceConfig {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_breaker(mut self, breaker: CircuitBreakerPolicy) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }
}
