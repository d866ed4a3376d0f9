//! Failure taxonomy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Whether a failure is worth retrying.
///
/// A caller's own cancellation is neither: it ends the call immediately. A
/// cancellation caused by a per-attempt timeout surfaces as a
/// `ProviderErrorKind::Timeout`, which is transient.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    Transient,
    NonTransient,
}

/// Failure category reported by a dependency adapter.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    Network,
    Timeout,
    RateLimited,
    /// The dependency is starting up or loading a model
    WarmingUp,
    /// 5xx-equivalent response
    Server,
    InvalidInput,
    Unauthorized,
    /// Quota permanently exceeded for the billing period
    QuotaExceeded,
    /// The adapter could not tell; the message decides
    Unknown,
}

impl ProviderErrorKind {
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            ProviderErrorKind::Network
            | ProviderErrorKind::Timeout
            | ProviderErrorKind::RateLimited
            | ProviderErrorKind::WarmingUp
            | ProviderErrorKind::Server => Some(ErrorClass::Transient),
            ProviderErrorKind::InvalidInput
            | ProviderErrorKind::Unauthorized
            | ProviderErrorKind::QuotaExceeded => Some(ErrorClass::NonTransient),
            ProviderErrorKind::Unknown => None,
        }
    }
}

impl core::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            ProviderErrorKind::Network => "network error",
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::RateLimited => "rate limited",
            ProviderErrorKind::WarmingUp => "warming up",
            ProviderErrorKind::Server => "server error",
            ProviderErrorKind::InvalidInput => "invalid input",
            ProviderErrorKind::Unauthorized => "unauthorized",
            ProviderErrorKind::QuotaExceeded => "quota exceeded",
            ProviderErrorKind::Unknown => "error",
        };
        f.write_str(name)
    }
}

/// Error returned by a dependency adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Unknown, message)
    }

    /// Map an HTTP-style status code to an error kind.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            408 | 504 => ProviderErrorKind::Timeout,
            429 => ProviderErrorKind::RateLimited,
            503 => ProviderErrorKind::WarmingUp,
            500..=599 => ProviderErrorKind::Server,
            401 | 403 => ProviderErrorKind::Unauthorized,
            402 => ProviderErrorKind::QuotaExceeded,
            400 | 404 | 413 | 415 | 422 => ProviderErrorKind::InvalidInput,
            _ => ProviderErrorKind::Unknown,
        };
        Self::new(kind, message)
    }

    pub fn class(&self) -> ErrorClass {
        self.kind
            .class()
            .unwrap_or_else(|| classify_message(&self.message))
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

const NON_TRANSIENT_MARKERS: &[&str] = &[
    "invalid",
    "unauthorized",
    "forbidden",
    "authentication",
    "api key",
    "quota exceeded",
    "insufficient_quota",
    "content policy",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "rate limit",
    "too many requests",
    "busy",
    "overloaded",
    "warming up",
    "loading",
    "temporarily",
    "unavailable",
    "connection",
    "reset by peer",
    "502",
    "503",
    "504",
];

/// Fallback classification from a free-text error message.
///
/// Used only when an adapter reports `ProviderErrorKind::Unknown`. Permanent
/// markers win over transient ones; anything unrecognized is not retried.
pub fn classify_message(message: &str) -> ErrorClass {
    let lower = message.to_ascii_lowercase();
    if NON_TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorClass::NonTransient
    } else if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorClass::Transient
    } else {
        ErrorClass::NonTransient
    }
}

/// What the pipeline surfaces to its caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResilienceError {
    /// Non-transient failure, surfaced without retrying.
    #[error("dependency rejected the call: {0}")]
    Rejected(ProviderError),
    /// The circuit for this dependency is open; the dependency was not called.
    #[error("circuit open for {key}, retry after {retry_after:?}")]
    CircuitOpen { key: String, retry_after: Duration },
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: ProviderError },
    /// The caller canceled; never retried.
    #[error("call canceled by caller")]
    Canceled,
}

impl ResilienceError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ResilienceError::Rejected(_) => "provider_rejected",
            ResilienceError::CircuitOpen { .. } => "provider_unavailable",
            ResilienceError::RetriesExhausted { .. } => "provider_failed",
            ResilienceError::Canceled => "canceled",
        }
    }

    /// Stable, user-actionable message.
    pub fn user_message(&self) -> String {
        match self {
            ResilienceError::Rejected(err) => match err.kind {
                ProviderErrorKind::Unauthorized => {
                    "The provider rejected our credentials. Check the provider configuration.".to_string()
                }
                ProviderErrorKind::QuotaExceeded => {
                    "The provider quota is exhausted. Try again after the quota resets.".to_string()
                }
                ProviderErrorKind::InvalidInput => {
                    "The provider could not process this request. Adjust the input and try again.".to_string()
                }
                _ => "The provider could not complete this request.".to_string(),
            },
            ResilienceError::CircuitOpen { .. } => {
                "The provider is temporarily unavailable. Please try again shortly.".to_string()
            }
            ResilienceError::RetriesExhausted { .. } => {
                "The provider kept failing after several attempts. Please try again later.".to_string()
            }
            ResilienceError::Canceled => "The operation was canceled.".to_string(),
        }
    }

    /// Whether trying again later may succeed.
    pub fn is_retryable_later(&self) -> bool {
        matches!(
            self,
            ResilienceError::CircuitOpen { .. } | ResilienceError::RetriesExhausted { .. }
        )
    }
}
