//! Tracing and logging (shared setup).

/// Tracing configuration (filters, layers) and span helpers.
pub mod tracing;

pub use self::tracing::{LogConfig, LogFormat, LogFormatError, job_span, stream_span};
