use thiserror::Error;

use crate::coordinator::ShutdownReport;

#[derive(Debug, Error)]
pub enum ShutdownError {
    /// Non-forced shutdown finished with failed steps; the host keeps running.
    #[error("shutdown incomplete: {} step(s) failed", .0.failures.len())]
    Incomplete(Box<ShutdownReport>),

    #[error("failed to send {signal} to process {pid}: {reason}")]
    Signal {
        pid: u32,
        signal: &'static str,
        reason: String,
    },
}
