//! Job state machine errors.

use reelforge_core::JobId;

use crate::types::JobStatus;

pub type StateResult<T> = Result<T, StateError>;

/// Rejected state machine operation.
///
/// `InvalidTransition` and `NotRunning` are expected under races (e.g.
/// cancellation racing completion); callers log them and keep treating the
/// current state as authoritative.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("invalid transition for job {job_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("job {job_id} is not running (status {status:?})")]
    NotRunning { job_id: JobId, status: JobStatus },
}

impl StateError {
    /// Whether the error stems from a benign race rather than a caller bug.
    pub fn is_race(&self) -> bool {
        matches!(
            self,
            StateError::InvalidTransition { .. } | StateError::NotRunning { .. }
        )
    }
}
