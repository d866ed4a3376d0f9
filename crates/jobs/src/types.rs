//! Core job types and transition rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use reelforge_core::{CorrelationId, JobId, is_resumable_stage, not_before};

use crate::error::{StateError, StateResult};

/// Job lifecycle status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    /// Created, waiting to be picked up
    Queued,
    /// Stages are executing
    Running,
    /// All stages completed
    Succeeded,
    /// An unrecoverable stage error occurred
    Failed,
    /// Cancellation was requested
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Canceled)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Canceled)
        )
    }
}

/// Structured failure record attached to a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    /// Stable machine-readable code (e.g. `provider_unavailable`)
    pub code: String,
    /// User-actionable message
    pub message: String,
    /// Technical detail for operators
    pub detail: Option<String>,
    /// Stage the failure occurred in
    pub stage: String,
    /// Whether retrying the job later may succeed
    pub retryable: bool,
    pub occurred_utc: DateTime<Utc>,
}

impl JobError {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        stage: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            detail: None,
            stage: stage.into(),
            retryable: false,
            occurred_utc: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

/// A multi-stage generation job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    /// Current pipeline stage label
    pub stage: String,
    /// Completion percentage; never decreases
    pub percent: u8,
    pub created_utc: DateTime<Utc>,
    pub queued_utc: DateTime<Utc>,
    pub started_utc: Option<DateTime<Utc>>,
    pub completed_utc: Option<DateTime<Utc>>,
    pub canceled_utc: Option<DateTime<Utc>>,
    /// Set exactly once, by the terminal transition
    pub ended_utc: Option<DateTime<Utc>>,
    pub can_resume: bool,
    pub last_completed_step: Option<String>,
    pub errors: Vec<JobError>,
    pub cancel_reason: Option<String>,
    pub correlation_id: CorrelationId,
}

impl Job {
    /// Create a queued job.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            status: JobStatus::Queued,
            stage: "Queued".to_string(),
            percent: 0,
            created_utc: now,
            queued_utc: now,
            started_utc: None,
            completed_utc: None,
            canceled_utc: None,
            ended_utc: None,
            can_resume: false,
            last_completed_step: None,
            errors: Vec::new(),
            cancel_reason: None,
            correlation_id: CorrelationId::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn ensure_transition(&self, to: JobStatus) -> StateResult<()> {
        if self.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(StateError::InvalidTransition {
                job_id: self.id,
                from: self.status,
                to,
            })
        }
    }

    fn ensure_running(&self) -> StateResult<()> {
        if self.status == JobStatus::Running {
            Ok(())
        } else {
            Err(StateError::NotRunning {
                job_id: self.id,
                status: self.status,
            })
        }
    }

    /// Latest lifecycle timestamp written so far.
    fn last_timestamp(&self) -> DateTime<Utc> {
        self.started_utc.unwrap_or(self.queued_utc)
    }

    /// Mark job as running.
    pub fn mark_running(&mut self) -> StateResult<()> {
        self.ensure_transition(JobStatus::Running)?;
        self.started_utc = Some(not_before(self.queued_utc));
        self.status = JobStatus::Running;
        self.stage = "Initialization".to_string();
        Ok(())
    }

    /// Apply a progress report; returns the effective percent.
    ///
    /// Out-of-range input is clamped and a lower value keeps the current one.
    pub fn apply_progress(&mut self, percent: i32, stage: impl Into<String>) -> StateResult<u8> {
        self.ensure_running()?;
        let clamped = percent.clamp(0, 100) as u8;
        self.percent = self.percent.max(clamped);
        self.stage = stage.into();
        Ok(self.percent)
    }

    /// Mark job as succeeded.
    pub fn mark_succeeded(&mut self) -> StateResult<()> {
        self.ensure_transition(JobStatus::Succeeded)?;
        let now = not_before(self.last_timestamp());
        self.completed_utc = Some(now);
        self.ended_utc = Some(now);
        self.percent = 100;
        self.stage = "Complete".to_string();
        self.status = JobStatus::Succeeded;
        Ok(())
    }

    /// Mark job as failed, appending the failure records.
    pub fn mark_failed(&mut self, errors: Vec<JobError>) -> StateResult<()> {
        self.ensure_transition(JobStatus::Failed)?;
        self.ended_utc = Some(not_before(self.last_timestamp()));
        self.errors.extend(errors);
        self.status = JobStatus::Failed;
        Ok(())
    }

    /// Mark job as canceled.
    pub fn mark_canceled(&mut self, reason: impl Into<String>) -> StateResult<()> {
        self.ensure_transition(JobStatus::Canceled)?;
        let now = not_before(self.last_timestamp());
        self.canceled_utc = Some(now);
        self.ended_utc = Some(now);
        self.cancel_reason = Some(reason.into());
        self.status = JobStatus::Canceled;
        Ok(())
    }

    /// Record the last completed step and whether the job can resume after it.
    pub fn mark_resumable(&mut self, step: impl Into<String>) {
        let step = step.into();
        self.can_resume = is_resumable_stage(&step);
        self.last_completed_step = Some(step);
    }

    /// User-facing summary of why the job ended, if it did not succeed.
    pub fn outcome_message(&self) -> Option<&str> {
        match self.status {
            JobStatus::Failed => self.errors.first().map(|e| e.message.as_str()),
            JobStatus::Canceled => self.cancel_reason.as_deref(),
            _ => None,
        }
    }
}

impl Default for Job {
    fn default() -> Self {
        Self::new()
    }
}
