//! Job registry and lifecycle operations.
//!
//! Each job sits behind its own mutex so transitions on one job are
//! linearizable while different jobs never contend beyond the registry
//! lookup. The progress event for a transition is published while the job's
//! lock is held, which keeps per-job event order identical to transition order.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use reelforge_core::JobId;
use reelforge_events::{EventType, ProgressPublisher, ProgressUpdate};

use crate::error::{StateError, StateResult};
use crate::types::{Job, JobError, JobStatus};

struct JobSlot {
    job: Mutex<Job>,
    cancel: CancellationToken,
}

/// Owner of every job's lifecycle.
pub struct JobStateMachine {
    jobs: RwLock<HashMap<JobId, Arc<JobSlot>>>,
    publisher: Arc<dyn ProgressPublisher>,
    shutdown: CancellationToken,
}

impl JobStateMachine {
    /// Create a state machine whose job cancellation tokens are children of
    /// `shutdown`, so process shutdown reaches every in-flight call.
    pub fn new(publisher: Arc<dyn ProgressPublisher>, shutdown: CancellationToken) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            publisher,
            shutdown,
        }
    }

    fn slot(&self, job_id: JobId) -> StateResult<Arc<JobSlot>> {
        self.jobs
            .read()
            .get(&job_id)
            .cloned()
            .ok_or(StateError::NotFound(job_id))
    }

    fn emit(&self, job: &Job, event_type: EventType, message: impl Into<String>) {
        self.publisher.publish(
            ProgressUpdate::new(job.id, event_type, job.stage.clone(), job.percent, message)
                .with_correlation(job.correlation_id),
        );
    }

    /// Log a rejected operation and hand the error back.
    fn rejected(&self, operation: &'static str, error: StateError) -> StateError {
        if error.is_race() {
            warn!(operation, error = %error, "job operation rejected; keeping current state");
        } else {
            debug!(operation, error = %error, "job operation failed");
        }
        error
    }

    /// Create and register a queued job.
    pub fn create(&self) -> Job {
        let job = Job::new();
        let slot = Arc::new(JobSlot {
            job: Mutex::new(job.clone()),
            cancel: self.shutdown.child_token(),
        });

        {
            let guard = slot.job.lock();
            self.jobs.write().insert(job.id, slot.clone());
            self.emit(&guard, EventType::JobStatus, "Job queued");
        }

        info!(job_id = %job.id, correlation_id = %job.correlation_id, "job created");
        job
    }

    /// Snapshot of a job.
    pub fn get(&self, job_id: JobId) -> StateResult<Job> {
        Ok(self.slot(job_id)?.job.lock().clone())
    }

    pub fn list(&self) -> Vec<Job> {
        let slots: Vec<_> = self.jobs.read().values().cloned().collect();
        slots.iter().map(|slot| slot.job.lock().clone()).collect()
    }

    /// Cancellation signal of a job: fires on `cancel` or process shutdown.
    pub fn cancellation_token(&self, job_id: JobId) -> StateResult<CancellationToken> {
        Ok(self.slot(job_id)?.cancel.clone())
    }

    pub fn start(&self, job_id: JobId) -> StateResult<Job> {
        let slot = self.slot(job_id)?;
        let mut job = slot.job.lock();
        job.mark_running().map_err(|e| self.rejected("start", e))?;
        self.emit(&job, EventType::JobStatus, "Job started");
        info!(job_id = %job_id, "job started");
        Ok(job.clone())
    }

    /// Report progress; returns the effective (monotonic) percent.
    pub fn report_progress(
        &self,
        job_id: JobId,
        percent: i32,
        stage: &str,
        message: &str,
    ) -> StateResult<u8> {
        let slot = self.slot(job_id)?;
        let mut job = slot.job.lock();
        let previous = job.percent;
        let effective = job
            .apply_progress(percent, stage)
            .map_err(|e| self.rejected("report_progress", e))?;

        if effective != percent.clamp(0, 100) as u8 {
            debug!(
                job_id = %job_id,
                requested = percent,
                previous,
                effective,
                "progress kept at higher value"
            );
        }

        self.emit(&job, EventType::StepProgress, message);
        Ok(effective)
    }

    /// Announce that a stage began or changed state.
    pub fn report_step_status(&self, job_id: JobId, stage: &str, message: &str) -> StateResult<()> {
        let slot = self.slot(job_id)?;
        let mut job = slot.job.lock();
        let percent = i32::from(job.percent);
        job.apply_progress(percent, stage)
            .map_err(|e| self.rejected("report_step_status", e))?;
        self.emit(&job, EventType::StepStatus, message);
        Ok(())
    }

    /// Publish a non-fatal warning for a job.
    pub fn report_warning(&self, job_id: JobId, message: &str) -> StateResult<()> {
        let slot = self.slot(job_id)?;
        let job = slot.job.lock();
        self.emit(&job, EventType::Warning, message);
        warn!(job_id = %job_id, stage = %job.stage, warning = message, "job warning");
        Ok(())
    }

    pub fn complete(&self, job_id: JobId) -> StateResult<Job> {
        let slot = self.slot(job_id)?;
        let mut job = slot.job.lock();
        job.mark_succeeded()
            .map_err(|e| self.rejected("complete", e))?;
        self.emit(&job, EventType::JobCompleted, "Job completed");
        info!(job_id = %job_id, "job succeeded");
        Ok(job.clone())
    }

    pub fn fail(&self, job_id: JobId, errors: Vec<JobError>) -> StateResult<Job> {
        let slot = self.slot(job_id)?;
        let mut job = slot.job.lock();
        job.mark_failed(errors)
            .map_err(|e| self.rejected("fail", e))?;

        let message = job
            .outcome_message()
            .unwrap_or("Job failed")
            .to_string();
        self.emit(&job, EventType::JobFailed, message.clone());
        warn!(
            job_id = %job_id,
            stage = %job.stage,
            error_count = job.errors.len(),
            reason = %message,
            "job failed"
        );
        Ok(job.clone())
    }

    /// Cancel a queued or running job and stop its in-flight calls.
    pub fn cancel(&self, job_id: JobId, reason: &str) -> StateResult<Job> {
        let slot = self.slot(job_id)?;
        let snapshot = {
            let mut job = slot.job.lock();
            job.mark_canceled(reason)
                .map_err(|e| self.rejected("cancel", e))?;
            self.emit(&job, EventType::JobCancelled, reason);
            job.clone()
        };

        slot.cancel.cancel();
        info!(job_id = %job_id, reason, "job canceled");
        Ok(snapshot)
    }

    pub fn mark_resumable(&self, job_id: JobId, step: &str) -> StateResult<Job> {
        let slot = self.slot(job_id)?;
        let mut job = slot.job.lock();
        job.mark_resumable(step);
        debug!(job_id = %job_id, step, can_resume = job.can_resume, "checkpoint recorded");
        Ok(job.clone())
    }

    /// Drop a terminal job from the registry.
    pub fn remove(&self, job_id: JobId) -> StateResult<Job> {
        let slot = self.slot(job_id)?;
        let job = slot.job.lock().clone();
        if !job.is_terminal() {
            return Err(self.rejected(
                "remove",
                StateError::InvalidTransition {
                    job_id,
                    from: job.status,
                    to: job.status,
                },
            ));
        }
        self.jobs.write().remove(&job_id);
        Ok(job)
    }

    pub fn status(&self, job_id: JobId) -> StateResult<JobStatus> {
        Ok(self.slot(job_id)?.job.lock().status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reelforge_events::{ProgressBroadcaster, ProgressEvent};

    fn machine() -> (JobStateMachine, Arc<ProgressBroadcaster>) {
        let broadcaster = Arc::new(ProgressBroadcaster::default());
        let machine = JobStateMachine::new(broadcaster.clone(), CancellationToken::new());
        (machine, broadcaster)
    }

    fn types(events: &[ProgressEvent]) -> Vec<EventType> {
        events.iter().map(|e| e.event_type).collect()
    }

    #[test]
    fn progress_scenario_keeps_highest_percent_and_completes() {
        let (machine, broadcaster) = machine();
        let job = machine.create();

        machine.start(job.id).unwrap();
        assert_eq!(machine.report_progress(job.id, 30, "TTS", "narrating").unwrap(), 30);
        assert_eq!(machine.report_progress(job.id, 10, "TTS", "late frame").unwrap(), 30);
        assert_eq!(machine.get(job.id).unwrap().percent, 30);
        machine.report_progress(job.id, 60, "Visuals", "images").unwrap();
        let done = machine.complete(job.id).unwrap();

        assert_eq!(done.percent, 100);
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.ended_utc, done.completed_utc);

        let history = broadcaster.history(job.id);
        assert_eq!(
            types(&history),
            vec![
                EventType::JobStatus,
                EventType::JobStatus,
                EventType::StepProgress,
                EventType::StepProgress,
                EventType::StepProgress,
                EventType::JobCompleted,
            ]
        );
        let percents: Vec<_> = history.iter().map(|e| e.percent).collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert!(history.iter().all(|e| e.correlation_id == Some(job.correlation_id)));
    }

    #[test]
    fn unknown_job_is_not_found() {
        let (machine, _) = machine();
        let missing = JobId::new();
        assert_eq!(machine.start(missing).unwrap_err(), StateError::NotFound(missing));
        assert!(matches!(machine.get(missing), Err(StateError::NotFound(_))));
    }

    #[test]
    fn start_requires_queued() {
        let (machine, _) = machine();
        let job = machine.create();
        machine.start(job.id).unwrap();

        let err = machine.start(job.id).unwrap_err();
        assert!(err.is_race());
        assert_eq!(machine.status(job.id).unwrap(), JobStatus::Running);
    }

    #[test]
    fn racing_terminal_transitions_leave_first_winner() {
        let (machine, broadcaster) = machine();
        let job = machine.create();
        machine.start(job.id).unwrap();

        machine.cancel(job.id, "user request").unwrap();
        let err = machine.complete(job.id).unwrap_err();

        assert!(matches!(
            err,
            StateError::InvalidTransition { from: JobStatus::Canceled, to: JobStatus::Succeeded, .. }
        ));
        let snapshot = machine.get(job.id).unwrap();
        assert_eq!(snapshot.status, JobStatus::Canceled);
        assert_eq!(snapshot.ended_utc, snapshot.canceled_utc);
        assert_eq!(
            broadcaster.latest(job.id).unwrap().event_type,
            EventType::JobCancelled
        );
    }

    #[test]
    fn cancel_fires_the_job_token() {
        let (machine, _) = machine();
        let job = machine.create();
        let token = machine.cancellation_token(job.id).unwrap();

        machine.cancel(job.id, "user request").unwrap();

        assert!(token.is_cancelled());
    }

    #[test]
    fn shutdown_reaches_job_tokens_without_canceling_jobs() {
        let broadcaster = Arc::new(ProgressBroadcaster::default());
        let shutdown = CancellationToken::new();
        let machine = JobStateMachine::new(broadcaster, shutdown.clone());
        let job = machine.create();
        let token = machine.cancellation_token(job.id).unwrap();

        shutdown.cancel();

        assert!(token.is_cancelled());
        assert_eq!(machine.status(job.id).unwrap(), JobStatus::Queued);
    }

    #[test]
    fn fail_records_errors_and_publishes_message() {
        let (machine, broadcaster) = machine();
        let job = machine.create();
        machine.start(job.id).unwrap();

        let failed = machine
            .fail(
                job.id,
                vec![JobError::new("provider_unavailable", "Narration service is unavailable", "TTS")],
            )
            .unwrap();

        assert_eq!(failed.errors.len(), 1);
        let latest = broadcaster.latest(job.id).unwrap();
        assert_eq!(latest.event_type, EventType::JobFailed);
        assert_eq!(latest.message, "Narration service is unavailable");
    }

    #[test]
    fn queued_job_rejects_progress_and_completion() {
        let (machine, _) = machine();
        let job = machine.create();

        assert!(matches!(
            machine.report_progress(job.id, 10, "Script", "early"),
            Err(StateError::NotRunning { .. })
        ));
        assert!(machine.complete(job.id).is_err());
        assert!(machine.fail(job.id, vec![]).is_err());
    }

    #[test]
    fn remove_only_drops_terminal_jobs() {
        let (machine, _) = machine();
        let job = machine.create();
        assert!(machine.remove(job.id).is_err());

        machine.cancel(job.id, "done").unwrap();
        machine.remove(job.id).unwrap();
        assert!(matches!(machine.get(job.id), Err(StateError::NotFound(_))));
    }

    #[test]
    fn concurrent_reports_stay_monotonic() {
        let (machine, broadcaster) = machine();
        let machine = Arc::new(machine);
        let job = machine.create();
        machine.start(job.id).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let machine = machine.clone();
                std::thread::spawn(move || {
                    for step in 0..25 {
                        let percent = (step * 4 + worker) % 100;
                        machine
                            .report_progress(job.id, percent, "Visuals", "tick")
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let percents: Vec<_> = broadcaster
            .history(job.id)
            .iter()
            .filter(|e| e.event_type == EventType::StepProgress)
            .map(|e| e.percent)
            .collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    }
}
