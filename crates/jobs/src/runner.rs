//! Stage execution.
//!
//! A job is a fixed sequence of stages. Each stage runs through a
//! [`StageExecutor`] and reaches external dependencies only via
//! [`StageContext::call`], which applies the resilience pipeline and the job's
//! cancellation token.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use reelforge_core::JobId;
use reelforge_resilience::{ProviderError, ResilienceError, ResiliencePipeline};

use crate::error::{StateError, StateResult};
use crate::state_machine::JobStateMachine;
use crate::types::{Job, JobError, JobStatus};

/// Warning published when shutdown stops a run mid-pipeline.
pub const INTERRUPTED_WARNING: &str = "Job interrupted by shutdown";

/// Why a stage stopped early.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Resilience(#[from] ResilienceError),
    #[error("{}", .0.message)]
    Failed(JobError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("stage canceled")]
    Canceled,
}

impl StageError {
    fn is_cancellation(&self) -> bool {
        match self {
            StageError::Canceled | StageError::Resilience(ResilienceError::Canceled) => true,
            StageError::State(err) => err.is_race(),
            _ => false,
        }
    }

    /// Structured failure record for the job.
    pub fn to_job_error(&self, stage: &str) -> JobError {
        match self {
            StageError::Resilience(err) => JobError::new(err.code(), err.user_message(), stage)
                .with_detail(err.to_string())
                .retryable(err.is_retryable_later()),
            StageError::Failed(err) => err.clone(),
            StageError::State(err) => {
                JobError::new("internal_error", "The job could not continue.", stage)
                    .with_detail(err.to_string())
            }
            StageError::Canceled => JobError::new("canceled", "The operation was canceled.", stage),
        }
    }
}

/// One stage of the generation pipeline.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Stage label (e.g. `Script`, `Voice`).
    fn stage(&self) -> &str;

    async fn run(&self, ctx: &StageContext) -> Result<(), StageError>;
}

/// What a running stage may do with its job.
pub struct StageContext {
    job_id: JobId,
    stage: String,
    machine: Arc<JobStateMachine>,
    pipeline: Arc<ResiliencePipeline>,
    cancel: CancellationToken,
}

impl StageContext {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Report stage progress; returns the effective job percent.
    pub fn report(&self, percent: i32, message: &str) -> Result<u8, StageError> {
        Ok(self
            .machine
            .report_progress(self.job_id, percent, &self.stage, message)?)
    }

    /// Publish a non-fatal warning.
    pub fn warn(&self, message: &str) -> Result<(), StageError> {
        Ok(self.machine.report_warning(self.job_id, message)?)
    }

    /// Call an external dependency through the resilience pipeline.
    ///
    /// `key` names the dependency and operation (e.g. `"tts:synthesize"`).
    pub async fn call<T, F, Fut>(&self, key: &str, operation: F) -> Result<T, StageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        Ok(self.pipeline.execute(key, operation, &self.cancel).await?)
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded(Job),
    Failed(Job),
    /// Canceled by request
    Canceled(Job),
    /// Stopped by process shutdown; the job stays `Running` with its checkpoint
    Interrupted(Job),
}

impl RunOutcome {
    pub fn job(&self) -> &Job {
        match self {
            RunOutcome::Succeeded(job)
            | RunOutcome::Failed(job)
            | RunOutcome::Canceled(job)
            | RunOutcome::Interrupted(job) => job,
        }
    }
}

/// Drives jobs through their stages.
#[derive(Clone)]
pub struct JobRunner {
    machine: Arc<JobStateMachine>,
    pipeline: Arc<ResiliencePipeline>,
}

impl JobRunner {
    pub fn new(machine: Arc<JobStateMachine>, pipeline: Arc<ResiliencePipeline>) -> Self {
        Self { machine, pipeline }
    }

    pub fn machine(&self) -> &Arc<JobStateMachine> {
        &self.machine
    }

    pub fn pipeline(&self) -> &Arc<ResiliencePipeline> {
        &self.pipeline
    }

    /// Run the job on the current runtime.
    pub fn spawn(
        &self,
        job_id: JobId,
        stages: Vec<Arc<dyn StageExecutor>>,
    ) -> JoinHandle<StateResult<RunOutcome>> {
        let runner = self.clone();
        tokio::spawn(async move { runner.run(job_id, &stages).await })
    }

    /// Start the job and execute `stages` in order.
    pub async fn run(
        &self,
        job_id: JobId,
        stages: &[Arc<dyn StageExecutor>],
    ) -> StateResult<RunOutcome> {
        let cancel = self.machine.cancellation_token(job_id)?;
        match self.machine.start(job_id) {
            Ok(_) => {}
            Err(err) if err.is_race() => return self.stopped(job_id),
            Err(err) => return Err(err),
        }

        for executor in stages {
            if cancel.is_cancelled() {
                return self.stopped(job_id);
            }

            let stage = executor.stage().to_string();
            match self
                .machine
                .report_step_status(job_id, &stage, &format!("{stage} started"))
            {
                Ok(()) => {}
                Err(err) if err.is_race() => return self.stopped(job_id),
                Err(err) => return Err(err),
            }

            let ctx = StageContext {
                job_id,
                stage: stage.clone(),
                machine: self.machine.clone(),
                pipeline: self.pipeline.clone(),
                cancel: cancel.clone(),
            };

            match executor.run(&ctx).await {
                Ok(()) => {
                    self.machine.mark_resumable(job_id, &stage)?;
                    debug!(job_id = %job_id, stage = %stage, "stage completed");
                }
                Err(err) if err.is_cancellation() || cancel.is_cancelled() => {
                    debug!(job_id = %job_id, stage = %stage, error = %err, "stage stopped");
                    return self.stopped(job_id);
                }
                Err(err) => {
                    warn!(job_id = %job_id, stage = %stage, error = %err, "stage failed");
                    return match self.machine.fail(job_id, vec![err.to_job_error(&stage)]) {
                        Ok(job) => Ok(RunOutcome::Failed(job)),
                        Err(err) if err.is_race() => self.stopped(job_id),
                        Err(err) => Err(err),
                    };
                }
            }
        }

        match self.machine.complete(job_id) {
            Ok(job) => Ok(RunOutcome::Succeeded(job)),
            Err(err) if err.is_race() => self.stopped(job_id),
            Err(err) => Err(err),
        }
    }

    /// Outcome of a run that stopped without reaching its own terminal transition.
    fn stopped(&self, job_id: JobId) -> StateResult<RunOutcome> {
        let job = self.machine.get(job_id)?;
        Ok(match job.status {
            JobStatus::Canceled => RunOutcome::Canceled(job),
            JobStatus::Failed => RunOutcome::Failed(job),
            JobStatus::Succeeded => RunOutcome::Succeeded(job),
            JobStatus::Queued | JobStatus::Running => {
                if let Err(err) = self
                    .machine
                    .report_warning(job_id, INTERRUPTED_WARNING)
                {
                    warn!(job_id = %job_id, error = %err, "could not record interruption");
                }
                info!(
                    job_id = %job_id,
                    can_resume = job.can_resume,
                    last_completed_step = job.last_completed_step.as_deref().unwrap_or("-"),
                    "job interrupted"
                );
                RunOutcome::Interrupted(job)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tokio::sync::Notify;

    use super::*;
    use reelforge_events::{EventType, ProgressBroadcaster};
    use reelforge_resilience::ProviderErrorKind;

    struct Harness {
        runner: JobRunner,
        broadcaster: Arc<ProgressBroadcaster>,
        shutdown: CancellationToken,
    }

    fn harness() -> Harness {
        let broadcaster = Arc::new(ProgressBroadcaster::default());
        let shutdown = CancellationToken::new();
        let machine = Arc::new(JobStateMachine::new(broadcaster.clone(), shutdown.clone()));
        let runner = JobRunner::new(machine, Arc::new(ResiliencePipeline::default()));
        Harness {
            runner,
            broadcaster,
            shutdown,
        }
    }

    struct Reporting {
        name: &'static str,
        percent: i32,
    }

    #[async_trait]
    impl StageExecutor for Reporting {
        fn stage(&self) -> &str {
            self.name
        }

        async fn run(&self, ctx: &StageContext) -> Result<(), StageError> {
            ctx.report(self.percent, "working")?;
            Ok(())
        }
    }

    struct Failing(ResilienceError);

    #[async_trait]
    impl StageExecutor for Failing {
        fn stage(&self) -> &str {
            "Voice"
        }

        async fn run(&self, _ctx: &StageContext) -> Result<(), StageError> {
            Err(StageError::Resilience(self.0.clone()))
        }
    }

    /// Signals once started, then waits for cancellation.
    struct Blocking {
        started: Arc<Notify>,
    }

    #[async_trait]
    impl StageExecutor for Blocking {
        fn stage(&self) -> &str {
            "Visuals"
        }

        async fn run(&self, ctx: &StageContext) -> Result<(), StageError> {
            self.started.notify_one();
            ctx.cancellation().cancelled().await;
            Err(StageError::Canceled)
        }
    }

    struct Flaky {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl StageExecutor for Flaky {
        fn stage(&self) -> &str {
            "Voice"
        }

        async fn run(&self, ctx: &StageContext) -> Result<(), StageError> {
            let calls = self.calls.clone();
            ctx.call("tts:synthesize", move || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(ProviderError::new(ProviderErrorKind::WarmingUp, "model loading"))
                    } else {
                        Ok(())
                    }
                }
            })
            .await?;
            ctx.report(50, "narration ready")?;
            Ok(())
        }
    }

    fn boxed(stage: impl StageExecutor + 'static) -> Arc<dyn StageExecutor> {
        Arc::new(stage)
    }

    #[tokio::test]
    async fn runs_stages_in_order_and_completes() {
        let h = harness();
        let job = h.runner.machine().create();

        let outcome = h
            .runner
            .run(
                job.id,
                &vec![
                    boxed(Reporting { name: "Script", percent: 20 }),
                    boxed(Reporting { name: "Voice", percent: 50 }),
                ],
            )
            .await
            .unwrap();

        let done = match outcome {
            RunOutcome::Succeeded(job) => job,
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(done.percent, 100);
        assert_eq!(done.last_completed_step.as_deref(), Some("Voice"));

        let step_status: Vec<_> = h
            .broadcaster
            .history(job.id)
            .into_iter()
            .filter(|e| e.event_type == EventType::StepStatus)
            .map(|e| e.stage)
            .collect();
        assert_eq!(step_status, vec!["Script", "Voice"]);
    }

    #[tokio::test]
    async fn open_circuit_fails_job_with_stable_message() {
        let h = harness();
        let job = h.runner.machine().create();
        let circuit_open = ResilienceError::CircuitOpen {
            key: "tts:synthesize".to_string(),
            retry_after: Duration::from_secs(20),
        };

        let outcome = h
            .runner
            .run(job.id, &vec![boxed(Failing(circuit_open))])
            .await
            .unwrap();

        let failed = match outcome {
            RunOutcome::Failed(job) => job,
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(failed.errors.len(), 1);
        assert_eq!(failed.errors[0].code, "provider_unavailable");
        assert_eq!(failed.errors[0].stage, "Voice");
        assert!(failed.errors[0].retryable);
        assert!(failed.errors[0].message.contains("temporarily unavailable"));

        let last = h.broadcaster.latest(job.id).unwrap();
        assert_eq!(last.event_type, EventType::JobFailed);
        assert_eq!(last.message, failed.errors[0].message);
    }

    #[tokio::test]
    async fn user_cancel_stops_run_as_canceled() {
        let h = harness();
        let job = h.runner.machine().create();
        let started = Arc::new(Notify::new());

        let handle = h.runner.spawn(
            job.id,
            vec![boxed(Blocking { started: started.clone() })],
        );
        started.notified().await;
        h.runner.machine().cancel(job.id, "user request").unwrap();

        let outcome = handle.await.unwrap().unwrap();
        assert!(matches!(outcome, RunOutcome::Canceled(_)));
        assert_eq!(outcome.job().cancel_reason.as_deref(), Some("user request"));
    }

    #[tokio::test]
    async fn shutdown_interrupts_run_and_keeps_checkpoint() {
        let h = harness();
        let job = h.runner.machine().create();
        let started = Arc::new(Notify::new());

        let handle = h.runner.spawn(
            job.id,
            vec![
                boxed(Reporting { name: "Script", percent: 25 }),
                boxed(Blocking { started: started.clone() }),
            ],
        );
        started.notified().await;
        h.shutdown.cancel();

        let outcome = handle.await.unwrap().unwrap();
        let job = match outcome {
            RunOutcome::Interrupted(job) => job,
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.can_resume);
        assert_eq!(job.last_completed_step.as_deref(), Some("Script"));
        let latest = h.broadcaster.latest(job.id).unwrap();
        assert_eq!(latest.event_type, EventType::Warning);
        assert_eq!(latest.message, INTERRUPTED_WARNING);
    }

    #[tokio::test]
    async fn canceled_while_queued_never_starts() {
        let h = harness();
        let job = h.runner.machine().create();
        h.runner.machine().cancel(job.id, "changed my mind").unwrap();

        let outcome = h
            .runner
            .run(job.id, &vec![boxed(Reporting { name: "Script", percent: 10 })])
            .await
            .unwrap();

        assert!(matches!(outcome, RunOutcome::Canceled(_)));
        assert!(outcome.job().started_utc.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_dependency_failure_is_retried_inside_stage() {
        let h = harness();
        let job = h.runner.machine().create();
        let calls = Arc::new(AtomicU32::new(0));

        let outcome = h
            .runner
            .run(job.id, &vec![boxed(Flaky { calls: calls.clone() })])
            .await
            .unwrap();

        assert!(matches!(outcome, RunOutcome::Succeeded(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
