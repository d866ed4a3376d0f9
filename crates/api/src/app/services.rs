use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use reelforge_core::JobId;
use reelforge_events::{BroadcasterConfig, ProgressBroadcaster};
use reelforge_jobs::{Job, JobRunner, JobStateMachine, RunOutcome, StateResult};
use reelforge_observability::job_span;
use reelforge_resilience::ResiliencePipeline;
use reelforge_shutdown::{
    ProcessRegistry, ProcessSignaller, ShutdownCoordinator, ShutdownError, ShutdownOutcome,
};
use reelforge_streaming::{ConnectionRegistry, StreamConfig, StreamingAdapter};

use crate::app::pipeline;
use crate::config::AppConfig;

/// Reason recorded on jobs canceled through the API.
pub const USER_CANCEL_REASON: &str = "Canceled by user";

/// Runtime components shared by every handler.
///
/// The host token is the root of all cancellation: job tokens are its
/// children and streams stop accepting connections once it fires. The
/// shutdown coordinator cancels it after notifying and draining streams.
pub struct AppServices {
    pub config: AppConfig,
    pub broadcaster: Arc<ProgressBroadcaster>,
    pub machine: Arc<JobStateMachine>,
    pub runner: JobRunner,
    pub streams: StreamingAdapter,
    pub processes: Arc<ProcessRegistry>,
    pub shutdown: Arc<ShutdownCoordinator>,
    host: CancellationToken,
}

impl AppServices {
    /// Build with the platform's process signaller.
    pub fn build(config: AppConfig) -> Arc<Self> {
        Self::with_signaller(config, system_signaller())
    }

    pub fn with_signaller(config: AppConfig, signaller: Arc<dyn ProcessSignaller>) -> Arc<Self> {
        let host = CancellationToken::new();

        let broadcaster = ProgressBroadcaster::arc(
            BroadcasterConfig::default().with_history_limit(config.history_limit),
        );
        let machine = Arc::new(JobStateMachine::new(broadcaster.clone(), host.clone()));
        let resilience = Arc::new(ResiliencePipeline::new(config.resilience.clone()));
        let runner = JobRunner::new(machine.clone(), resilience);

        let connections = ConnectionRegistry::new();
        let streams = StreamingAdapter::new(broadcaster.clone(), connections.clone(), host.clone())
            .with_config(
                StreamConfig::default()
                    .with_heartbeat_interval(config.heartbeat_interval)
                    .with_idle_timeout(config.idle_timeout),
            );

        let processes = ProcessRegistry::new();
        let shutdown = Arc::new(ShutdownCoordinator::new(
            config.shutdown.clone(),
            connections,
            processes.clone(),
            signaller,
            host.clone(),
        ));

        Arc::new(Self {
            config,
            broadcaster,
            machine,
            runner,
            streams,
            processes,
            shutdown,
            host,
        })
    }

    pub fn host_token(&self) -> &CancellationToken {
        &self.host
    }

    /// Create a job and start its pipeline in the background.
    pub fn submit(self: &Arc<Self>) -> Job {
        let job = self.machine.create();
        let job_id = job.id;
        let stages = pipeline::default_stages(self.config.stage_delay);
        let services = self.clone();

        tokio::spawn(
            async move {
                match services.runner.run(job_id, &stages).await {
                    Ok(RunOutcome::Interrupted(job)) => {
                        info!(can_resume = job.can_resume, "run interrupted");
                    }
                    Ok(outcome) => {
                        debug!(status = ?outcome.job().status, "run finished");
                        services.schedule_cleanup(job_id);
                    }
                    Err(err) => warn!(error = %err, "run aborted"),
                }
            }
            .instrument(job_span(&job_id)),
        );

        job
    }

    /// Cancel a job; its history is dropped after the cleanup grace period.
    ///
    /// Returns the canceled job and whether cleanup was scheduled.
    pub fn cancel(&self, job_id: JobId) -> StateResult<(Job, bool)> {
        let job = self.machine.cancel(job_id, USER_CANCEL_REASON)?;
        let scheduled = self.schedule_cleanup(job_id);
        Ok((job, scheduled))
    }

    /// Drop a finished job's history and registry entry after the grace
    /// period, so reconnecting clients can still replay the terminal event.
    fn schedule_cleanup(&self, job_id: JobId) -> bool {
        if self.host.is_cancelled() {
            return false;
        }

        let broadcaster = self.broadcaster.clone();
        let machine = self.machine.clone();
        let grace = self.config.cleanup_grace;
        let host = self.host.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = host.cancelled() => return,
                _ = tokio::time::sleep(grace) => {}
            }
            broadcaster.clear(job_id);
            match machine.remove(job_id) {
                Ok(_) => debug!(job_id = %job_id, "job cleaned up"),
                Err(err) => debug!(job_id = %job_id, error = %err, "job already removed"),
            }
        });
        true
    }

    /// Graceful shutdown, escalating to a forced one if steps fail.
    pub async fn stop(&self) -> Result<ShutdownOutcome, ShutdownError> {
        match self.shutdown.shutdown(false).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                warn!(error = %err, "graceful shutdown incomplete; forcing");
                self.shutdown.shutdown(true).await.inspect_err(|err| {
                    error!(error = %err, "forced shutdown failed");
                })
            }
        }
    }
}

#[cfg(unix)]
fn system_signaller() -> Arc<dyn ProcessSignaller> {
    Arc::new(reelforge_shutdown::SystemSignaller)
}

#[cfg(not(unix))]
fn system_signaller() -> Arc<dyn ProcessSignaller> {
    Arc::new(NoSignals)
}

/// Platforms without POSIX signals never track child processes.
#[cfg(not(unix))]
struct NoSignals;

#[cfg(not(unix))]
impl ProcessSignaller for NoSignals {
    fn terminate(&self, _pid: u32) -> Result<reelforge_shutdown::SignalOutcome, ShutdownError> {
        Ok(reelforge_shutdown::SignalOutcome::AlreadyGone)
    }

    fn kill(&self, _pid: u32) -> Result<reelforge_shutdown::SignalOutcome, ShutdownError> {
        Ok(reelforge_shutdown::SignalOutcome::AlreadyGone)
    }

    fn is_alive(&self, _pid: u32) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reelforge_jobs::{JobStatus, StateError};
    use reelforge_shutdown::ShutdownState;

    use super::*;

    fn services(cleanup_grace: Duration) -> Arc<AppServices> {
        let config = AppConfig {
            cleanup_grace,
            stage_delay: Duration::from_secs(5),
            ..AppConfig::default()
        };
        AppServices::build(config)
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_schedules_cleanup_after_grace() {
        let services = services(Duration::from_secs(30));
        let job = services.submit();

        let (canceled, scheduled) = services.cancel(job.id).unwrap();
        assert_eq!(canceled.status, JobStatus::Canceled);
        assert!(scheduled);

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(services.machine.get(job.id).is_ok());
        assert!(services.broadcaster.latest(job.id).is_some_and(|e| e.is_terminal()));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(services.machine.get(job.id), Err(StateError::NotFound(job.id)));
        assert!(services.broadcaster.history(job.id).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn second_cancel_is_an_invalid_transition() {
        let services = services(Duration::from_secs(30));
        let job = services.submit();
        services.cancel(job.id).unwrap();

        let err = services.cancel(job.id).unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_running_jobs_and_cancels_host() {
        let services = services(Duration::from_secs(30));
        let job = services.submit();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(services.machine.status(job.id).unwrap(), JobStatus::Running);

        let outcome = services.stop().await.unwrap();
        assert!(matches!(outcome, ShutdownOutcome::Completed(_)));
        assert!(services.host_token().is_cancelled());
        assert_eq!(services.shutdown.state(), ShutdownState::Complete);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let job = services.machine.get(job.id).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(
            services
                .broadcaster
                .history(job.id)
                .iter()
                .any(|e| e.message == reelforge_jobs::INTERRUPTED_WARNING)
        );
    }
}
