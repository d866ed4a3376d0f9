//! Shutdown state machine: `Idle -> ShuttingDown -> Complete`.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::drain::ConnectionDrain;
use crate::error::ShutdownError;
use crate::process::{ProcessRegistry, ProcessSignaller, ProcessTermination, terminate_process};

/// Shutdown budgets.
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Budget for notify + drain when not forced
    pub graceful_timeout: Duration,
    /// Budget for notify + drain when forced
    pub forced_timeout: Duration,
    /// Sub-budget of the notify step
    pub notify_timeout: Duration,
    /// SIGTERM grace per process before SIGKILL
    pub per_process_timeout: Duration,
    /// Liveness polling interval while waiting for a process
    pub poll_interval: Duration,
    pub message: String,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            graceful_timeout: Duration::from_secs(3),
            forced_timeout: Duration::from_secs(2),
            notify_timeout: Duration::from_secs(1),
            per_process_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(50),
            message: "Server is shutting down".to_string(),
        }
    }
}

impl ShutdownConfig {
    pub fn with_graceful_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_timeout = timeout;
        self
    }

    pub fn with_per_process_timeout(mut self, timeout: Duration) -> Self {
        self.per_process_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Idle,
    ShuttingDown,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStep {
    Notify,
    Drain,
    TerminateProcesses,
}

impl ShutdownStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownStep::Notify => "notify",
            ShutdownStep::Drain => "drain",
            ShutdownStep::TerminateProcesses => "terminate_processes",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub step: ShutdownStep,
    pub message: String,
}

/// Summary of a shutdown run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub forced: bool,
    pub connections_notified: usize,
    pub connections_closed: usize,
    pub processes_terminated: usize,
    pub processes_killed: usize,
    pub processes_failed: usize,
    pub failures: Vec<StepFailure>,
    pub elapsed: Duration,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Completed(ShutdownReport),
    /// Another shutdown is running; nothing was done
    AlreadyInProgress,
    AlreadyCompleted,
}

/// Drives the teardown of streams and child processes.
pub struct ShutdownCoordinator {
    config: ShutdownConfig,
    state: Mutex<ShutdownState>,
    connections: Arc<dyn ConnectionDrain>,
    processes: Arc<ProcessRegistry>,
    signaller: Arc<dyn ProcessSignaller>,
    host: CancellationToken,
    last_report: Mutex<Option<ShutdownReport>>,
}

impl ShutdownCoordinator {
    /// `host` is cancelled when shutdown completes.
    pub fn new(
        config: ShutdownConfig,
        connections: Arc<dyn ConnectionDrain>,
        processes: Arc<ProcessRegistry>,
        signaller: Arc<dyn ProcessSignaller>,
        host: CancellationToken,
    ) -> Self {
        Self {
            config,
            state: Mutex::new(ShutdownState::Idle),
            connections,
            processes,
            signaller,
            host,
            last_report: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.lock()
    }

    pub fn last_report(&self) -> Option<ShutdownReport> {
        self.last_report.lock().clone()
    }

    pub fn host_token(&self) -> &CancellationToken {
        &self.host
    }

    /// Run the shutdown sequence.
    ///
    /// A non-forced run with failed steps returns `ShutdownError::Incomplete`
    /// and goes back to `Idle` without cancelling the host. A forced run always
    /// cancels the host.
    pub async fn shutdown(&self, force: bool) -> Result<ShutdownOutcome, ShutdownError> {
        {
            let mut state = self.state.lock();
            match *state {
                ShutdownState::ShuttingDown => {
                    info!("shutdown already in progress");
                    return Ok(ShutdownOutcome::AlreadyInProgress);
                }
                ShutdownState::Complete => return Ok(ShutdownOutcome::AlreadyCompleted),
                ShutdownState::Idle => *state = ShutdownState::ShuttingDown,
            }
        }

        let started = Instant::now();
        let budget = if force {
            self.config.forced_timeout
        } else {
            self.config.graceful_timeout
        };
        let deadline = started + budget;
        info!(
            force,
            budget_ms = budget.as_millis() as u64,
            connections = self.connections.live(),
            processes = self.processes.len(),
            "shutdown started"
        );

        let mut report = ShutdownReport {
            forced: force,
            ..ShutdownReport::default()
        };

        self.notify(deadline, &mut report).await;
        self.drain(deadline, &mut report).await;
        self.terminate_processes(&mut report).await;
        report.elapsed = started.elapsed();

        for failure in &report.failures {
            warn!(step = failure.step.as_str(), error = %failure.message, "shutdown step failed");
        }
        *self.last_report.lock() = Some(report.clone());

        if !report.is_clean() && !force {
            *self.state.lock() = ShutdownState::Idle;
            warn!(
                failures = report.failures.len(),
                "shutdown incomplete; host left running for a forced retry"
            );
            return Err(ShutdownError::Incomplete(Box::new(report)));
        }

        *self.state.lock() = ShutdownState::Complete;
        info!(
            forced = report.forced,
            notified = report.connections_notified,
            closed = report.connections_closed,
            terminated = report.processes_terminated,
            killed = report.processes_killed,
            failed = report.processes_failed,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "shutdown complete"
        );
        self.host.cancel();
        Ok(ShutdownOutcome::Completed(report))
    }

    fn remaining(deadline: Instant) -> Duration {
        deadline.saturating_duration_since(Instant::now())
    }

    async fn notify(&self, deadline: Instant, report: &mut ShutdownReport) {
        let budget = self.config.notify_timeout.min(Self::remaining(deadline));
        let notify = self.connections.notify(&self.config.message, budget);
        match tokio::time::timeout(budget, notify).await {
            Ok(count) => report.connections_notified = count,
            Err(_) => report.failures.push(StepFailure {
                step: ShutdownStep::Notify,
                message: format!("notify exceeded {}ms", budget.as_millis()),
            }),
        }
    }

    async fn drain(&self, deadline: Instant, report: &mut ShutdownReport) {
        let before = self.connections.live();
        self.connections.close_all();

        let budget = Self::remaining(deadline);
        let drained = tokio::time::timeout(budget, self.connections.wait_drained()).await;
        let remaining = self.connections.live();
        report.connections_closed = before.saturating_sub(remaining);

        if drained.is_err() && remaining > 0 {
            report.failures.push(StepFailure {
                step: ShutdownStep::Drain,
                message: format!("{remaining} connection(s) still open after drain"),
            });
        }
    }

    async fn terminate_processes(&self, report: &mut ShutdownReport) {
        let pids = self.processes.snapshot();
        let grace = self.config.per_process_timeout;
        let poll = self.config.poll_interval;
        let signaller = self.signaller.as_ref();

        let results = join_all(pids.iter().map(|&pid| async move {
            (pid, terminate_process(signaller, pid, grace, poll).await)
        }))
        .await;

        for (pid, result) in results {
            match result {
                ProcessTermination::Graceful | ProcessTermination::AlreadyGone => {
                    report.processes_terminated += 1;
                    self.processes.unregister(pid);
                }
                ProcessTermination::Killed => {
                    report.processes_terminated += 1;
                    report.processes_killed += 1;
                    self.processes.unregister(pid);
                }
                ProcessTermination::Failed(reason) => {
                    report.processes_failed += 1;
                    report.failures.push(StepFailure {
                        step: ShutdownStep::TerminateProcesses,
                        message: format!("process {pid}: {reason}"),
                    });
                }
            }
        }
    }
}

impl core::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
