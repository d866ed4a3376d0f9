//! Tracked child processes and their termination.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ShutdownError;

/// Result of delivering a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Sent,
    /// The process no longer exists
    AlreadyGone,
}

/// OS signalling seam.
pub trait ProcessSignaller: Send + Sync {
    /// Ask the process to exit (SIGTERM).
    fn terminate(&self, pid: u32) -> Result<SignalOutcome, ShutdownError>;

    /// Force the process to exit (SIGKILL).
    fn kill(&self, pid: u32) -> Result<SignalOutcome, ShutdownError>;

    fn is_alive(&self, pid: u32) -> bool;
}

/// Signals delivered with `kill(2)`.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSignaller;

#[cfg(unix)]
impl SystemSignaller {
    fn send(
        pid: u32,
        signal: nix::sys::signal::Signal,
        name: &'static str,
    ) -> Result<SignalOutcome, ShutdownError> {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let raw = i32::try_from(pid).map_err(|_| ShutdownError::Signal {
            pid,
            signal: name,
            reason: "pid out of range".to_string(),
        })?;

        match kill(Pid::from_raw(raw), signal) {
            Ok(()) => Ok(SignalOutcome::Sent),
            Err(Errno::ESRCH) => Ok(SignalOutcome::AlreadyGone),
            Err(errno) => Err(ShutdownError::Signal {
                pid,
                signal: name,
                reason: errno.desc().to_string(),
            }),
        }
    }
}

#[cfg(unix)]
impl ProcessSignaller for SystemSignaller {
    fn terminate(&self, pid: u32) -> Result<SignalOutcome, ShutdownError> {
        Self::send(pid, nix::sys::signal::Signal::SIGTERM, "SIGTERM")
    }

    fn kill(&self, pid: u32) -> Result<SignalOutcome, ShutdownError> {
        Self::send(pid, nix::sys::signal::Signal::SIGKILL, "SIGKILL")
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        // Signal 0 only checks existence and permission.
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw), None).is_ok()
    }
}

/// Set of child process ids started by stage executors.
///
/// Registration is append/remove only and safe from any thread.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    pids: Mutex<BTreeSet<u32>>,
}

impl ProcessRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns `false` if the pid was already tracked.
    pub fn register(&self, pid: u32) -> bool {
        let added = self.pids.lock().insert(pid);
        if added {
            debug!(pid, "child process registered");
        }
        added
    }

    pub fn unregister(&self, pid: u32) -> bool {
        let removed = self.pids.lock().remove(&pid);
        if removed {
            debug!(pid, "child process unregistered");
        }
        removed
    }

    /// Register `pid` until the returned guard is dropped.
    pub fn track(self: &Arc<Self>, pid: u32) -> ProcessGuard {
        self.register(pid);
        ProcessGuard {
            pid,
            registry: Arc::downgrade(self),
        }
    }

    pub fn snapshot(&self) -> Vec<u32> {
        self.pids.lock().iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.pids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.lock().is_empty()
    }
}

/// Keeps a pid registered while a stage owns the process.
#[derive(Debug)]
pub struct ProcessGuard {
    pid: u32,
    registry: Weak<ProcessRegistry>,
}

impl ProcessGuard {
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.pid);
        }
    }
}

/// How one tracked process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessTermination {
    /// Exited within the grace period after SIGTERM
    Graceful,
    /// Needed SIGKILL
    Killed,
    /// Was not running any more
    AlreadyGone,
    Failed(String),
}

impl ProcessTermination {
    pub fn is_success(&self) -> bool {
        !matches!(self, ProcessTermination::Failed(_))
    }
}

async fn exited_within(
    signaller: &dyn ProcessSignaller,
    pid: u32,
    budget: Duration,
    poll: Duration,
) -> bool {
    let deadline = Instant::now() + budget;
    loop {
        if !signaller.is_alive(pid) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(poll.min(deadline - now)).await;
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
pub async fn terminate_process(
    signaller: &dyn ProcessSignaller,
    pid: u32,
    grace: Duration,
    poll: Duration,
) -> ProcessTermination {
    match signaller.terminate(pid) {
        Ok(SignalOutcome::AlreadyGone) => return ProcessTermination::AlreadyGone,
        Ok(SignalOutcome::Sent) => {}
        Err(err) => {
            warn!(pid, error = %err, "terminate signal failed");
            return ProcessTermination::Failed(err.to_string());
        }
    }

    if exited_within(signaller, pid, grace, poll).await {
        debug!(pid, "process exited after SIGTERM");
        return ProcessTermination::Graceful;
    }

    warn!(pid, grace_ms = grace.as_millis() as u64, "process ignored SIGTERM, escalating");
    match signaller.kill(pid) {
        Ok(SignalOutcome::AlreadyGone) => ProcessTermination::Graceful,
        Ok(SignalOutcome::Sent) => ProcessTermination::Killed,
        Err(err) => {
            warn!(pid, error = %err, "kill signal failed");
            ProcessTermination::Failed(err.to_string())
        }
    }
}
