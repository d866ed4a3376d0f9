//! Orderly, time-boxed process teardown.
//!
//! ## Sequence
//!
//! 1. Notify every live stream connection with a `shutdown` frame
//! 2. Drain: close every stream connection
//! 3. Terminate tracked child processes (SIGTERM, then SIGKILL after the
//!    per-process budget)
//! 4. Report and cancel the host token
//!
//! A failed step is logged and the remaining steps still run. A non-forced
//! shutdown with failures returns an error and leaves the host running so a
//! forced shutdown can follow.

pub mod coordinator;
pub mod drain;
pub mod error;
pub mod process;

pub use coordinator::{
    ShutdownConfig, ShutdownCoordinator, ShutdownOutcome, ShutdownReport, ShutdownState,
    ShutdownStep, StepFailure,
};
pub use drain::ConnectionDrain;
pub use error::ShutdownError;
pub use process::{
    ProcessGuard, ProcessRegistry, ProcessSignaller, ProcessTermination, SignalOutcome,
    terminate_process,
};

#[cfg(unix)]
pub use process::SystemSignaller;
