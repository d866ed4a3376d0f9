//! Job lifecycle for multi-stage generation requests.
//!
//! ## Design
//!
//! - Jobs move through `Queued -> Running -> {Succeeded, Failed, Canceled}`
//!   (plus `Queued -> Canceled`); terminal states accept nothing further
//! - Progress is clamped to 0..=100 and never decreases
//! - Lifecycle timestamps are ordered and `ended_utc` is written exactly once
//! - Every transition is published as a progress event
//!
//! ## Components
//!
//! - `Job`: the entity and its pure transition rules
//! - `JobStateMachine`: owns the registry; per-job linearizable operations
//! - `JobRunner`: drives a job through its stage executors

pub mod error;
pub mod runner;
pub mod state_machine;
pub mod types;

pub use error::{StateError, StateResult};
pub use runner::{
    INTERRUPTED_WARNING, JobRunner, RunOutcome, StageContext, StageError, StageExecutor,
};
pub use state_machine::JobStateMachine;
pub use types::{Job, JobError, JobStatus};
