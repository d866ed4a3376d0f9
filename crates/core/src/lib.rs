//! Shared building blocks for the job-orchestration runtime.
//!
//! This crate contains **pure** primitives (no IO, no async): strongly-typed
//! identifiers, the pipeline stage vocabulary and timestamp helpers.

pub mod error;
pub mod id;
pub mod stage;
pub mod time;

pub use error::CoreError;
pub use id::{ConnectionId, CorrelationId, JobId};
pub use stage::{PipelineStage, is_resumable_stage};
pub use time::not_before;
