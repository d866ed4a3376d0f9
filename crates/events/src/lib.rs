//! Progress events and their fan-out.
//!
//! - `event`: the immutable `ProgressEvent` record and its `EventId` cursor
//! - `phase`: coarse, client-facing phase derived from a stage label
//! - `bus`: the `ProgressPublisher` seam and per-subscriber `Subscription`
//! - `broadcaster`: the in-memory `ProgressBroadcaster` (history, latest, fan-out)

pub mod broadcaster;
pub mod bus;
pub mod event;
pub mod phase;

pub use broadcaster::{BroadcasterConfig, ProgressBroadcaster};
pub use bus::{ProgressPublisher, Subscription};
pub use event::{EventId, EventIdParseError, EventType, ProgressEvent, ProgressUpdate};
pub use phase::Phase;
