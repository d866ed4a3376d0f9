//! Reconnectable push streams of job progress.
//!
//! ## Design
//!
//! - A connection first replays retained events after the client's cursor,
//!   then switches to live delivery without a gap (see
//!   `ProgressBroadcaster::subscribe_from`)
//! - Each connection enforces its own ordering: event ids strictly increase
//!   and a `step-progress` frame never shows a lower percent than one already
//!   delivered
//! - Idle connections get a keepalive comment every heartbeat interval and are
//!   closed with an `error` frame after the idle ceiling
//! - Client disconnect, process shutdown and the idle ceiling each end the
//!   connection; none of them touches the job
//!
//! ## Components
//!
//! - `Frame`: wire-level unit (SSE rendering)
//! - `ConnectionRegistry`: live connections, used by shutdown to notify and drain
//! - `StreamingAdapter`: opens connections and runs their delivery loop

pub mod adapter;
pub mod connection;
pub mod error;
pub mod frame;

pub use adapter::{DeliveryGuard, StreamConfig, StreamingAdapter};
pub use connection::{ConnectionLease, ConnectionRegistry};
pub use error::StreamError;
pub use frame::Frame;
