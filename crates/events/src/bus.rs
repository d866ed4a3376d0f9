//! Progress publishing/subscription abstraction (mechanics only).
//!
//! The job state machine reports updates through [`ProgressPublisher`]; it does
//! not know who listens. Listeners hold a [`Subscription`] per job.
//!
//! ## Delivery guarantees
//!
//! - Events of one job are stamped with strictly increasing ids.
//! - Delivery to one subscriber never blocks the publisher or other subscribers.
//! - A subscriber never skips an event: one that stays too slow is disconnected
//!   instead, and recovers by resubscribing from its last seen id (the history
//!   is the replay source).

use std::sync::Arc;

use tokio::sync::mpsc;

use reelforge_core::JobId;

use crate::event::{ProgressEvent, ProgressUpdate};

/// A live subscription to the progress events of one job.
///
/// Dropping the subscription unsubscribes it.
pub struct Subscription {
    job_id: JobId,
    receiver: mpsc::Receiver<ProgressEvent>,
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(
        job_id: JobId,
        receiver: mpsc::Receiver<ProgressEvent>,
        detach: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            job_id,
            receiver,
            detach: Some(Box::new(detach)),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Wait for the next event. `None` once the job's channel is cleared or
    /// the subscriber was disconnected for lagging.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.receiver.recv().await
    }

    /// Explicitly unsubscribe (equivalent to dropping).
    pub fn unsubscribe(mut self) {
        self.detach_now();
    }

    fn detach_now(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach_now();
    }
}

impl core::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Subscription")
            .field("job_id", &self.job_id)
            .finish_non_exhaustive()
    }
}

/// Sink for job progress updates.
///
/// Implementations stamp the update (id, phase, timestamp), record it and fan
/// it out. `publish` must not block on slow consumers.
pub trait ProgressPublisher: Send + Sync {
    fn publish(&self, update: ProgressUpdate) -> ProgressEvent;
}

impl<B> ProgressPublisher for Arc<B>
where
    B: ProgressPublisher + ?Sized,
{
    fn publish(&self, update: ProgressUpdate) -> ProgressEvent {
        (**self).publish(update)
    }
}
