//! In-memory progress broadcaster.
//!
//! Single source of truth for "what is the latest progress of job X" and the
//! fan-out point to N subscribers.
//!
//! - Per-job state (sequence counter, bounded history, subscriber list) sits
//!   behind its own mutex; the job map lock is only held for lookup/insert.
//! - Delivery first tries a non-blocking send. A subscriber with a full buffer
//!   turns lagging: its events queue in order behind one detached task that
//!   waits at most `delivery_timeout` per event, so a slow client never stalls
//!   the reporting job or the other subscribers.
//! - A lagging subscriber that misses that deadline is disconnected rather
//!   than skipped; its stream ends and the client resumes from its cursor.
//! - Subscribers that went away are pruned on the next publish.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{
    self,
    error::{SendTimeoutError, TrySendError},
};
use tracing::{debug, warn};

use reelforge_core::JobId;

use crate::bus::{ProgressPublisher, Subscription};
use crate::event::{EventId, ProgressEvent, ProgressUpdate};

/// Broadcaster configuration.
#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    /// Events retained per job for replay (oldest evicted first)
    pub history_limit: usize,
    /// Per-subscriber buffer size
    pub subscriber_buffer: usize,
    /// Time a lagging subscriber gets to accept each queued event
    pub delivery_timeout: Duration,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            history_limit: 100,
            subscriber_buffer: 64,
            delivery_timeout: Duration::from_millis(250),
        }
    }
}

impl BroadcasterConfig {
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    pub fn with_subscriber_buffer(mut self, buffer: usize) -> Self {
        self.subscriber_buffer = buffer.max(1);
        self
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    sender: mpsc::Sender<ProgressEvent>,
    /// Set while a drain task owns delivery to this subscriber
    lagging: bool,
    backlog: VecDeque<ProgressEvent>,
}

#[derive(Debug, Default)]
struct JobChannel {
    last_sequence: u64,
    history: VecDeque<ProgressEvent>,
    subscribers: Vec<Subscriber>,
}

/// Fan-out of progress events with bounded per-job history.
#[derive(Debug)]
pub struct ProgressBroadcaster {
    config: BroadcasterConfig,
    channels: RwLock<HashMap<JobId, Arc<Mutex<JobChannel>>>>,
    next_subscriber_id: AtomicU64,
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(BroadcasterConfig::default())
    }
}

impl ProgressBroadcaster {
    pub fn new(config: BroadcasterConfig) -> Self {
        Self {
            config,
            channels: RwLock::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    pub fn arc(config: BroadcasterConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    pub fn config(&self) -> &BroadcasterConfig {
        &self.config
    }

    fn channel(&self, job_id: JobId) -> Arc<Mutex<JobChannel>> {
        if let Some(channel) = self.channels.read().get(&job_id) {
            return channel.clone();
        }
        self.channels.write().entry(job_id).or_default().clone()
    }

    /// Stamp, record and fan out an update.
    pub fn publish(&self, update: ProgressUpdate) -> ProgressEvent {
        let channel = self.channel(update.job_id);
        let mut guard = channel.lock();

        guard.last_sequence += 1;
        let now = Utc::now();
        let event_id = EventId::new(now.timestamp_millis(), guard.last_sequence);
        let event = ProgressEvent::stamp(update, event_id, now);

        guard.history.push_back(event.clone());
        while guard.history.len() > self.config.history_limit {
            guard.history.pop_front();
        }

        guard
            .subscribers
            .retain_mut(|subscriber| self.deliver(&channel, subscriber, &event));

        debug!(
            job_id = %event.job_id,
            event_id = %event.event_id,
            event_type = %event.event_type,
            percent = event.percent,
            "progress published"
        );

        event
    }

    /// Returns false when the subscriber must be dropped.
    fn deliver(
        &self,
        channel: &Arc<Mutex<JobChannel>>,
        subscriber: &mut Subscriber,
        event: &ProgressEvent,
    ) -> bool {
        if subscriber.lagging {
            subscriber.backlog.push_back(event.clone());
            return true;
        }

        match subscriber.sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Closed(_)) => {
                debug!(
                    job_id = %event.job_id,
                    subscriber = subscriber.id,
                    "subscriber disconnected, pruning"
                );
                false
            }
            Err(TrySendError::Full(event)) => {
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    warn!(
                        job_id = %event.job_id,
                        subscriber = subscriber.id,
                        event_id = %event.event_id,
                        "subscriber buffer full outside a runtime; disconnecting"
                    );
                    return false;
                };

                subscriber.lagging = true;
                subscriber.backlog.push_back(event);
                runtime.spawn(drain_backlog(
                    Arc::downgrade(channel),
                    subscriber.id,
                    subscriber.sender.clone(),
                    self.config.delivery_timeout,
                ));
                true
            }
        }
    }

    /// Register a live subscription for a job.
    pub fn subscribe(&self, job_id: JobId) -> Subscription {
        let channel = self.channel(job_id);
        let mut guard = channel.lock();
        self.attach(job_id, &channel, &mut guard)
    }

    /// Snapshot the history after `after` and register a live subscription
    /// atomically, so no event can fall between the replay and live delivery.
    ///
    /// A cursor older than the retained history replays from the oldest
    /// retained event.
    pub fn subscribe_from(
        &self,
        job_id: JobId,
        after: Option<EventId>,
    ) -> (Vec<ProgressEvent>, Subscription) {
        let channel = self.channel(job_id);
        let mut guard = channel.lock();

        let replay = guard
            .history
            .iter()
            .filter(|event| after.is_none_or(|cursor| event.event_id > cursor))
            .cloned()
            .collect();
        let subscription = self.attach(job_id, &channel, &mut guard);

        (replay, subscription)
    }

    fn attach(
        &self,
        job_id: JobId,
        channel: &Arc<Mutex<JobChannel>>,
        guard: &mut JobChannel,
    ) -> Subscription {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.config.subscriber_buffer);
        guard.subscribers.push(Subscriber {
            id,
            sender,
            lagging: false,
            backlog: VecDeque::new(),
        });

        let weak: Weak<Mutex<JobChannel>> = Arc::downgrade(channel);
        Subscription::new(job_id, receiver, move || {
            if let Some(channel) = weak.upgrade() {
                channel.lock().subscribers.retain(|s| s.id != id);
            }
        })
    }

    /// Most recent event of a job.
    pub fn latest(&self, job_id: JobId) -> Option<ProgressEvent> {
        let channel = self.channels.read().get(&job_id).cloned()?;
        let guard = channel.lock();
        guard.history.back().cloned()
    }

    /// Retained events of a job, oldest first.
    pub fn history(&self, job_id: JobId) -> Vec<ProgressEvent> {
        let Some(channel) = self.channels.read().get(&job_id).cloned() else {
            return Vec::new();
        };
        let guard = channel.lock();
        guard.history.iter().cloned().collect()
    }

    pub fn subscriber_count(&self, job_id: JobId) -> usize {
        self.channels
            .read()
            .get(&job_id)
            .map(|channel| channel.lock().subscribers.len())
            .unwrap_or(0)
    }

    /// Drop cache, history and subscribers of a job.
    ///
    /// Live subscriptions observe the end of their stream.
    pub fn clear(&self, job_id: JobId) {
        let removed = self.channels.write().remove(&job_id);
        if let Some(channel) = removed {
            let mut guard = channel.lock();
            guard.history.clear();
            guard.subscribers.clear();
            debug!(job_id = %job_id, "progress channel cleared");
        }
    }
}

/// Deliver a lagging subscriber's backlog in order.
///
/// Ends when the backlog empties (the subscriber is live again) or when one
/// event misses `timeout`, in which case the subscriber is disconnected.
async fn drain_backlog(
    channel: Weak<Mutex<JobChannel>>,
    subscriber_id: u64,
    sender: mpsc::Sender<ProgressEvent>,
    timeout: Duration,
) {
    loop {
        let next = {
            let Some(channel) = channel.upgrade() else {
                return;
            };
            let mut guard = channel.lock();
            let Some(subscriber) = guard.subscribers.iter_mut().find(|s| s.id == subscriber_id)
            else {
                return;
            };
            match subscriber.backlog.pop_front() {
                Some(event) => event,
                None => {
                    subscriber.lagging = false;
                    return;
                }
            }
        };

        let job_id = next.job_id;
        let event_id = next.event_id;
        match sender.send_timeout(next, timeout).await {
            Ok(()) => continue,
            Err(SendTimeoutError::Timeout(_)) => warn!(
                job_id = %job_id,
                subscriber = subscriber_id,
                event_id = %event_id,
                timeout_ms = timeout.as_millis() as u64,
                "slow subscriber missed its delivery deadline; disconnecting"
            ),
            Err(SendTimeoutError::Closed(_)) => debug!(
                job_id = %job_id,
                subscriber = subscriber_id,
                "lagging subscriber disconnected"
            ),
        }

        if let Some(channel) = channel.upgrade() {
            channel.lock().subscribers.retain(|s| s.id != subscriber_id);
        }
        return;
    }
}

impl ProgressPublisher for ProgressBroadcaster {
    fn publish(&self, update: ProgressUpdate) -> ProgressEvent {
        ProgressBroadcaster::publish(self, update)
    }
}
