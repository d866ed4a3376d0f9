//! Per-connection delivery loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use reelforge_core::JobId;
use reelforge_events::{EventId, EventType, ProgressBroadcaster, ProgressEvent, Subscription};

use crate::connection::{ConnectionLease, ConnectionRegistry};
use crate::error::StreamError;
use crate::frame::Frame;

pub const IDLE_TIMEOUT_MESSAGE: &str = "Connection idle timeout exceeded";

/// Stream configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Keepalive period while no event is delivered
    pub heartbeat_interval: Duration,
    /// Connection is closed after this long without a delivered event
    pub idle_timeout: Duration,
    /// Frames buffered between the delivery loop and the transport
    pub buffer: usize,
    /// Out-of-band frames (shutdown notices) buffered per connection
    pub control_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(120),
            buffer: 32,
            control_capacity: 4,
        }
    }
}

impl StreamConfig {
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

/// Per-connection ordering filter.
///
/// Drops events whose id does not exceed the last delivered one, and
/// `step-progress` events below the highest percent already delivered.
#[derive(Debug, Clone, Default)]
pub struct DeliveryGuard {
    last_id: Option<EventId>,
    last_percent: Option<u8>,
}

impl DeliveryGuard {
    /// Start after `cursor` (the client's last seen id), if any.
    pub fn new(cursor: Option<EventId>) -> Self {
        Self {
            last_id: cursor,
            last_percent: None,
        }
    }

    pub fn last_id(&self) -> Option<EventId> {
        self.last_id
    }

    pub fn admit(&mut self, event: &ProgressEvent) -> bool {
        if self.last_id.is_some_and(|last| event.event_id <= last) {
            debug!(event_id = %event.event_id, "dropping already delivered event");
            return false;
        }
        if event.event_type == EventType::StepProgress
            && self.last_percent.is_some_and(|last| event.percent < last)
        {
            debug!(
                event_id = %event.event_id,
                percent = event.percent,
                "dropping out-of-order progress frame"
            );
            return false;
        }

        self.last_id = Some(event.event_id);
        self.last_percent = Some(self.last_percent.map_or(event.percent, |p| p.max(event.percent)));
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Terminal,
    ClientGone,
    ClientCanceled,
    Shutdown,
    Drained,
    IdleTimeout,
    ChannelCleared,
}

impl CloseReason {
    fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Terminal => "terminal_event",
            CloseReason::ClientGone => "client_gone",
            CloseReason::ClientCanceled => "client_canceled",
            CloseReason::Shutdown => "shutdown",
            CloseReason::Drained => "drained",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::ChannelCleared => "channel_cleared",
        }
    }
}

/// Opens progress streams for clients.
#[derive(Debug, Clone)]
pub struct StreamingAdapter {
    broadcaster: Arc<ProgressBroadcaster>,
    connections: Arc<ConnectionRegistry>,
    config: StreamConfig,
    shutdown: CancellationToken,
}

impl StreamingAdapter {
    pub fn new(
        broadcaster: Arc<ProgressBroadcaster>,
        connections: Arc<ConnectionRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            broadcaster,
            connections,
            config: StreamConfig::default(),
            shutdown,
        }
    }

    pub fn with_config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    /// Open a stream of `job_id`, replaying retained events after `cursor`.
    ///
    /// The stream ends after a terminal event, on `client` cancellation, on
    /// process shutdown, when the registry drains it, or after the idle
    /// ceiling. Dropping the stream also ends it.
    pub fn open(
        &self,
        job_id: JobId,
        cursor: Option<EventId>,
        client: CancellationToken,
    ) -> Result<ReceiverStream<Frame>, StreamError> {
        if self.shutdown.is_cancelled() {
            return Err(StreamError::ShuttingDown);
        }

        let lease = self
            .connections
            .register(job_id, self.config.control_capacity);
        let (replay, subscription) = self.broadcaster.subscribe_from(job_id, cursor);
        let (tx, rx) = mpsc::channel(self.config.buffer.max(1));

        info!(
            connection_id = %lease.id(),
            job_id = %job_id,
            cursor = ?cursor.map(|c| c.to_string()),
            replay = replay.len(),
            "stream opened"
        );

        let connection = Connection {
            lease,
            subscription,
            tx,
            guard: DeliveryGuard::new(cursor),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
            client,
            idle_deadline: Instant::now() + self.config.idle_timeout,
            delivered: 0,
        };
        tokio::spawn(connection.run(replay));

        Ok(ReceiverStream::new(rx))
    }
}

struct Connection {
    lease: ConnectionLease,
    subscription: Subscription,
    tx: mpsc::Sender<Frame>,
    guard: DeliveryGuard,
    config: StreamConfig,
    shutdown: CancellationToken,
    client: CancellationToken,
    idle_deadline: Instant,
    delivered: u64,
}

impl Connection {
    async fn run(mut self, replay: Vec<ProgressEvent>) {
        let reason = self.pump(replay).await;
        info!(
            connection_id = %self.lease.id(),
            job_id = %self.lease.job_id(),
            reason = reason.as_str(),
            delivered = self.delivered,
            "stream closed"
        );
    }

    /// Queue one frame for the transport.
    ///
    /// A client that stops reading fills the buffer; the wait for room still
    /// yields to cancellation, shutdown, drain and the idle ceiling.
    async fn send(&self, frame: Frame) -> Result<(), CloseReason> {
        let permit = tokio::select! {
            biased;

            permit = self.tx.reserve() => permit.map_err(|_| CloseReason::ClientGone)?,
            _ = self.client.cancelled() => return Err(CloseReason::ClientCanceled),
            _ = self.shutdown.cancelled() => return Err(CloseReason::Shutdown),
            _ = self.lease.close_token().cancelled() => return Err(CloseReason::Drained),
            _ = tokio::time::sleep_until(self.idle_deadline) => {
                return Err(CloseReason::IdleTimeout);
            }
        };
        permit.send(frame);
        Ok(())
    }

    /// Send one event if the ordering guard admits it.
    async fn deliver(&mut self, event: ProgressEvent) -> Option<CloseReason> {
        if !self.guard.admit(&event) {
            return None;
        }
        let terminal = event.is_terminal();
        if let Err(reason) = self.send(Frame::Progress(event)).await {
            return Some(reason);
        }
        self.delivered += 1;
        self.idle_deadline = Instant::now() + self.config.idle_timeout;
        terminal.then_some(CloseReason::Terminal)
    }

    async fn pump(&mut self, replay: Vec<ProgressEvent>) -> CloseReason {
        for event in replay {
            if let Some(reason) = self.deliver(event).await {
                return reason;
            }
        }

        let heartbeat_every = self.config.heartbeat_interval;
        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + heartbeat_every, heartbeat_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let client = self.client.clone();
        let shutdown = self.shutdown.clone();
        let drained = self.lease.close_token().clone();

        loop {
            tokio::select! {
                biased;

                _ = client.cancelled() => return CloseReason::ClientCanceled,
                // A queued notice goes out before a drain request closes the stream.
                Some(frame) = self.lease.next_control() => {
                    let closing = frame.is_closing();
                    if let Err(reason) = self.send(frame).await {
                        return reason;
                    }
                    if closing {
                        return CloseReason::Shutdown;
                    }
                }
                _ = shutdown.cancelled() => return CloseReason::Shutdown,
                _ = drained.cancelled() => return CloseReason::Drained,
                _ = self.tx.closed() => return CloseReason::ClientGone,
                _ = tokio::time::sleep_until(self.idle_deadline) => {
                    // Best effort: a stalled client has no room for it.
                    let _ = self.tx.try_send(Frame::error(IDLE_TIMEOUT_MESSAGE));
                    return CloseReason::IdleTimeout;
                }
                event = self.subscription.recv() => {
                    let Some(event) = event else {
                        return CloseReason::ChannelCleared;
                    };
                    let before = self.delivered;
                    if let Some(reason) = self.deliver(event).await {
                        return reason;
                    }
                    if self.delivered > before {
                        heartbeat.reset();
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(reason) = self.send(Frame::keepalive_now()).await {
                        return reason;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio_stream::StreamExt;

    use super::*;
    use reelforge_events::ProgressUpdate;

    struct Fixture {
        broadcaster: Arc<ProgressBroadcaster>,
        adapter: StreamingAdapter,
        shutdown: CancellationToken,
        job: JobId,
    }

    fn fixture() -> Fixture {
        let broadcaster = Arc::new(ProgressBroadcaster::default());
        let shutdown = CancellationToken::new();
        let adapter = StreamingAdapter::new(
            broadcaster.clone(),
            ConnectionRegistry::new(),
            shutdown.clone(),
        );
        Fixture {
            broadcaster,
            adapter,
            shutdown,
            job: JobId::new(),
        }
    }

    impl Fixture {
        fn publish(&self, event_type: EventType, percent: u8) -> ProgressEvent {
            self.broadcaster.publish(ProgressUpdate::new(
                self.job,
                event_type,
                "Visuals",
                percent,
                "working",
            ))
        }

        fn open(&self, cursor: Option<EventId>) -> ReceiverStream<Frame> {
            self.adapter
                .open(self.job, cursor, CancellationToken::new())
                .unwrap()
        }
    }

    fn progress_id(frame: Option<Frame>) -> EventId {
        match frame {
            Some(Frame::Progress(event)) => event.event_id,
            other => panic!("expected progress frame, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_replays_after_cursor_then_goes_live() {
        let f = fixture();
        let ids: Vec<_> = (1..=5)
            .map(|i| f.publish(EventType::StepProgress, i * 10).event_id)
            .collect();

        let mut first = f.open(None);
        for id in &ids {
            assert_eq!(progress_id(first.next().await), *id);
        }
        drop(first);

        let mut stream = f.open(Some(ids[2]));
        assert_eq!(progress_id(stream.next().await), ids[3]);
        assert_eq!(progress_id(stream.next().await), ids[4]);

        let live = f.publish(EventType::StepProgress, 60).event_id;
        assert_eq!(progress_id(stream.next().await), live);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_cursor_replays_from_oldest_retained() {
        let f = fixture();
        let first = f.publish(EventType::JobStatus, 0).event_id;
        f.publish(EventType::StepProgress, 10);

        let mut stream = f.open(Some(EventId::new(0, 0)));
        assert_eq!(progress_id(stream.next().await), first);
    }

    #[tokio::test(start_paused = true)]
    async fn lower_step_progress_is_dropped() {
        let f = fixture();
        let mut stream = f.open(None);

        let fifty = f.publish(EventType::StepProgress, 50).event_id;
        f.publish(EventType::StepProgress, 40);
        let sixty = f.publish(EventType::StepProgress, 60).event_id;

        assert_eq!(progress_id(stream.next().await), fifty);
        assert_eq!(progress_id(stream.next().await), sixty);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_gets_keepalive() {
        let f = fixture();
        let mut stream = f.open(None);

        assert!(matches!(stream.next().await, Some(Frame::Keepalive(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_ceiling_closes_with_error_frame() {
        let f = fixture();
        let mut stream = f.open(None);

        let mut last = None;
        while let Some(frame) = stream.next().await {
            last = Some(frame);
        }

        assert_eq!(last, Some(Frame::error(IDLE_TIMEOUT_MESSAGE)));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_event_ends_stream() {
        let f = fixture();
        let mut stream = f.open(None);
        f.publish(EventType::JobCompleted, 100);

        assert!(matches!(stream.next().await, Some(Frame::Progress(e)) if e.is_terminal()));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_ends_stream_and_refuses_new_ones() {
        let f = fixture();
        let mut stream = f.open(None);
        f.shutdown.cancel();

        assert_eq!(stream.next().await, None);
        assert!(matches!(
            f.adapter.open(f.job, None, CancellationToken::new()),
            Err(StreamError::ShuttingDown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn client_cancel_unregisters_connection() {
        let f = fixture();
        let client = CancellationToken::new();
        let mut stream = f.adapter.open(f.job, None, client.clone()).unwrap();
        assert_eq!(f.adapter.connections().len(), 1);

        client.cancel();
        assert_eq!(stream.next().await, None);
        f.adapter.connections().wait_until_empty().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_notice_is_forwarded_then_stream_closes() {
        let f = fixture();
        let mut stream = f.open(None);

        let notified = f
            .adapter
            .connections()
            .broadcast(Frame::shutdown("Server shutting down"), Duration::from_secs(1))
            .await;

        assert_eq!(notified, 1);
        assert_eq!(stream.next().await, Some(Frame::shutdown("Server shutting down")));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn notice_queued_before_drain_is_still_delivered() {
        let f = fixture();
        let mut stream = f.open(None);
        let connections = f.adapter.connections();

        connections
            .broadcast(Frame::shutdown("Server shutting down"), Duration::from_secs(1))
            .await;
        connections.close_all();

        assert_eq!(stream.next().await, Some(Frame::shutdown("Server shutting down")));
        assert_eq!(stream.next().await, None);
    }

    fn fill_past_buffer(f: &Fixture) {
        for i in 0..60 {
            f.broadcaster.publish(ProgressUpdate::new(
                f.job,
                EventType::StepStatus,
                "Visuals",
                0,
                format!("scene {i}"),
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_tears_down_a_client_that_stopped_reading() {
        let f = fixture();
        let _unread = f.open(None);
        fill_past_buffer(&f);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.adapter.connections().len(), 1);

        f.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), f.adapter.connections().wait_until_empty())
            .await
            .expect("stalled connection outlived shutdown");
    }

    #[tokio::test(start_paused = true)]
    async fn drain_tears_down_a_client_that_stopped_reading() {
        let f = fixture();
        let _unread = f.open(None);
        fill_past_buffer(&f);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(f.adapter.connections().close_all(), 1);
        tokio::time::timeout(Duration::from_secs(1), f.adapter.connections().wait_until_empty())
            .await
            .expect("stalled connection outlived drain");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_ceiling_applies_to_a_client_that_stopped_reading() {
        let f = fixture();
        let _unread = f.open(None);
        fill_past_buffer(&f);

        tokio::time::timeout(Duration::from_secs(300), f.adapter.connections().wait_until_empty())
            .await
            .expect("stalled connection outlived the idle ceiling");
    }

    #[test]
    fn guard_rejects_non_increasing_ids() {
        let broadcaster = ProgressBroadcaster::default();
        let job = JobId::new();
        let a = broadcaster.publish(ProgressUpdate::new(job, EventType::StepStatus, "TTS", 0, "a"));
        let b = broadcaster.publish(ProgressUpdate::new(job, EventType::StepStatus, "TTS", 0, "b"));

        let mut guard = DeliveryGuard::new(None);
        assert!(guard.admit(&b));
        assert!(!guard.admit(&a));
        assert!(!guard.admit(&b));
        assert_eq!(guard.last_id(), Some(b.event_id));
    }
}
