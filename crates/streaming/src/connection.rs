//! Registry of live stream connections.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use reelforge_core::{ConnectionId, JobId};

use crate::frame::Frame;

struct ConnectionEntry {
    control: mpsc::Sender<Frame>,
    close: CancellationToken,
}

/// Handle held by a connection's delivery loop; unregisters on drop.
pub struct ConnectionLease {
    id: ConnectionId,
    job_id: JobId,
    control: mpsc::Receiver<Frame>,
    close: CancellationToken,
    registry: Weak<ConnectionRegistry>,
}

impl ConnectionLease {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Fires when the registry closes this connection.
    pub fn close_token(&self) -> &CancellationToken {
        &self.close
    }

    /// Next out-of-band frame (e.g. shutdown notice).
    pub async fn next_control(&mut self) -> Option<Frame> {
        self.control.recv().await
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.id);
        }
    }
}

/// Owner of the set of live connections.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
    live: watch::Sender<usize>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        let (live, _) = watch::channel(0);
        Arc::new(Self {
            connections: RwLock::new(HashMap::new()),
            live,
        })
    }

    /// Register a connection for `job_id`.
    pub fn register(self: &Arc<Self>, job_id: JobId, control_capacity: usize) -> ConnectionLease {
        let id = ConnectionId::new();
        let (control_tx, control_rx) = mpsc::channel(control_capacity.max(1));
        let close = CancellationToken::new();

        let mut connections = self.connections.write();
        connections.insert(
            id,
            ConnectionEntry {
                control: control_tx,
                close: close.clone(),
            },
        );
        self.live.send_replace(connections.len());
        drop(connections);

        debug!(connection_id = %id, job_id = %job_id, "stream connection registered");
        ConnectionLease {
            id,
            job_id,
            control: control_rx,
            close,
            registry: Arc::downgrade(self),
        }
    }

    fn unregister(&self, id: ConnectionId) {
        let mut connections = self.connections.write();
        if connections.remove(&id).is_some() {
            self.live.send_replace(connections.len());
            debug!(connection_id = %id, "stream connection unregistered");
        }
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `frame` to every live connection, waiting at most
    /// `per_connection` for each. Returns how many accepted it.
    pub async fn broadcast(&self, frame: Frame, per_connection: Duration) -> usize {
        let targets: Vec<mpsc::Sender<Frame>> = self
            .connections
            .read()
            .values()
            .map(|c| c.control.clone())
            .collect();

        let sends = targets.iter().map(|control| {
            let frame = frame.clone();
            async move { control.send_timeout(frame, per_connection).await.is_ok() }
        });
        join_all(sends).await.into_iter().filter(|sent| *sent).count()
    }

    /// Signal every live connection to close. Returns how many were signalled.
    pub fn close_all(&self) -> usize {
        let connections = self.connections.read();
        for entry in connections.values() {
            entry.close.cancel();
        }
        connections.len()
    }

    /// Resolve once no connection is registered.
    pub async fn wait_until_empty(&self) {
        let mut live = self.live.subscribe();
        // Only fails when the sender is gone, which cannot outlive `self`.
        let _ = live.wait_for(|count| *count == 0).await;
    }
}

impl core::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("live", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_unregisters_on_drop() {
        let registry = ConnectionRegistry::new();
        let job = JobId::new();

        let first = registry.register(job, 4);
        let _second = registry.register(job, 4);
        assert_eq!(registry.len(), 2);

        drop(first);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_connection() {
        let registry = ConnectionRegistry::new();
        let mut a = registry.register(JobId::new(), 4);
        let mut b = registry.register(JobId::new(), 4);

        let sent = registry
            .broadcast(Frame::shutdown("Server shutting down"), Duration::from_millis(50))
            .await;

        assert_eq!(sent, 2);
        assert_eq!(a.next_control().await, Some(Frame::shutdown("Server shutting down")));
        assert_eq!(b.next_control().await, Some(Frame::shutdown("Server shutting down")));
    }

    #[tokio::test]
    async fn close_all_signals_leases_and_wait_resolves_after_drop() {
        let registry = ConnectionRegistry::new();
        let lease = registry.register(JobId::new(), 4);
        let token = lease.close_token().clone();

        assert_eq!(registry.close_all(), 1);
        assert!(token.is_cancelled());

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait_until_empty().await })
        };
        drop(lease);
        waiter.await.unwrap();
        assert!(registry.is_empty());
    }
}
