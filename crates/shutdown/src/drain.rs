//! Stream connections as seen by the shutdown sequence.

use std::time::Duration;

use async_trait::async_trait;

use reelforge_streaming::{ConnectionRegistry, Frame};

/// What shutdown needs from the set of live stream connections.
#[async_trait]
pub trait ConnectionDrain: Send + Sync {
    fn live(&self) -> usize;

    /// Send a shutdown notice to every connection; returns how many received it.
    async fn notify(&self, message: &str, per_connection: Duration) -> usize;

    /// Ask every connection to close; returns how many were asked.
    fn close_all(&self) -> usize;

    /// Resolve once every connection has closed.
    async fn wait_drained(&self);
}

#[async_trait]
impl ConnectionDrain for ConnectionRegistry {
    fn live(&self) -> usize {
        self.len()
    }

    async fn notify(&self, message: &str, per_connection: Duration) -> usize {
        self.broadcast(Frame::shutdown(message), per_connection).await
    }

    fn close_all(&self) -> usize {
        ConnectionRegistry::close_all(self)
    }

    async fn wait_drained(&self) {
        self.wait_until_empty().await
    }
}
