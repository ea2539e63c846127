//! Delivery to connections held by this process.
//!
//! [`DirectSender`] is the seam between delivery and whatever transport owns
//! the sockets. [`ConnectionHub`] is the in-process implementation: each live
//! connection registers a bounded outbound queue that its socket task drains.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Direct send errors.
#[derive(Debug, Error)]
pub enum SendError {
    /// No connection with this id is registered here.
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    /// The connection's socket task has gone away.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// The connection's outbound queue is full.
    #[error("Outbound queue full for connection {0}")]
    QueueFull(String),

    /// Transport specific failure.
    #[error("Send failed: {0}")]
    Failed(String),
}

/// Pushes a serialized payload to a connection held by this process.
#[async_trait]
pub trait DirectSender: Send + Sync {
    /// Deliver `payload` on `topic` to `connection_id`.
    async fn invoke(&self, connection_id: &str, topic: &str, payload: &str)
        -> Result<(), SendError>;
}

/// A message queued for a connection's socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Topic the payload was routed to.
    pub topic: String,
    /// Serialized message body.
    pub payload: String,
}

/// Registry of per-connection outbound queues.
#[derive(Debug, Default)]
pub struct ConnectionHub {
    queues: DashMap<String, mpsc::Sender<OutboundMessage>>,
}

impl ConnectionHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and return the receiving end of its queue.
    ///
    /// Registering an id again replaces the previous queue.
    pub fn register(
        &self,
        connection_id: impl Into<String>,
        capacity: usize,
    ) -> mpsc::Receiver<OutboundMessage> {
        let connection_id = connection_id.into();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        debug!(connection = %connection_id, capacity, "Registered outbound queue");
        self.queues.insert(connection_id, tx);
        rx
    }

    /// Drop a connection's queue. Returns whether it was registered.
    pub fn unregister(&self, connection_id: &str) -> bool {
        let removed = self.queues.remove(connection_id).is_some();
        if removed {
            debug!(connection = %connection_id, "Unregistered outbound queue");
        }
        removed
    }

    /// Check whether a connection is registered.
    #[must_use]
    pub fn contains(&self, connection_id: &str) -> bool {
        self.queues.contains_key(connection_id)
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    /// Check if no connections are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

#[async_trait]
impl DirectSender for ConnectionHub {
    async fn invoke(
        &self,
        connection_id: &str,
        topic: &str,
        payload: &str,
    ) -> Result<(), SendError> {
        // Clone the sender so no map guard is held past this line.
        let tx = self
            .queues
            .get(connection_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SendError::UnknownConnection(connection_id.to_string()))?;

        let message = OutboundMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
        };

        match tx.try_send(message) {
            Ok(()) => {
                trace!(connection = %connection_id, topic = %topic, "Queued outbound message");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(SendError::QueueFull(connection_id.to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.queues.remove_if(connection_id, |_, tx| tx.is_closed());
                Err(SendError::ConnectionClosed(connection_id.to_string()))
            }
        }
    }
}
