//! Cross-instance relay.
//!
//! When a session is owned by another instance, the gateway wraps the
//! serialized payload in an [`Envelope`] and publishes it to that instance's
//! inbox. Each instance drains its own inbox and hands envelopes back to the
//! gateway for direct delivery.
//!
//! Envelopes travel as length-prefixed MessagePack, the same framing used
//! for client frames.

mod local;
#[cfg(feature = "redis")]
mod redis;

pub use local::LocalRelay;
#[cfg(feature = "redis")]
pub use self::redis::RedisRelay;

use async_trait::async_trait;
use beacon_protocol::{decode_envelope, Envelope, ProtocolError};
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// No inbox is listening for the target instance.
    #[error("No relay inbox for instance {0}")]
    UnknownInstance(String),

    /// The target inbox has been closed.
    #[error("Relay inbox closed for instance {0}")]
    Closed(String),

    /// The target inbox is full.
    #[error("Relay inbox full for instance {0}")]
    Full(String),

    /// The envelope could not be encoded.
    #[error("Envelope encoding failed: {0}")]
    Protocol(#[from] ProtocolError),

    /// Backend failure.
    #[error("Relay backend error: {0}")]
    Backend(String),
}

/// Publishes envelopes to a remote instance's inbox.
#[async_trait]
pub trait RelayPublisher: Send + Sync {
    /// Publish `envelope` to the inbox of `target_instance`.
    async fn publish(&self, target_instance: &str, envelope: &Envelope) -> Result<(), RelayError>;

    /// Backend name, for logs.
    fn name(&self) -> &'static str;
}

/// The receiving end of an instance's relay inbox.
#[derive(Debug)]
pub struct RelayInbox {
    rx: mpsc::Receiver<Bytes>,
}

impl RelayInbox {
    pub(crate) fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self { rx }
    }

    /// Wait for the next envelope.
    ///
    /// Undecodable messages are logged and skipped. Returns `None` once the
    /// inbox is closed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            let data = self.rx.recv().await?;
            match decode_envelope(&data) {
                Ok(envelope) => return Some(envelope),
                Err(e) => warn!(error = %e, bytes = data.len(), "Dropping undecodable envelope"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_protocol::encode_envelope;

    #[tokio::test]
    async fn test_inbox_skips_garbage() {
        let (tx, rx) = mpsc::channel(4);
        let mut inbox = RelayInbox::new(rx);

        tx.send(Bytes::from_static(b"\x00\x00\x00\x02\xc1\xc1"))
            .await
            .unwrap();
        let envelope = Envelope::new("c2", "alert", "{}", "A");
        tx.send(encode_envelope(&envelope).unwrap()).await.unwrap();
        drop(tx);

        assert_eq!(inbox.recv().await, Some(envelope));
        assert_eq!(inbox.recv().await, None);
    }
}
