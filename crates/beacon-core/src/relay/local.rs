//! In-process relay bus.

use super::{RelayError, RelayInbox, RelayPublisher};
use async_trait::async_trait;
use beacon_protocol::{encode_envelope, Envelope};
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// A relay connecting instances that share one process.
///
/// Each subscribed instance gets a bounded inbox. Used by single-node
/// deployments and by tests that run several instances side by side.
#[derive(Debug, Default)]
pub struct LocalRelay {
    inboxes: DashMap<String, mpsc::Sender<Bytes>>,
}

impl LocalRelay {
    /// Create an empty relay.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the inbox of `instance_id`, replacing any previous one.
    pub fn subscribe(&self, instance_id: impl Into<String>, capacity: usize) -> RelayInbox {
        let instance_id = instance_id.into();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        debug!(instance = %instance_id, capacity, "Opened relay inbox");
        self.inboxes.insert(instance_id, tx);
        RelayInbox::new(rx)
    }

    /// Close the inbox of `instance_id`.
    pub fn unsubscribe(&self, instance_id: &str) -> bool {
        self.inboxes.remove(instance_id).is_some()
    }
}

#[async_trait]
impl RelayPublisher for LocalRelay {
    async fn publish(&self, target_instance: &str, envelope: &Envelope) -> Result<(), RelayError> {
        let tx = self
            .inboxes
            .get(target_instance)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RelayError::UnknownInstance(target_instance.to_string()))?;

        let data = encode_envelope(envelope)?;
        tx.try_send(data).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RelayError::Full(target_instance.to_string()),
            mpsc::error::TrySendError::Closed(_) => {
                RelayError::Closed(target_instance.to_string())
            }
        })?;

        trace!(
            instance = %target_instance,
            connection = %envelope.connection_id,
            "Relayed envelope"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
