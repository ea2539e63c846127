//! Redis pub/sub relay for multi-node fleets.

use super::{RelayError, RelayInbox, RelayPublisher};
use async_trait::async_trait;
use beacon_protocol::{encode_envelope, Envelope};
use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

impl From<RedisError> for RelayError {
    fn from(err: RedisError) -> Self {
        RelayError::Backend(err.to_string())
    }
}

/// A relay that publishes envelopes on a per-instance Redis channel,
/// `"{prefix}:relay:{instance_id}"`.
#[derive(Clone)]
pub struct RedisRelay {
    client: Client,
    conn: ConnectionManager,
    prefix: String,
}

impl RedisRelay {
    /// Connect to Redis at `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, RelayError> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        let prefix = prefix.into();
        info!(url = %url, prefix = %prefix, "Connected Redis relay");
        Ok(Self {
            client,
            conn,
            prefix,
        })
    }

    /// The channel carrying envelopes for `instance_id`.
    #[must_use]
    pub fn channel(&self, instance_id: &str) -> String {
        format!("{}:relay:{}", self.prefix, instance_id)
    }

    /// Subscribe to the channel of `instance_id`.
    ///
    /// A background task forwards messages into the returned inbox until
    /// `shutdown` is cancelled or the inbox is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be established.
    pub async fn subscribe(
        &self,
        instance_id: &str,
        capacity: usize,
        shutdown: CancellationToken,
    ) -> Result<RelayInbox, RelayError> {
        let channel = self.channel(instance_id);
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&channel).await?;
        info!(channel = %channel, "Subscribed to relay channel");

        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    message = messages.next() => {
                        let Some(message) = message else {
                            warn!(channel = %channel, "Relay subscription ended");
                            break;
                        };
                        let data = Bytes::copy_from_slice(message.get_payload_bytes());
                        if tx.send(data).await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!(channel = %channel, "Relay subscriber stopped");
        });

        Ok(RelayInbox::new(rx))
    }
}

#[async_trait]
impl RelayPublisher for RedisRelay {
    async fn publish(&self, target_instance: &str, envelope: &Envelope) -> Result<(), RelayError> {
        let channel = self.channel(target_instance);
        let data = encode_envelope(envelope)?;

        let mut conn = self.conn.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(&channel)
            .arg(data.as_ref())
            .query_async(&mut conn)
            .await?;

        if receivers == 0 {
            return Err(RelayError::UnknownInstance(target_instance.to_string()));
        }
        trace!(channel = %channel, receivers, "Published envelope");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
