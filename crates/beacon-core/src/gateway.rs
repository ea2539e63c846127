//! Typed delivery to users and connections anywhere in the fleet.
//!
//! For each target session the gateway picks one path:
//!
//! - **direct**: the connection is held by this process, so the payload goes
//!   straight to the [`DirectSender`]
//! - **relay**: another instance holds it, so an [`Envelope`] is published to
//!   that instance's inbox
//!
//! Delivery is best effort. Each connection succeeds or fails on its own,
//! nothing is retried, and a failed registry lookup reads as "no sessions".
//! Errors are reserved for configuration mistakes: an unbound message type
//! or a serializer that rejects its input.

use crate::registry::ConnectionRegistry;
use crate::relay::{RelayInbox, RelayPublisher};
use crate::routes::{BoxError, RouteError, TopicRouteTable};
use crate::session::ConnectionSession;
use crate::transport::DirectSender;
use beacon_protocol::Envelope;
use futures_util::future::join_all;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Gateway errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The message type has no outbound route.
    #[error(transparent)]
    RouteNotFound(#[from] RouteError),

    /// The bound serializer failed.
    #[error("Failed to serialize {message_type}: {source}")]
    Serialize {
        /// Message type name.
        message_type: &'static str,
        /// Serializer error.
        #[source]
        source: BoxError,
    },
}

/// Delivery counters since the gateway was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Payloads handed to the direct sender.
    pub direct: u64,
    /// Envelopes published to another instance.
    pub relayed: u64,
    /// Deliveries that failed on either path.
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    direct: AtomicU64,
    relayed: AtomicU64,
    failed: AtomicU64,
}

/// Delivers typed messages to users and connections.
pub struct DeliveryGateway {
    registry: Arc<ConnectionRegistry>,
    routes: Arc<TopicRouteTable>,
    sender: Arc<dyn DirectSender>,
    relay: Arc<dyn RelayPublisher>,
    counters: Counters,
}

impl DeliveryGateway {
    /// Create a gateway.
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        routes: Arc<TopicRouteTable>,
        sender: Arc<dyn DirectSender>,
        relay: Arc<dyn RelayPublisher>,
    ) -> Self {
        info!(
            instance = %registry.instance_id(),
            relay = relay.name(),
            outbound_routes = routes.outbound_count(),
            "Creating delivery gateway"
        );
        Self {
            registry,
            routes,
            sender,
            relay,
            counters: Counters::default(),
        }
    }

    /// The registry sessions are looked up in.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Snapshot of the delivery counters.
    #[must_use]
    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            direct: self.counters.direct.load(Ordering::Relaxed),
            relayed: self.counters.relayed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Deliver `message` to every live connection of `user_id`.
    ///
    /// Returns the number of connections the message was handed to.
    ///
    /// # Errors
    ///
    /// Returns an error if `M` has no outbound route or fails to serialize.
    pub async fn send_to_user<M: Any>(
        &self,
        user_id: &str,
        message: &M,
    ) -> Result<usize, GatewayError> {
        let (topic, payload) = self.prepare(message)?;
        Ok(self.fan_out_user(user_id, topic, &payload).await)
    }

    /// Deliver `message` to every live connection of each user.
    ///
    /// The message is serialized once. Returns the total number of
    /// connections reached.
    ///
    /// # Errors
    ///
    /// Returns an error if `M` has no outbound route or fails to serialize.
    pub async fn send_to_users<M, I, S>(&self, user_ids: I, message: &M) -> Result<usize, GatewayError>
    where
        M: Any,
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let (topic, payload) = self.prepare(message)?;
        let users: Vec<S> = user_ids.into_iter().collect();

        let counts = join_all(
            users
                .iter()
                .map(|user_id| self.fan_out_user(user_id.as_ref(), topic, &payload)),
        )
        .await;
        Ok(counts.into_iter().sum())
    }

    /// Deliver `message` to a single connection.
    ///
    /// Returns whether the message was handed off.
    ///
    /// # Errors
    ///
    /// Returns an error if `M` has no outbound route or fails to serialize.
    pub async fn send_to_connection<M: Any>(
        &self,
        connection_id: &str,
        message: &M,
    ) -> Result<bool, GatewayError> {
        let (topic, payload) = self.prepare(message)?;

        // Local membership needs no cache round trip.
        if let Some(session) = self.registry.presence().session_of(connection_id) {
            return Ok(self.deliver(&session, topic, &payload).await);
        }

        match self.registry.find_connection(connection_id).await {
            Ok(Some(session)) => Ok(self.deliver(&session, topic, &payload).await),
            Ok(None) => {
                debug!(connection = %connection_id, "No session for connection");
                Ok(false)
            }
            Err(e) => {
                warn!(connection = %connection_id, error = %e, "Connection lookup failed");
                Ok(false)
            }
        }
    }

    /// Deliver a relayed envelope addressed to this instance.
    ///
    /// Dropped if the connection is no longer held here.
    pub async fn deliver_envelope(&self, envelope: Envelope) -> bool {
        if !self.registry.presence().owns(&envelope.connection_id) {
            debug!(
                connection = %envelope.connection_id,
                origin = %envelope.origin_instance_id,
                "Dropping envelope for connection not held here"
            );
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        self.send_direct(&envelope.connection_id, &envelope.topic, &envelope.payload)
            .await
    }

    /// Drain `inbox` into [`deliver_envelope`](Self::deliver_envelope) until
    /// `shutdown` is cancelled or the inbox closes.
    pub fn spawn_relay_consumer(
        self: Arc<Self>,
        mut inbox: RelayInbox,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(instance = %self.registry.instance_id(), "Starting relay consumer");
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    envelope = inbox.recv() => {
                        let Some(envelope) = envelope else { break };
                        self.deliver_envelope(envelope).await;
                    }
                }
            }
            info!("Relay consumer stopped");
        })
    }

    fn prepare<M: Any>(&self, message: &M) -> Result<(&str, String), GatewayError> {
        let route = self.routes.resolve_outbound::<M>()?;
        let payload = route
            .serialize(message)
            .map_err(|source| GatewayError::Serialize {
                message_type: route.message_type(),
                source,
            })?;
        Ok((route.topic(), payload))
    }

    async fn fan_out_user(&self, user_id: &str, topic: &str, payload: &str) -> usize {
        let sessions = match self.registry.list_connections(user_id).await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(user = %user_id, error = %e, "Session lookup failed, delivering to nobody");
                return 0;
            }
        };

        let delivered = join_all(
            sessions
                .iter()
                .map(|session| self.deliver(session, topic, payload)),
        )
        .await
        .into_iter()
        .filter(|ok| *ok)
        .count();

        trace!(
            user = %user_id,
            topic = %topic,
            sessions = sessions.len(),
            delivered,
            "Fanned out message"
        );
        delivered
    }

    async fn deliver(&self, session: &ConnectionSession, topic: &str, payload: &str) -> bool {
        let local = self.registry.presence().owns(&session.connection_id)
            || session.instance_id == self.registry.instance_id();

        if local {
            return self.send_direct(&session.connection_id, topic, payload).await;
        }

        let envelope = Envelope::new(
            session.connection_id.as_str(),
            topic,
            payload,
            self.registry.instance_id(),
        );
        match self.relay.publish(&session.instance_id, &envelope).await {
            Ok(()) => {
                self.counters.relayed.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                warn!(
                    connection = %session.connection_id,
                    instance = %session.instance_id,
                    error = %e,
                    "Relay delivery failed"
                );
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    async fn send_direct(&self, connection_id: &str, topic: &str, payload: &str) -> bool {
        match self.sender.invoke(connection_id, topic, payload).await {
            Ok(()) => {
                self.counters.direct.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                warn!(connection = %connection_id, error = %e, "Direct delivery failed");
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheProvider, MemoryCache};
    use crate::config::RegistryConfig;
    use crate::relay::LocalRelay;
    use crate::transport::ConnectionHub;
    use serde::Serialize;

    #[derive(Debug, Serialize)]
    struct Alert {
        text: String,
    }

    struct Unbound;

    fn alert() -> Alert {
        Alert {
            text: "hi".to_string(),
        }
    }

    fn routes() -> Arc<TopicRouteTable> {
        let mut table = TopicRouteTable::new();
        table.bind_outbound_json::<Alert>("alert").unwrap();
        Arc::new(table)
    }

    struct Node {
        gateway: Arc<DeliveryGateway>,
        hub: Arc<ConnectionHub>,
    }

    fn node(instance: &str, cache: Arc<dyn CacheProvider>, relay: Arc<LocalRelay>) -> Node {
        let registry =
            Arc::new(ConnectionRegistry::new(instance, cache, RegistryConfig::default()).unwrap());
        let hub = Arc::new(ConnectionHub::new());
        let gateway = Arc::new(DeliveryGateway::new(registry, routes(), hub.clone(), relay));
        Node { gateway, hub }
    }

    #[tokio::test]
    async fn test_local_and_remote_fan_out() {
        let cache: Arc<dyn CacheProvider> = Arc::new(MemoryCache::new());
        let relay = Arc::new(LocalRelay::new());
        let a = node("A", cache.clone(), relay.clone());
        let b = node("B", cache, relay.clone());
        let mut inbox_b = relay.subscribe("B", 8);

        let mut c1 = a.hub.register("c1", 8);
        a.gateway.registry().track("u1", "c1", "A").await.unwrap();
        b.gateway.registry().track("u1", "c2", "B").await.unwrap();

        let delivered = a.gateway.send_to_user("u1", &alert()).await.unwrap();
        assert_eq!(delivered, 2);

        let direct = c1.recv().await.unwrap();
        assert_eq!(direct.topic, "alert");
        assert_eq!(direct.payload, r#"{"text":"hi"}"#);

        let envelope = inbox_b.recv().await.unwrap();
        assert_eq!(envelope.connection_id, "c2");
        assert_eq!(envelope.origin_instance_id, "A");
        assert_eq!(envelope.payload, r#"{"text":"hi"}"#);

        assert_eq!(
            a.gateway.stats(),
            DeliveryStats {
                direct: 1,
                relayed: 1,
                failed: 0
            }
        );
    }

    #[tokio::test]
    async fn test_failed_relay_is_isolated() {
        let cache: Arc<dyn CacheProvider> = Arc::new(MemoryCache::new());
        // Nobody listens for B
        let relay = Arc::new(LocalRelay::new());
        let a = node("A", cache.clone(), relay.clone());
        let b = node("B", cache, relay);

        let _c1 = a.hub.register("c1", 8);
        a.gateway.registry().track("u1", "c1", "A").await.unwrap();
        b.gateway.registry().track("u1", "c2", "B").await.unwrap();

        assert_eq!(a.gateway.send_to_user("u1", &alert()).await.unwrap(), 1);
        assert_eq!(a.gateway.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_deliver_envelope_requires_ownership() {
        let cache: Arc<dyn CacheProvider> = Arc::new(MemoryCache::new());
        let b = node("B", cache, Arc::new(LocalRelay::new()));

        let mut c2 = b.hub.register("c2", 8);
        b.gateway.registry().track("u1", "c2", "B").await.unwrap();

        assert!(b.gateway.deliver_envelope(Envelope::new("c2", "alert", "{}", "A")).await);
        assert_eq!(c2.recv().await.unwrap().payload, "{}");

        assert!(!b.gateway.deliver_envelope(Envelope::new("c9", "alert", "{}", "A")).await);
    }

    #[tokio::test]
    async fn test_send_to_connection() {
        let cache: Arc<dyn CacheProvider> = Arc::new(MemoryCache::new());
        let relay = Arc::new(LocalRelay::new());
        let a = node("A", cache.clone(), relay.clone());
        let b = node("B", cache, relay.clone());
        let mut inbox_b = relay.subscribe("B", 8);

        let _c1 = a.hub.register("c1", 8);
        a.gateway.registry().track("u1", "c1", "A").await.unwrap();
        b.gateway.registry().track("u2", "c2", "B").await.unwrap();

        assert!(a.gateway.send_to_connection("c1", &alert()).await.unwrap());
        assert!(a.gateway.send_to_connection("c2", &alert()).await.unwrap());
        assert_eq!(inbox_b.recv().await.unwrap().connection_id, "c2");
        assert!(!a.gateway.send_to_connection("c9", &alert()).await.unwrap());
    }

    #[tokio::test]
    async fn test_send_to_users_sums_counts() {
        let cache: Arc<dyn CacheProvider> = Arc::new(MemoryCache::new());
        let a = node("A", cache, Arc::new(LocalRelay::new()));

        let _c1 = a.hub.register("c1", 8);
        let _c2 = a.hub.register("c2", 8);
        let _c3 = a.hub.register("c3", 8);
        a.gateway.registry().track("u1", "c1", "A").await.unwrap();
        a.gateway.registry().track("u1", "c2", "A").await.unwrap();
        a.gateway.registry().track("u2", "c3", "A").await.unwrap();

        let delivered = a
            .gateway
            .send_to_users(["u1", "u2", "nobody"], &alert())
            .await
            .unwrap();
        assert_eq!(delivered, 3);
    }

    #[tokio::test]
    async fn test_unbound_type_is_an_error() {
        let a = node("A", Arc::new(MemoryCache::new()), Arc::new(LocalRelay::new()));
        assert!(matches!(
            a.gateway.send_to_user("u1", &Unbound).await,
            Err(GatewayError::RouteNotFound(RouteError::OutboundNotFound(_)))
        ));
    }
}
