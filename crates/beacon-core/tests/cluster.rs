//! Multi-instance behaviour of the registry, lock, reconciliation and gateway.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tenvis_beacon_core::{
    BoxError, CacheError, CacheProvider, CommandHandler, ConnectionContext, ConnectionHub,
    ConnectionRegistry, DeliveryGateway, Dispatcher, LocalRelay, MemoryCache, ReconciliationLoop,
    RegistryConfig, RegistryError, TopicRouteTable,
};
use tokio_util::sync::CancellationToken;

/// A memory cache that can be switched off.
#[derive(Default)]
struct FlakyCache {
    inner: MemoryCache,
    down: AtomicBool,
}

impl FlakyCache {
    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.down.load(Ordering::SeqCst) {
            Err(CacheError::Unavailable("switched off".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheProvider for FlakyCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.check()?;
        self.inner.set(key, value, ttl).await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        self.check()?;
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn remove(&self, key: &str) -> Result<bool, CacheError> {
        self.check()?;
        self.inner.remove(key).await
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        self.check()?;
        self.inner.scan(pattern).await
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}

#[derive(Debug, Serialize)]
struct Alert {
    text: String,
}

#[derive(Debug, Deserialize)]
struct Shout {
    to: String,
    text: String,
}

/// Forwards every shout to its target user through the gateway.
struct ShoutHandler {
    gateway: Arc<DeliveryGateway>,
}

#[async_trait]
impl CommandHandler<Shout> for ShoutHandler {
    async fn handle(&self, message: &Shout, _ctx: &ConnectionContext) -> Result<(), BoxError> {
        let alert = Alert {
            text: message.text.clone(),
        };
        self.gateway.send_to_user(&message.to, &alert).await?;
        Ok(())
    }
}

fn fast_lock_config() -> RegistryConfig {
    RegistryConfig {
        lock_poll_interval: Duration::from_millis(5),
        ..Default::default()
    }
}

fn routes() -> Arc<TopicRouteTable> {
    let mut table = TopicRouteTable::new();
    table.bind_outbound_json::<Alert>("alert").unwrap();
    table
        .bind_inbound_json::<Shout, ShoutHandler>("shout")
        .unwrap();
    Arc::new(table)
}

struct Node {
    registry: Arc<ConnectionRegistry>,
    hub: Arc<ConnectionHub>,
    gateway: Arc<DeliveryGateway>,
}

fn node(instance: &str, cache: Arc<dyn CacheProvider>, relay: Arc<LocalRelay>) -> Node {
    let registry =
        Arc::new(ConnectionRegistry::new(instance, cache, RegistryConfig::default()).unwrap());
    let hub = Arc::new(ConnectionHub::new());
    let gateway = Arc::new(DeliveryGateway::new(
        registry.clone(),
        routes(),
        hub.clone(),
        relay,
    ));
    Node {
        registry,
        hub,
        gateway,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_connects_are_all_recorded() {
    let registry = Arc::new(
        ConnectionRegistry::new("A", Arc::new(MemoryCache::new()), fast_lock_config()).unwrap(),
    );

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .on_connect("u1", &format!("c{i}"), "A")
                    .await
                    .unwrap();
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let sessions = registry.list_connections("u1").await.unwrap();
    let ids: HashSet<_> = sessions.iter().map(|s| s.connection_id.clone()).collect();
    assert_eq!(sessions.len(), 16);
    assert_eq!(ids.len(), 16);
    assert_eq!(registry.presence().connection_count(), 16);

    // Disconnect a subset concurrently
    let tasks: Vec<_> = (0..6)
        .map(|i| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.on_disconnect("u1", &format!("c{i}")).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(registry.list_connections("u1").await.unwrap().len(), 10);
    assert_eq!(registry.presence().connection_count(), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_connect_disconnect_leaves_no_duplicates() {
    let registry = Arc::new(
        ConnectionRegistry::new("A", Arc::new(MemoryCache::new()), fast_lock_config()).unwrap(),
    );

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry.on_connect("u1", "c1", "A").await.unwrap();
                registry.on_disconnect("u1", "c1").await;
                registry.on_connect("u1", "c1", "A").await.unwrap();
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    // The last writer for the single connection decides; never a duplicate
    let sessions = registry.list_connections("u1").await.unwrap();
    assert!(sessions.len() <= 1);
    assert!(registry.presence().connection_count() <= 1);

    registry.on_disconnect("u1", "c1").await;
    assert!(registry.list_connections("u1").await.unwrap().is_empty());
    assert!(registry.presence().is_empty());
}

#[tokio::test]
async fn unavailable_cache_fails_connect_closed_and_disconnect_open() {
    let cache = Arc::new(FlakyCache::default());
    let registry = ConnectionRegistry::new("A", cache.clone(), RegistryConfig {
        lock_timeout: Duration::ZERO,
        ..Default::default()
    })
    .unwrap();

    registry.on_connect("u1", "c1", "A").await.unwrap();

    cache.set_down(true);
    assert!(matches!(
        registry.on_connect("u1", "c2", "A").await,
        Err(RegistryError::Unavailable(_))
    ));
    assert!(!registry.presence().owns("c2"));
    assert!(registry.list_connections("u1").await.is_err());

    // Local cleanup happens even though the cache delete fails
    registry.on_disconnect("u1", "c1").await;
    assert!(registry.presence().is_empty());

    // The stale entry outlives the outage until its TTL runs out
    cache.set_down(false);
    assert_eq!(registry.list_connections("u1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn lookup_failure_delivers_to_nobody() {
    let cache = Arc::new(FlakyCache::default());
    let relay = Arc::new(LocalRelay::new());
    let a = node("A", cache.clone(), relay);

    let _c1 = a.hub.register("c1", 8);
    a.registry.track("u1", "c1", "A").await.unwrap();

    cache.set_down(true);
    let alert = Alert {
        text: "hi".to_string(),
    };
    assert_eq!(a.gateway.send_to_user("u1", &alert).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn reconciliation_keeps_short_ttl_entries_alive() {
    let cache = Arc::new(MemoryCache::new());
    let config = RegistryConfig {
        entry_ttl: Duration::from_millis(1000),
        reconcile_interval: Duration::from_millis(250),
        ..Default::default()
    };
    let registry = Arc::new(ConnectionRegistry::new("A", cache, config).unwrap());
    registry.track("u1", "c1", "A").await.unwrap();

    let shutdown = CancellationToken::new();
    let handle = ReconciliationLoop::new(registry.clone()).spawn(shutdown.clone());

    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(registry.list_connections("u1").await.unwrap().len(), 1);
    }

    shutdown.cancel();
    handle.await.unwrap();

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(registry.list_connections("u1").await.unwrap().is_empty());
}

#[tokio::test]
async fn command_on_one_instance_reaches_user_on_another() {
    let cache: Arc<dyn CacheProvider> = Arc::new(MemoryCache::new());
    let relay = Arc::new(LocalRelay::new());
    let a = node("A", cache.clone(), relay.clone());
    let b = node("B", cache, relay.clone());

    let shutdown = CancellationToken::new();
    let consumer = b
        .gateway
        .clone()
        .spawn_relay_consumer(relay.subscribe("B", 16), shutdown.clone());

    // u1 talks to A, u2 listens on B
    let _c1 = a.hub.register("c1", 8);
    a.registry.on_connect("u1", "c1", "A").await.unwrap();
    let mut c2 = b.hub.register("c2", 8);
    b.registry.on_connect("u2", "c2", "B").await.unwrap();

    let dispatcher = Dispatcher::builder(routes())
        .register(ShoutHandler {
            gateway: a.gateway.clone(),
        })
        .build();

    let ctx = ConnectionContext::new("u1", "c1", "A");
    dispatcher
        .handle("shout", r#"{"to":"u2","text":"hello"}"#, &ctx)
        .await
        .unwrap();

    let pushed = c2.recv().await.unwrap();
    assert_eq!(pushed.topic, "alert");
    assert_eq!(pushed.payload, r#"{"text":"hello"}"#);
    assert_eq!(a.gateway.stats().relayed, 1);

    shutdown.cancel();
    consumer.await.unwrap();
}
