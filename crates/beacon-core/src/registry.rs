//! The connection registry.
//!
//! The registry owns the authoritative `user -> {connection, instance}`
//! mapping. It combines the [`LocalPresenceCache`] (always correct for
//! connections held by this process) with a shared [`CacheProvider`] (the
//! cross-instance source of truth, treated as soft and evictable).
//!
//! Failure policy follows the connection lifecycle:
//!
//! - **connect** fails closed: if the cache write fails the connection cannot
//!   be reached and must be rejected
//! - **disconnect** fails open: local state is always cleaned up, a stale
//!   cache entry expires on its own
//! - **lookup** failures surface as errors that delivery treats as "no
//!   connections"

use crate::cache::{bounded, CacheError, CacheProvider};
use crate::config::{ConfigError, RegistryConfig};
use crate::lock::{DistributedLock, LockToken};
use crate::presence::LocalPresenceCache;
use crate::session::{
    connection_pattern, session_key, user_pattern, validate_id, ConnectionSession, InstanceId,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A user or connection identifier cannot be stored.
    #[error("Invalid identifier {id:?}: {reason}")]
    InvalidId {
        /// The rejected identifier.
        id: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The shared cache could not be reached.
    #[error("Registry unavailable: {0}")]
    Unavailable(#[from] CacheError),
}

fn check_id(id: &str) -> Result<(), RegistryError> {
    validate_id(id).map_err(|reason| RegistryError::InvalidId {
        id: id.to_string(),
        reason,
    })
}

/// Registry of live connections across a fleet of instances.
pub struct ConnectionRegistry {
    instance_id: InstanceId,
    cache: Arc<dyn CacheProvider>,
    presence: LocalPresenceCache,
    lock: DistributedLock,
    config: RegistryConfig,
}

impl ConnectionRegistry {
    /// Create a registry for this process.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(
        instance_id: impl Into<InstanceId>,
        cache: Arc<dyn CacheProvider>,
        config: RegistryConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let instance_id = instance_id.into();
        let lock = DistributedLock::new(cache.clone(), config.lock_ttl)
            .with_poll_interval(config.lock_poll_interval)
            .with_call_timeout(config.cache_timeout);

        info!(
            instance = %instance_id,
            cache = cache.name(),
            "Creating connection registry with config: {:?}",
            config
        );

        Ok(Self {
            presence: LocalPresenceCache::new(instance_id.clone()),
            instance_id,
            cache,
            lock,
            config,
        })
    }

    /// This process's instance identifier.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Connections held by this process.
    #[must_use]
    pub fn presence(&self) -> &LocalPresenceCache {
        &self.presence
    }

    /// The registry configuration.
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// The lock manager used for per-user serialization.
    #[must_use]
    pub fn lock(&self) -> &DistributedLock {
        &self.lock
    }

    /// Record a live connection.
    ///
    /// Writes the session entry with a fresh TTL, then records the connection
    /// locally if it is owned by this process.
    ///
    /// # Errors
    ///
    /// Returns an error if an identifier is invalid or the cache write fails.
    /// Either way the connection is unregistrable and must be closed.
    pub async fn track(
        &self,
        user_id: &str,
        connection_id: &str,
        instance_id: &str,
    ) -> Result<ConnectionSession, RegistryError> {
        check_id(user_id)?;
        check_id(connection_id)?;

        let key = session_key(&self.config.key_prefix, user_id, connection_id);
        self.write_entry(&key, instance_id).await?;

        let mut session = ConnectionSession::new(user_id, connection_id, instance_id);
        if instance_id == self.instance_id {
            self.presence.add(user_id, connection_id).await;
            session.created_at = self
                .presence
                .session_of(connection_id)
                .and_then(|local| local.created_at);
        }

        debug!(
            user = %user_id,
            connection = %connection_id,
            instance = %instance_id,
            "Tracked connection"
        );
        Ok(session)
    }

    /// Forget a connection.
    ///
    /// Local state is removed first and always; the cache delete is best
    /// effort. Dropping ownership first stops a concurrent [`refresh`] from
    /// re-asserting the entry after it is deleted.
    ///
    /// [`refresh`]: ConnectionRegistry::refresh
    pub async fn untrack(&self, user_id: &str, connection_id: &str) {
        self.presence.remove(user_id, connection_id).await;

        let key = session_key(&self.config.key_prefix, user_id, connection_id);
        match bounded(self.config.cache_timeout, self.cache.remove(&key)).await {
            Ok(true) => trace!(key = %key, "Removed session entry"),
            Ok(false) => debug!(key = %key, "Session entry already gone"),
            Err(e) => warn!(
                user = %user_id,
                connection = %connection_id,
                error = %e,
                "Failed to remove session entry, leaving it to expire"
            ),
        }

        debug!(user = %user_id, connection = %connection_id, "Untracked connection");
    }

    /// List every live session of a user across the fleet.
    ///
    /// # Errors
    ///
    /// Returns an error if the user identifier is invalid or the cache
    /// cannot be read.
    pub async fn list_connections(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConnectionSession>, RegistryError> {
        check_id(user_id)?;

        let pattern = user_pattern(&self.config.key_prefix, user_id);
        let keys = bounded(self.config.cache_timeout, self.cache.scan(&pattern)).await?;

        let mut sessions = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(session) = self.load(&key).await? {
                sessions.push(session);
            }
        }

        trace!(user = %user_id, sessions = sessions.len(), "Listed connections");
        Ok(sessions)
    }

    /// Find the session of a single connection.
    ///
    /// Connections held by this process are answered locally; anything else
    /// needs a cache scan.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier is invalid or the cache cannot be read.
    pub async fn find_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<ConnectionSession>, RegistryError> {
        if let Some(session) = self.presence.session_of(connection_id) {
            return Ok(Some(session));
        }
        check_id(connection_id)?;

        let pattern = connection_pattern(&self.config.key_prefix, connection_id);
        let keys = bounded(self.config.cache_timeout, self.cache.scan(&pattern)).await?;

        for key in keys {
            if let Some(session) = self.load(&key).await? {
                return Ok(Some(session));
            }
        }
        Ok(None)
    }

    /// Re-assert a locally owned session entry with a fresh TTL.
    ///
    /// Returns `false` without writing if this process no longer holds the
    /// connection. If the connection is untracked while the write is in
    /// flight, the rewritten entry is deleted again.
    ///
    /// # Errors
    ///
    /// Returns an error if a cache call fails.
    pub async fn refresh(&self, session: &ConnectionSession) -> Result<bool, RegistryError> {
        if !self.holds(session) {
            trace!(connection = %session.connection_id, "Skipping refresh of released session");
            return Ok(false);
        }

        let key = session.key(&self.config.key_prefix);
        self.write_entry(&key, &session.instance_id).await?;

        if !self.holds(session) {
            debug!(
                connection = %session.connection_id,
                "Session released during refresh, removing entry"
            );
            bounded(self.config.cache_timeout, self.cache.remove(&key)).await?;
            return Ok(false);
        }
        Ok(true)
    }

    fn holds(&self, session: &ConnectionSession) -> bool {
        self.presence
            .session_of(&session.connection_id)
            .is_some_and(|local| local.user_id == session.user_id)
    }

    /// Connection-open hook for the transport layer.
    ///
    /// Tracks the connection under the per-user lock. If the lock cannot be
    /// taken in time the write proceeds anyway: entries are idempotent, and
    /// only the cache write decides whether the connection is accepted.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection could not be registered; the
    /// transport must reject it.
    pub async fn on_connect(
        &self,
        user_id: &str,
        connection_id: &str,
        instance_id: &str,
    ) -> Result<ConnectionSession, RegistryError> {
        let lock_key = self.lock_key(user_id);
        let token = self.acquire_user_lock(&lock_key, user_id).await;

        let result = self.track(user_id, connection_id, instance_id).await;

        if let Some(token) = token {
            self.lock.release(&lock_key, &token).await;
        }

        if let Err(e) = &result {
            error!(
                user = %user_id,
                connection = %connection_id,
                error = %e,
                "Rejecting connection: registration failed"
            );
        }
        result
    }

    /// Connection-close hook for the transport layer. Never fails.
    pub async fn on_disconnect(&self, user_id: &str, connection_id: &str) {
        let lock_key = self.lock_key(user_id);
        let token = self.acquire_user_lock(&lock_key, user_id).await;

        self.untrack(user_id, connection_id).await;

        if let Some(token) = token {
            self.lock.release(&lock_key, &token).await;
        }
    }

    fn lock_key(&self, user_id: &str) -> String {
        format!("{}:{}", self.config.lock_prefix, user_id)
    }

    async fn acquire_user_lock(&self, lock_key: &str, user_id: &str) -> Option<LockToken> {
        let token = self.lock.acquire(lock_key, self.config.lock_timeout).await;
        if token.is_none() {
            warn!(user = %user_id, "Registry lock unavailable, proceeding unlocked");
        }
        token
    }

    async fn write_entry(&self, key: &str, instance_id: &str) -> Result<(), RegistryError> {
        bounded(
            self.config.cache_timeout,
            self.cache.set(key, instance_id, Some(self.config.entry_ttl)),
        )
        .await?;
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<ConnectionSession>, RegistryError> {
        // The entry may have expired between the scan and the read.
        let Some(instance_id) = bounded(self.config.cache_timeout, self.cache.get(key)).await?
        else {
            return Ok(None);
        };

        let Some(mut session) =
            ConnectionSession::from_entry(&self.config.key_prefix, key, &instance_id)
        else {
            warn!(key = %key, "Skipping malformed session entry");
            return Ok(None);
        };

        if let Some(local) = self.presence.session_of(&session.connection_id) {
            session.created_at = local.created_at;
        }
        Ok(Some(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use std::time::Duration;

    fn registry(cache: Arc<MemoryCache>) -> ConnectionRegistry {
        ConnectionRegistry::new("A", cache, RegistryConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_track_list_untrack() {
        let cache = Arc::new(MemoryCache::new());
        let registry = registry(cache.clone());

        for conn in ["c1", "c2", "c3"] {
            registry.track("u1", conn, "A").await.unwrap();
        }
        registry.track("u2", "c4", "A").await.unwrap();

        let sessions = registry.list_connections("u1").await.unwrap();
        assert_eq!(sessions.len(), 3);
        assert!(sessions.iter().all(|s| s.instance_id == "A"));
        assert!(sessions.iter().all(|s| s.created_at.is_some()));

        registry.untrack("u1", "c2").await;
        let sessions = registry.list_connections("u1").await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert!(!registry.presence().owns("c2"));
        assert!(cache.get("beacon:session:u1:c2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remote_sessions_are_not_local() {
        let registry = registry(Arc::new(MemoryCache::new()));

        registry.track("u1", "c1", "A").await.unwrap();
        let remote = registry.track("u1", "c2", "B").await.unwrap();

        assert!(registry.presence().owns("c1"));
        assert!(!registry.presence().owns("c2"));
        assert_eq!(remote.instance_id, "B");

        let found = registry.find_connection("c2").await.unwrap().unwrap();
        assert_eq!(found.user_id, "u1");
        assert_eq!(found.instance_id, "B");
        assert!(found.created_at.is_none());

        assert!(registry.find_connection("c9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_ids_rejected() {
        let registry = registry(Arc::new(MemoryCache::new()));

        assert!(matches!(
            registry.track("u:1", "c1", "A").await,
            Err(RegistryError::InvalidId { .. })
        ));
        assert!(registry.track("u1", "c*", "A").await.is_err());
        assert!(registry.presence().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_without_refresh() {
        let cache = Arc::new(MemoryCache::new());
        let config = RegistryConfig {
            entry_ttl: Duration::from_millis(1000),
            reconcile_interval: Duration::from_millis(250),
            ..Default::default()
        };
        let registry = ConnectionRegistry::new("A", cache, config).unwrap();

        let session = registry.track("u1", "c1", "A").await.unwrap();
        tokio::time::advance(Duration::from_millis(800)).await;
        assert!(registry.refresh(&session).await.unwrap());

        tokio::time::advance(Duration::from_millis(800)).await;
        assert_eq!(registry.list_connections("u1").await.unwrap().len(), 1);

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(registry.list_connections("u1").await.unwrap().is_empty());
        // Local presence is unaffected by cache expiry
        assert!(registry.presence().owns("c1"));
    }

    #[tokio::test]
    async fn test_lifecycle_hooks_release_lock() {
        let cache = Arc::new(MemoryCache::new());
        let registry = registry(cache.clone());

        registry.on_connect("u1", "c1", "A").await.unwrap();
        assert!(cache.get("beacon:lock:u1").await.unwrap().is_none());

        registry.on_disconnect("u1", "c1").await;
        assert!(cache.get("beacon:lock:u1").await.unwrap().is_none());
        assert!(registry.list_connections("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_skips_released_session() {
        let cache = Arc::new(MemoryCache::new());
        let registry = registry(cache.clone());

        let session = registry.track("u1", "c1", "A").await.unwrap();
        registry.untrack("u1", "c1").await;

        assert!(!registry.refresh(&session).await.unwrap());
        assert!(cache.get("beacon:session:u1:c1").await.unwrap().is_none());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = RegistryConfig {
            reconcile_interval: Duration::from_secs(120),
            ..Default::default()
        };
        assert!(ConnectionRegistry::new("A", Arc::new(MemoryCache::new()), config).is_err());
    }
}
