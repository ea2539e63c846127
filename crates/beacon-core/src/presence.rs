//! Local presence tracking for Beacon.
//!
//! The local presence cache records which connections this process holds,
//! grouped by user. It is always correct for local connections and is the
//! fast path for deciding whether a connection can be served directly.
//!
//! Users are partitioned across a sharded map so events for different users
//! never contend. Each user's connection set sits behind its own mutex so
//! simultaneous connect/disconnect events for the same user are serialized.
//! When the last connection of a user is removed the set is retired and
//! dropped together with its mutex.

use crate::session::{now_millis, ConnectionSession, InstanceId};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Connections one user holds on this process.
#[derive(Debug, Default)]
struct ConnectionSet {
    /// Connection ID -> unix millis when it was added.
    connections: HashMap<String, u64>,
    /// Set once the set has been emptied and unlinked from the map.
    retired: bool,
}

type UserSlot = Arc<Mutex<ConnectionSet>>;

/// Reverse index entry for a local connection.
#[derive(Debug, Clone)]
struct Owner {
    user_id: String,
    created_at: u64,
}

/// Thread-safe set of connections currently owned by this instance.
#[derive(Debug)]
pub struct LocalPresenceCache {
    instance_id: InstanceId,
    /// User ID -> that user's connection set.
    users: DashMap<String, UserSlot>,
    /// Connection ID -> owning user, for ownership checks without a user.
    owners: DashMap<String, Owner>,
}

impl LocalPresenceCache {
    /// Create an empty cache for the given instance.
    #[must_use]
    pub fn new(instance_id: impl Into<InstanceId>) -> Self {
        Self {
            instance_id: instance_id.into(),
            users: DashMap::new(),
            owners: DashMap::new(),
        }
    }

    /// The instance this cache belongs to.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Add a connection for a user.
    ///
    /// Returns `true` if the connection is new, `false` if it was already present.
    pub async fn add(&self, user_id: &str, connection_id: &str) -> bool {
        loop {
            let slot = self.users.entry(user_id.to_string()).or_default().clone();
            let mut set = slot.lock().await;

            // Lost a race with the removal of the user's last connection;
            // the map now holds (or will get) a fresh set.
            if set.retired {
                continue;
            }

            let is_new = !set.connections.contains_key(connection_id);
            let created_at = *set
                .connections
                .entry(connection_id.to_string())
                .or_insert_with(now_millis);

            self.owners.insert(
                connection_id.to_string(),
                Owner {
                    user_id: user_id.to_string(),
                    created_at,
                },
            );

            if is_new {
                debug!(
                    user = %user_id,
                    connection = %connection_id,
                    connections = set.connections.len(),
                    "Presence: connection added"
                );
            }

            return is_new;
        }
    }

    /// Remove a connection for a user.
    ///
    /// Returns `true` if the connection was present.
    pub async fn remove(&self, user_id: &str, connection_id: &str) -> bool {
        loop {
            let Some(slot) = self.users.get(user_id).map(|slot| slot.clone()) else {
                return false;
            };
            let mut set = slot.lock().await;

            if set.retired {
                continue;
            }

            let removed = set.connections.remove(connection_id).is_some();
            if removed {
                self.owners
                    .remove_if(connection_id, |_, owner| owner.user_id == user_id);
                debug!(user = %user_id, connection = %connection_id, "Presence: connection removed");
            }

            if set.connections.is_empty() {
                set.retired = true;
                self.users.remove_if(user_id, |_, current| Arc::ptr_eq(current, &slot));
                debug!(user = %user_id, "Presence: user has no local connections");
            }

            return removed;
        }
    }

    /// Snapshot every local session.
    pub async fn list(&self) -> Vec<ConnectionSession> {
        let slots: Vec<(String, UserSlot)> = self
            .users
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut sessions = Vec::with_capacity(self.owners.len());
        for (user_id, slot) in slots {
            let set = slot.lock().await;
            if set.retired {
                continue;
            }
            sessions.extend(
                set.connections
                    .iter()
                    .map(|(connection_id, created_at)| self.session(&user_id, connection_id, *created_at)),
            );
        }

        sessions
    }

    /// Snapshot the local sessions of one user.
    pub async fn connections_for(&self, user_id: &str) -> Vec<ConnectionSession> {
        let Some(slot) = self.users.get(user_id).map(|slot| slot.clone()) else {
            return Vec::new();
        };
        let set = slot.lock().await;

        set.connections
            .iter()
            .map(|(connection_id, created_at)| self.session(user_id, connection_id, *created_at))
            .collect()
    }

    /// Check whether this process holds a connection.
    #[must_use]
    pub fn owns(&self, connection_id: &str) -> bool {
        self.owners.contains_key(connection_id)
    }

    /// Look up the local session of a connection.
    #[must_use]
    pub fn session_of(&self, connection_id: &str) -> Option<ConnectionSession> {
        self.owners
            .get(connection_id)
            .map(|owner| self.session(&owner.user_id, connection_id, owner.created_at))
    }

    /// Number of users with at least one local connection.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Number of local connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.owners.len()
    }

    /// Check if no connections are held locally.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    fn session(&self, user_id: &str, connection_id: &str, created_at: u64) -> ConnectionSession {
        ConnectionSession {
            user_id: user_id.to_string(),
            connection_id: connection_id.to_string(),
            instance_id: self.instance_id.clone(),
            created_at: Some(created_at),
        }
    }
}
