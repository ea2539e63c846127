//! Connection sessions and their cache encoding.
//!
//! A session is stored in the shared cache as a single entry:
//!
//! ```text
//! "{prefix}:{user_id}:{connection_id}" -> instance_id
//! ```
//!
//! so all sessions of a user can be found with one prefix scan, and a session
//! can be rebuilt from nothing but the key and its value.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Separator between key segments.
pub const KEY_SEPARATOR: char = ':';

/// Maximum length of a user or connection identifier.
pub const MAX_ID_LENGTH: usize = 256;

/// An opaque process instance identifier.
pub type InstanceId = String;

/// Current wall-clock time in unix milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Generate an instance identifier. Called once at process start.
#[must_use]
pub fn generate_instance_id() -> InstanceId {
    Uuid::new_v4().simple().to_string()
}

/// Generate a connection identifier.
#[must_use]
pub fn generate_connection_id() -> String {
    format!("conn_{}", Uuid::new_v4().simple())
}

/// Validate a user or connection identifier.
///
/// Identifiers become cache key segments and scan patterns, so they may not
/// contain the key separator or glob metacharacters.
///
/// # Errors
///
/// Returns an error message if the identifier is invalid.
pub fn validate_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("Identifier cannot be empty");
    }
    if id.len() > MAX_ID_LENGTH {
        return Err("Identifier too long");
    }
    if id.contains(KEY_SEPARATOR) {
        return Err("Identifier cannot contain ':'");
    }
    if id
        .chars()
        .any(|c| matches!(c, '*' | '?' | '[' | ']' | '\\') || c.is_control())
    {
        return Err("Identifier contains reserved characters");
    }
    Ok(())
}

/// Cache key for one session.
#[must_use]
pub fn session_key(prefix: &str, user_id: &str, connection_id: &str) -> String {
    format!("{prefix}{KEY_SEPARATOR}{user_id}{KEY_SEPARATOR}{connection_id}")
}

/// Scan pattern matching every session of a user.
#[must_use]
pub fn user_pattern(prefix: &str, user_id: &str) -> String {
    format!("{prefix}{KEY_SEPARATOR}{user_id}{KEY_SEPARATOR}*")
}

/// Scan pattern matching the session of a connection, whoever its user is.
#[must_use]
pub fn connection_pattern(prefix: &str, connection_id: &str) -> String {
    format!("{prefix}{KEY_SEPARATOR}*{KEY_SEPARATOR}{connection_id}")
}

/// The association of a user with one live connection and its owning instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSession {
    /// Resolved user identifier.
    pub user_id: String,
    /// Unique identifier of the live connection.
    pub connection_id: String,
    /// Instance that physically holds the connection.
    pub instance_id: InstanceId,
    /// Unix millis when the connection was tracked.
    ///
    /// Only known for sessions owned by this process; sessions rebuilt from
    /// the shared cache carry `None`.
    pub created_at: Option<u64>,
}

impl ConnectionSession {
    /// Create a session stamped with the current time.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        connection_id: impl Into<String>,
        instance_id: impl Into<InstanceId>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            connection_id: connection_id.into(),
            instance_id: instance_id.into(),
            created_at: Some(now_millis()),
        }
    }

    /// Rebuild a session from a cache entry.
    ///
    /// Returns `None` if the key does not belong to `prefix` or is malformed.
    #[must_use]
    pub fn from_entry(prefix: &str, key: &str, instance_id: &str) -> Option<Self> {
        let rest = key
            .strip_prefix(prefix)?
            .strip_prefix(KEY_SEPARATOR)?;
        let (user_id, connection_id) = rest.split_once(KEY_SEPARATOR)?;

        if validate_id(user_id).is_err() || validate_id(connection_id).is_err() {
            return None;
        }

        Some(Self {
            user_id: user_id.to_string(),
            connection_id: connection_id.to_string(),
            instance_id: instance_id.to_string(),
            created_at: None,
        })
    }

    /// The cache key for this session.
    #[must_use]
    pub fn key(&self, prefix: &str) -> String {
        session_key(prefix, &self.user_id, &self.connection_id)
    }

    /// Check whether the session is owned by the given instance.
    #[must_use]
    pub fn is_owned_by(&self, instance_id: &str) -> bool {
        self.instance_id == instance_id
    }
}
