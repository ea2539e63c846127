//! Registry configuration and configuration errors.

use std::time::Duration;
use thiserror::Error;

/// Configuration errors. These indicate a programming or deployment mistake
/// and are raised at startup, never on the request path.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A topic name failed validation.
    #[error("Invalid topic {topic:?}: {reason}")]
    InvalidTopic {
        /// The rejected topic.
        topic: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A message type was bound to an outbound topic twice.
    #[error("Outbound route for {0} is already bound")]
    DuplicateOutbound(&'static str),

    /// A topic was bound to an inbound route twice.
    #[error("Inbound route for topic {0:?} is already bound")]
    DuplicateInbound(String),

    /// A key prefix is empty or contains reserved characters.
    #[error("Invalid key prefix {0:?}")]
    InvalidPrefix(String),

    /// A duration setting is out of range.
    #[error("Invalid {name}: {reason}")]
    InvalidDuration {
        /// Setting name.
        name: &'static str,
        /// Why it was rejected.
        reason: &'static str,
    },
}

/// Connection registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Prefix of session entries (`{prefix}:{user}:{connection}`).
    pub key_prefix: String,
    /// Prefix of per-user lock entries (`{prefix}:{user}`).
    pub lock_prefix: String,
    /// TTL of session entries.
    pub entry_ttl: Duration,
    /// How often owned sessions are re-asserted. Must be shorter than `entry_ttl`.
    pub reconcile_interval: Duration,
    /// Deadline applied to every cache call.
    pub cache_timeout: Duration,
    /// How long lifecycle hooks wait for the per-user lock.
    pub lock_timeout: Duration,
    /// TTL of lock entries.
    pub lock_ttl: Duration,
    /// Lock poll interval.
    pub lock_poll_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            key_prefix: "beacon:session".to_string(),
            lock_prefix: "beacon:lock".to_string(),
            entry_ttl: Duration::from_secs(60),
            reconcile_interval: Duration::from_secs(20),
            cache_timeout: Duration::from_secs(2),
            lock_timeout: Duration::from_secs(1),
            lock_ttl: Duration::from_secs(5),
            lock_poll_interval: Duration::from_millis(100),
        }
    }
}

fn validate_prefix(prefix: &str) -> Result<(), ConfigError> {
    let reserved = |c: char| matches!(c, '*' | '?' | '[' | ']' | '\\') || c.is_control();
    if prefix.is_empty() || prefix.ends_with(':') || prefix.chars().any(reserved) {
        return Err(ConfigError::InvalidPrefix(prefix.to_string()));
    }
    Ok(())
}

fn non_zero(name: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::InvalidDuration {
            name,
            reason: "must be greater than zero",
        });
    }
    Ok(())
}

impl RegistryConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a prefix is invalid, the two prefixes collide, a
    /// duration is zero, or reconciliation would not outpace entry expiry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_prefix(&self.key_prefix)?;
        validate_prefix(&self.lock_prefix)?;
        // Lock keys must never match a session scan pattern.
        let nested = |outer: &str, inner: &str| inner.starts_with(&format!("{outer}:"));
        if self.key_prefix == self.lock_prefix
            || nested(&self.key_prefix, &self.lock_prefix)
            || nested(&self.lock_prefix, &self.key_prefix)
        {
            return Err(ConfigError::InvalidPrefix(self.lock_prefix.clone()));
        }

        non_zero("entry_ttl", self.entry_ttl)?;
        non_zero("reconcile_interval", self.reconcile_interval)?;
        non_zero("cache_timeout", self.cache_timeout)?;
        non_zero("lock_ttl", self.lock_ttl)?;
        non_zero("lock_poll_interval", self.lock_poll_interval)?;

        if self.reconcile_interval >= self.entry_ttl {
            return Err(ConfigError::InvalidDuration {
                name: "reconcile_interval",
                reason: "must be shorter than entry_ttl",
            });
        }

        Ok(())
    }
}
