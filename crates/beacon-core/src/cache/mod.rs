//! Key/value cache providers.
//!
//! The registry and the distributed lock only need four operations from the
//! shared store: `get`, `set` with an optional TTL, `remove`, and a glob
//! `scan`. Two providers ship with the crate:
//!
//! - [`MemoryCache`] - process-local, for single-instance deployments and tests
//! - `RedisCache` - shared across instances (requires the `redis` feature)
//!
//! Providers must return `Ok(None)` / `Ok(false)` for ordinary misses and
//! reserve errors for connectivity problems.

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::MemoryCache;
#[cfg(feature = "redis")]
pub use self::redis::RedisCache;

use async_trait::async_trait;
use glob::Pattern;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Cache errors.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backing store could not be reached.
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    /// The operation did not complete in time.
    #[error("Cache operation timed out after {0:?}")]
    Timeout(Duration),

    /// The backing store rejected the operation.
    #[error("Cache backend error: {0}")]
    Backend(String),
}

/// A key/value store with TTL and prefix scan.
#[async_trait]
pub trait CacheProvider: Send + Sync {
    /// Read a value. Missing or expired keys yield `None`.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Write a value, replacing any previous one.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Write a value only if the key is absent or expired.
    ///
    /// Returns `true` if this call stored the value. The check and the write
    /// are a single atomic step.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError>;

    /// Delete a key. Returns `true` if it existed.
    async fn remove(&self, key: &str) -> Result<bool, CacheError>;

    /// List live keys matching a glob pattern (`*` and `?`).
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError>;

    /// Provider name, for logging.
    fn name(&self) -> &'static str;
}

/// Run a cache call under a deadline, mapping expiry to [`CacheError::Timeout`].
///
/// # Errors
///
/// Returns the call's own error, or `Timeout` if it did not finish in time.
pub async fn bounded<T, F>(timeout: Duration, call: F) -> Result<T, CacheError>
where
    F: Future<Output = Result<T, CacheError>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| CacheError::Timeout(timeout))?
}

/// Compile a scan pattern.
///
/// # Errors
///
/// Returns [`CacheError::Backend`] if the pattern is not a valid glob.
pub fn compile_pattern(pattern: &str) -> Result<Pattern, CacheError> {
    Pattern::new(pattern)
        .map_err(|e| CacheError::Backend(format!("bad scan pattern {pattern:?}: {e}")))
}

/// The literal part of a glob pattern, up to its first metacharacter.
#[must_use]
pub fn literal_prefix(pattern: &str) -> &str {
    pattern
        .find(['*', '?', '['])
        .map_or(pattern, |at| &pattern[..at])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, key: &str) -> bool {
        compile_pattern(pattern).unwrap().matches(key)
    }

    #[test]
    fn test_scan_patterns() {
        assert!(matches("p:u1:*", "p:u1:c1"));
        assert!(matches("p:*:c1", "p:u1:c1"));
        assert!(!matches("p:u1:*", "p:u10"));
        assert!(!matches("p:u1:*", "p:u2:c1"));
        assert!(matches("p:u?:c1", "p:u1:c1"));
        assert!(!matches("p:*:c1", "p:u1:c10"));
        assert!(compile_pattern("p:[").is_err());
    }

    #[test]
    fn test_literal_prefix() {
        assert_eq!(literal_prefix("p:u1:*"), "p:u1:");
        assert_eq!(literal_prefix("p:*:c1"), "p:");
        assert_eq!(literal_prefix("p:u?"), "p:u");
        assert_eq!(literal_prefix("exact"), "exact");
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let result: Result<(), CacheError> = bounded(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(CacheError::Timeout(_))));
    }
}
