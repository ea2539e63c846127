//! Token-based distributed lock built on a [`CacheProvider`].
//!
//! A lock entry maps a key to the random token of its holder and carries a
//! TTL, so a crashed holder cannot wedge the key. Acquisition polls: read the
//! holder; if there is none, claim the key with an atomic set-if-absent and
//! read it back. Only the acquirer that reads back its own token proceeds.
//! Release deletes the entry only while it still holds the caller's token.
//!
//! Nothing here returns an error. Cache failures and timeouts surface as "not
//! acquired" / "not released" so connection-handling paths can degrade.

use crate::cache::{bounded, CacheError, CacheProvider};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Default interval between acquisition attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Deadline used when `now + timeout` is not representable.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Proof of lock ownership, presented on release.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    /// Generate a fresh random token.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Get the token as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for LockToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Distributed mutual exclusion over a shared cache.
#[derive(Clone)]
pub struct DistributedLock {
    cache: Arc<dyn CacheProvider>,
    ttl: Duration,
    poll_interval: Duration,
    call_timeout: Duration,
}

impl DistributedLock {
    /// Create a lock manager whose entries expire after `ttl`.
    #[must_use]
    pub fn new(cache: Arc<dyn CacheProvider>, ttl: Duration) -> Self {
        Self {
            cache,
            ttl,
            poll_interval: DEFAULT_POLL_INTERVAL,
            call_timeout: Duration::from_secs(2),
        }
    }

    /// Set the interval between acquisition attempts.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the deadline applied to each cache call.
    #[must_use]
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Try to acquire `key`, polling until `timeout` elapses.
    ///
    /// Always makes at least one attempt, so a zero timeout means "try once".
    /// Returns `None` if the lock is held elsewhere or the cache is failing.
    pub async fn acquire(&self, key: &str, timeout: Duration) -> Option<LockToken> {
        let token = LockToken::generate();
        let now = Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or(now + FAR_FUTURE);

        loop {
            match self.try_acquire(key, &token).await {
                Ok(true) => {
                    debug!(key = %key, "Lock acquired");
                    return Some(token);
                }
                Ok(false) => trace!(key = %key, "Lock busy"),
                Err(e) => warn!(key = %key, error = %e, "Lock attempt failed"),
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(key = %key, ?timeout, "Lock not acquired before timeout");
                return None;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn try_acquire(&self, key: &str, token: &LockToken) -> Result<bool, CacheError> {
        match self.read(key).await? {
            // A previous attempt wrote our token but failed before confirming.
            Some(holder) if holder == token.as_str() => return Ok(true),
            Some(_) => return Ok(false),
            None => {}
        }

        let claimed = bounded(
            self.call_timeout,
            self.cache.set_if_absent(key, token.as_str(), Some(self.ttl)),
        )
        .await?;
        if !claimed {
            return Ok(false);
        }

        // The claim may have expired before we could confirm it.
        Ok(self.read(key).await?.as_deref() == Some(token.as_str()))
    }

    /// Release `key` if `token` still holds it.
    ///
    /// Returns `false` without touching the entry if another token holds the
    /// key, the key is free, or the cache is failing.
    pub async fn release(&self, key: &str, token: &LockToken) -> bool {
        match self.read(key).await {
            Ok(Some(holder)) if holder == token.as_str() => {
                match bounded(self.call_timeout, self.cache.remove(key)).await {
                    Ok(removed) => {
                        debug!(key = %key, "Lock released");
                        removed
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Lock release failed");
                        false
                    }
                }
            }
            Ok(_) => {
                debug!(key = %key, "Lock not held by this token");
                false
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Lock release failed");
                false
            }
        }
    }

    /// Run `f` while holding `key`, releasing afterwards.
    ///
    /// Returns `None` without running `f` if the lock was not acquired.
    pub async fn with_lock<F, Fut, T>(&self, key: &str, timeout: Duration, f: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let token = self.acquire(key, timeout).await?;
        let output = f().await;
        self.release(key, &token).await;
        Some(output)
    }

    async fn read(&self, key: &str) -> Result<Option<String>, CacheError> {
        bounded(self.call_timeout, self.cache.get(key)).await
    }
}
