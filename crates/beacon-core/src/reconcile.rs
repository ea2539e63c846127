//! Background re-assertion of locally owned sessions.
//!
//! The shared cache may lose entries to eviction, restarts or partitions.
//! Only the owning process knows which of its connections are still alive,
//! so it periodically rewrites every local session with a fresh TTL.

use crate::config::ConfigError;
use crate::registry::ConnectionRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Entries rewritten.
    pub refreshed: usize,
    /// Sessions released before they could be rewritten.
    pub skipped: usize,
    /// Entries whose write failed.
    pub failed: usize,
}

/// Periodically re-asserts local sessions into the shared cache.
pub struct ReconciliationLoop {
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
}

impl ReconciliationLoop {
    /// Create a loop running at the registry's configured interval.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        let interval = registry.config().reconcile_interval;
        Self { registry, interval }
    }

    /// Create a loop with an explicit interval.
    ///
    /// # Errors
    ///
    /// Returns an error unless `0 < interval < entry_ttl`.
    pub fn with_interval(
        registry: Arc<ConnectionRegistry>,
        interval: Duration,
    ) -> Result<Self, ConfigError> {
        if interval.is_zero() || interval >= registry.config().entry_ttl {
            return Err(ConfigError::InvalidDuration {
                name: "reconcile_interval",
                reason: "must be greater than zero and shorter than entry_ttl",
            });
        }
        Ok(Self { registry, interval })
    }

    /// The interval between passes.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Rewrite every local session once.
    ///
    /// A failed write is logged and skipped; it never aborts the pass.
    pub async fn run_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for session in self.registry.presence().list().await {
            match self.registry.refresh(&session).await {
                Ok(true) => report.refreshed += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        user = %session.user_id,
                        connection = %session.connection_id,
                        error = %e,
                        "Failed to re-assert session"
                    );
                }
            }
        }

        debug!(
            refreshed = report.refreshed,
            skipped = report.skipped,
            failed = report.failed,
            "Reconciliation pass complete"
        );
        report
    }

    /// Run until `shutdown` is cancelled. The first pass runs immediately.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval = ?self.interval, "Starting reconciliation loop");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_once().await;
                }
            }
        }

        info!("Reconciliation loop stopped");
    }

    /// Spawn the loop onto the runtime.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::testing::SlowWrites;
    use crate::cache::{CacheProvider, MemoryCache};
    use crate::config::RegistryConfig;

    fn short_ttl() -> RegistryConfig {
        RegistryConfig {
            entry_ttl: Duration::from_millis(1000),
            reconcile_interval: Duration::from_millis(250),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_run_once_restores_evicted_entry() {
        let cache = Arc::new(MemoryCache::new());
        let registry =
            Arc::new(ConnectionRegistry::new("A", cache.clone(), short_ttl()).unwrap());
        registry.track("u1", "c1", "A").await.unwrap();
        registry.track("u1", "c2", "B").await.unwrap();

        // Simulate eviction by the cache tier
        cache.remove("beacon:session:u1:c1").await.unwrap();

        let report = ReconciliationLoop::new(registry.clone()).run_once().await;
        // Only the local session is re-asserted
        assert_eq!(
            report,
            ReconcileReport {
                refreshed: 1,
                skipped: 0,
                failed: 0
            }
        );
        assert_eq!(
            cache.get("beacon:session:u1:c1").await.unwrap().as_deref(),
            Some("A")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_untrack_during_pass_is_not_undone() {
        let cache = Arc::new(SlowWrites::new(Duration::from_millis(50)));
        let registry =
            Arc::new(ConnectionRegistry::new("A", cache.clone(), short_ttl()).unwrap());
        registry.track("u1", "c1", "A").await.unwrap();
        registry.track("u1", "c2", "A").await.unwrap();

        let pass = {
            let reconcile = ReconciliationLoop::new(registry.clone());
            tokio::spawn(async move { reconcile.run_once().await })
        };

        // Disconnect while the pass's first write is still in flight
        tokio::time::sleep(Duration::from_millis(10)).await;
        registry.untrack("u1", "c1").await;

        let report = pass.await.unwrap();
        assert_eq!(report.refreshed + report.skipped, 2);

        let sessions = registry.list_connections("u1").await.unwrap();
        let ids: Vec<_> = sessions.iter().map(|s| s.connection_id.as_str()).collect();
        assert_eq!(ids, vec!["c2"]);
        assert!(cache.inner.get("beacon:session:u1:c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_interval_must_be_shorter_than_ttl() {
        let registry = Arc::new(
            ConnectionRegistry::new("A", Arc::new(MemoryCache::new()), short_ttl()).unwrap(),
        );

        assert!(ReconciliationLoop::with_interval(registry.clone(), Duration::from_secs(1)).is_err());
        assert!(ReconciliationLoop::with_interval(registry.clone(), Duration::ZERO).is_err());
        let ok = ReconciliationLoop::with_interval(registry, Duration::from_millis(100)).unwrap();
        assert_eq!(ok.interval(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_stops_on_shutdown() {
        let registry = Arc::new(
            ConnectionRegistry::new("A", Arc::new(MemoryCache::new()), short_ttl()).unwrap(),
        );
        let shutdown = CancellationToken::new();
        let handle = ReconciliationLoop::new(registry).spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_millis(600)).await;
        shutdown.cancel();
        handle.await.unwrap();
    }
}
