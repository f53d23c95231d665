use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::connector::RouteConnector;
use crate::error::AppError;
use crate::routes::{Route, RouteStatus, store::RouteStore};

/// Actively probes every route and transitions Enabled/Disabled status.
///
/// A route is claimed into the transient `Testing` status for the duration
/// of its probe so it is never probed twice concurrently. A single probe
/// failure does not disable a route; only the configured run of consecutive
/// failures does, which keeps transient provider errors from flapping the
/// routing table.
pub struct HealthProber {
    store: RouteStore,
    connector: Arc<dyn RouteConnector>,
    /// Nudges the ability cache after any status change.
    cache_notify: Arc<Notify>,
    timeout: Duration,
    failure_threshold: u32,
}

impl HealthProber {
    pub fn new(
        store: RouteStore,
        connector: Arc<dyn RouteConnector>,
        cache_notify: Arc<Notify>,
        timeout: Duration,
        failure_threshold: u32,
    ) -> Self {
        Self {
            store,
            connector,
            cache_notify,
            timeout,
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Probe every route once. Returns the number of status changes.
    /// Per-route errors are isolated; a failing store write for one route
    /// does not stop the sweep.
    pub async fn probe_all(&self) -> usize {
        let routes = match self.store.list_all() {
            Ok(routes) => routes,
            Err(e) => {
                error!(error = %e, "Health sweep could not list routes");
                return 0;
            }
        };

        let results =
            futures::future::join_all(routes.iter().map(|route| self.probe_route(route))).await;

        let mut changed = 0;
        for (route, result) in routes.iter().zip(results) {
            match result {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(e) => warn!(route = %route.name, error = %e, "Health probe bookkeeping failed"),
            }
        }

        if changed > 0 {
            debug!(changed, "Health sweep changed route status, nudging cache");
            self.cache_notify.notify_one();
        }
        changed
    }

    /// Probe one route. Returns whether its effective status changed.
    async fn probe_route(&self, route: &Route) -> Result<bool, AppError> {
        if !self.store.try_claim_for_testing(&route.id)? {
            // Another probe is in flight for this route.
            return Ok(false);
        }
        // A stale Testing snapshot (listed mid-probe) must never be written
        // back as the restored status.
        let prior = match route.status {
            RouteStatus::Testing => RouteStatus::Enabled,
            other => other,
        };

        match self.connector.probe(route, self.timeout).await {
            Ok(()) => {
                self.store
                    .record_health_check(&route.id, RouteStatus::Enabled, 0)?;
                if prior == RouteStatus::Disabled {
                    info!(route = %route.name, "Route recovered, re-enabled");
                    return Ok(true);
                }
                Ok(false)
            }
            Err(e) => {
                let failures = route.consecutive_failures.saturating_add(1);
                if failures >= self.failure_threshold {
                    self.store
                        .record_health_check(&route.id, RouteStatus::Disabled, failures)?;
                    if prior != RouteStatus::Disabled {
                        warn!(
                            route = %route.name,
                            failures,
                            error = %e,
                            "Route auto-disabled after consecutive probe failures"
                        );
                        return Ok(true);
                    }
                    Ok(false)
                } else {
                    // Below the threshold: keep the prior status, count the failure.
                    self.store.record_health_check(&route.id, prior, failures)?;
                    debug!(route = %route.name, failures, error = %e, "Probe failed");
                    Ok(false)
                }
            }
        }
    }

    /// Periodic probe loop.
    pub async fn run(self, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let changed = self.probe_all().await;
            debug!(changed, "Health sweep complete");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{BoxFuture, ConnectorError, JobStatusUpdate};
    use crate::db::Database;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Connector whose probe outcome can be toggled at runtime.
    struct ToggleConnector {
        healthy: AtomicBool,
        probes: AtomicUsize,
    }

    impl ToggleConnector {
        fn new(healthy: bool) -> Self {
            Self {
                healthy: AtomicBool::new(healthy),
                probes: AtomicUsize::new(0),
            }
        }
    }

    impl RouteConnector for ToggleConnector {
        fn probe<'a>(
            &'a self,
            _route: &'a Route,
            _timeout: Duration,
        ) -> BoxFuture<'a, Result<(), ConnectorError>> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            let healthy = self.healthy.load(Ordering::SeqCst);
            Box::pin(async move {
                if healthy {
                    Ok(())
                } else {
                    Err(ConnectorError::Other("probe refused".into()))
                }
            })
        }

        fn balance<'a>(
            &'a self,
            _route: &'a Route,
            _timeout: Duration,
        ) -> BoxFuture<'a, Result<f64, ConnectorError>> {
            Box::pin(async { Ok(0.0) })
        }

        fn job_statuses<'a>(
            &'a self,
            _route: &'a Route,
            _handles: Vec<String>,
            _timeout: Duration,
        ) -> BoxFuture<'a, Result<Vec<JobStatusUpdate>, ConnectorError>> {
            Box::pin(async { Ok(Vec::new()) })
        }
    }

    fn prober(store: RouteStore, connector: Arc<ToggleConnector>) -> HealthProber {
        HealthProber::new(
            store,
            connector,
            Arc::new(Notify::new()),
            Duration::from_secs(1),
            3,
        )
    }

    fn seeded_store() -> (RouteStore, Route) {
        let store = RouteStore::new(Database::open_in_memory().unwrap());
        let route = Route::new("r1", "https://api.example.com", &["g"], &["m"]);
        store.insert(&route).unwrap();
        (store, route)
    }

    #[tokio::test]
    async fn test_healthy_route_stays_enabled() {
        let (store, route) = seeded_store();
        let connector = Arc::new(ToggleConnector::new(true));
        let prober = prober(store.clone(), connector);

        let changed = prober.probe_all().await;
        assert_eq!(changed, 0);
        let loaded = store.get(&route.id).unwrap().unwrap();
        assert_eq!(loaded.status, RouteStatus::Enabled);
        assert_eq!(loaded.consecutive_failures, 0);
        assert!(loaded.last_checked_at.is_some());
    }

    #[tokio::test]
    async fn test_single_failure_does_not_disable() {
        let (store, route) = seeded_store();
        let connector = Arc::new(ToggleConnector::new(false));
        let prober = prober(store.clone(), connector);

        let changed = prober.probe_all().await;
        assert_eq!(changed, 0);
        let loaded = store.get(&route.id).unwrap().unwrap();
        assert_eq!(loaded.status, RouteStatus::Enabled);
        assert_eq!(loaded.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_threshold_failures_disable() {
        let (store, route) = seeded_store();
        let connector = Arc::new(ToggleConnector::new(false));
        let prober = prober(store.clone(), connector);

        for _ in 0..2 {
            assert_eq!(prober.probe_all().await, 0);
        }
        // Third consecutive failure crosses the threshold.
        let changed = prober.probe_all().await;
        assert_eq!(changed, 1);

        let loaded = store.get(&route.id).unwrap().unwrap();
        assert_eq!(loaded.status, RouteStatus::Disabled);
        assert_eq!(loaded.consecutive_failures, 3);
    }

    #[tokio::test]
    async fn test_success_reenables_and_resets_counter() {
        let (store, route) = seeded_store();
        let connector = Arc::new(ToggleConnector::new(false));
        let prober = prober(store.clone(), Arc::clone(&connector));

        for _ in 0..3 {
            prober.probe_all().await;
        }
        assert_eq!(
            store.get(&route.id).unwrap().unwrap().status,
            RouteStatus::Disabled
        );

        connector.healthy.store(true, Ordering::SeqCst);
        let changed = prober.probe_all().await;
        assert_eq!(changed, 1);

        let loaded = store.get(&route.id).unwrap().unwrap();
        assert_eq!(loaded.status, RouteStatus::Enabled);
        assert_eq!(loaded.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_status_change_nudges_cache() {
        let (store, _route) = seeded_store();
        let connector = Arc::new(ToggleConnector::new(false));
        let notify = Arc::new(Notify::new());
        let prober = HealthProber::new(
            store,
            connector,
            Arc::clone(&notify),
            Duration::from_secs(1),
            1,
        );

        let notified = {
            let notify = Arc::clone(&notify);
            tokio::spawn(async move { notify.notified().await })
        };
        tokio::task::yield_now().await;

        let changed = prober.probe_all().await;
        assert_eq!(changed, 1);
        tokio::time::timeout(Duration::from_secs(1), notified)
            .await
            .expect("cache was not nudged")
            .unwrap();
    }

    #[tokio::test]
    async fn test_disable_and_recover_flow_through_lookup() {
        use crate::routes::cache::AbilityCache;

        let store = RouteStore::new(Database::open_in_memory().unwrap());
        let mut r1 = Route::new("r1", "https://api.example.com", &["g"], &["m"]);
        r1.priority = 1;
        let mut r2 = Route::new("r2", "https://api.example.com", &["g"], &["m"]);
        r2.priority = 2;
        store.insert(&r1).unwrap();
        store.insert(&r2).unwrap();

        let cache = AbilityCache::new(store.clone());
        cache.rebuild().unwrap();
        let names: Vec<String> = cache.lookup("g", "m").into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["r1", "r2"]);

        // r1's provider starts refusing probes; r2 stays healthy.
        let connector = Arc::new(ToggleConnector::new(true));
        let failing = HealthProber::new(
            store.clone(),
            Arc::new(ToggleConnector::new(false)),
            cache.notify_handle(),
            Duration::from_secs(1),
            3,
        );
        for _ in 0..3 {
            let routes = store.list_all().unwrap();
            let r1_row = routes.iter().find(|r| r.name == "r1").unwrap();
            failing.probe_route(r1_row).await.unwrap();
        }
        cache.rebuild().unwrap();
        let names: Vec<String> = cache.lookup("g", "m").into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["r2"]);

        // r1 recovers on the next sweep and reappears after a rebuild.
        let recovering = prober(store.clone(), connector);
        recovering.probe_all().await;
        cache.rebuild().unwrap();
        let names: Vec<String> = cache.lookup("g", "m").into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["r1", "r2"]);
    }

    #[tokio::test]
    async fn test_testing_route_is_skipped() {
        let (store, route) = seeded_store();
        store.try_claim_for_testing(&route.id).unwrap();

        let connector = Arc::new(ToggleConnector::new(true));
        let prober = prober(store.clone(), Arc::clone(&connector));

        prober.probe_all().await;
        // The in-flight claim prevented a second probe.
        assert_eq!(connector.probes.load(Ordering::SeqCst), 0);
    }
}
