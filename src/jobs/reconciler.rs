use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::connector::{JobOutcome, RouteConnector};
use crate::error::AppError;
use crate::jobs::{JobRecord, JobStatus, JobStore};
use crate::leadership::LeadershipProvider;
use crate::routes::store::RouteStore;

/// Job expiry policy: whichever ceiling is hit first wins.
#[derive(Debug, Clone, Copy)]
pub struct ExpiryPolicy {
    pub max_age_hours: u64,
    pub max_poll_count: u32,
}

/// What one reconciliation tick did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub skipped_not_leader: bool,
    pub expired: usize,
    pub polled: usize,
    pub settled: usize,
    pub failed_groups: usize,
}

/// Settles externally-executing jobs by bulk-querying their providers.
///
/// Leadership is re-evaluated at every tick so a handoff takes effect
/// within one interval; a non-leader tick performs zero provider calls.
/// Jobs are grouped by route so each provider is queried once per tick,
/// and one group's failure never aborts the others.
pub struct BulkReconciler {
    jobs: JobStore,
    routes: RouteStore,
    connector: Arc<dyn RouteConnector>,
    leadership: Arc<dyn LeadershipProvider>,
    timeout: Duration,
    expiry: ExpiryPolicy,
}

impl BulkReconciler {
    pub fn new(
        jobs: JobStore,
        routes: RouteStore,
        connector: Arc<dyn RouteConnector>,
        leadership: Arc<dyn LeadershipProvider>,
        timeout: Duration,
        expiry: ExpiryPolicy,
    ) -> Self {
        Self {
            jobs,
            routes,
            connector,
            leadership,
            timeout,
            expiry,
        }
    }

    /// One reconciliation pass.
    pub async fn tick(&self) -> Result<ReconcileOutcome, AppError> {
        if !self.leadership.is_leader() {
            return Ok(ReconcileOutcome {
                skipped_not_leader: true,
                ..ReconcileOutcome::default()
            });
        }

        let mut outcome = ReconcileOutcome::default();
        outcome.expired = self
            .jobs
            .expire_overdue(self.expiry.max_age_hours, self.expiry.max_poll_count)?;

        let pending = self.jobs.list_pending()?;
        if pending.is_empty() {
            return Ok(outcome);
        }

        let mut by_route: HashMap<String, Vec<JobRecord>> = HashMap::new();
        for job in pending {
            by_route.entry(job.route_id.clone()).or_default().push(job);
        }

        for (route_id, group) in by_route {
            match self.reconcile_group(&route_id, &group).await {
                Ok((polled, settled)) => {
                    outcome.polled += polled;
                    outcome.settled += settled;
                }
                Err(e) => {
                    // Retried next tick; poll counts already recorded stand.
                    warn!(route = %route_id, jobs = group.len(), error = %e, "Bulk status query failed");
                    outcome.failed_groups += 1;
                }
            }
        }

        Ok(outcome)
    }

    /// Query one route's provider for the whole group and apply the results.
    async fn reconcile_group(
        &self,
        route_id: &str,
        group: &[JobRecord],
    ) -> Result<(usize, usize), AppError> {
        let route = self
            .routes
            .get(route_id)?
            .ok_or_else(|| AppError::RouteNotFound(route_id.to_string()))?;

        let handles: Vec<String> = group.iter().map(|j| j.handle.clone()).collect();
        let updates = self
            .connector
            .job_statuses(&route, handles, self.timeout)
            .await?;

        let by_handle: HashMap<&str, &JobRecord> =
            group.iter().map(|j| (j.handle.as_str(), j)).collect();

        let mut polled = 0;
        let mut settled = 0;
        for update in &updates {
            let Some(job) = by_handle.get(update.handle.as_str()) else {
                debug!(handle = %update.handle, "Provider reported an unknown job handle");
                continue;
            };
            self.jobs.record_poll(&job.id)?;
            polled += 1;

            let status = match update.outcome {
                JobOutcome::InProgress => JobStatus::InProgress,
                JobOutcome::Succeeded => JobStatus::Succeeded,
                JobOutcome::Failed => JobStatus::Failed,
            };
            if self.jobs.apply_status(&job.id, status, update.payload.as_ref())? && status.is_terminal()
            {
                info!(job = %job.id, status = %status, "Async job settled");
                settled += 1;
            }
        }
        Ok((polled, settled))
    }

    /// Periodic reconciliation loop.
    pub async fn run(self, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match self.tick().await {
                Ok(outcome) if outcome.skipped_not_leader => {
                    debug!("Not leader, skipping job reconciliation");
                }
                Ok(outcome) => {
                    debug!(
                        expired = outcome.expired,
                        polled = outcome.polled,
                        settled = outcome.settled,
                        failed_groups = outcome.failed_groups,
                        "Job reconciliation tick complete"
                    );
                }
                Err(e) => error!(error = %e, "Job reconciliation tick failed"),
            }
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
    use crate::leadership::SharedFlag;
    use crate::routes::Route;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Connector with scripted per-handle outcomes and a query counter.
    struct ScriptedConnector {
        outcomes: Mutex<HashMap<String, JobOutcome>>,
        failing_routes: Vec<String>,
        queries: AtomicUsize,
    }

    impl ScriptedConnector {
        fn new() -> Self {
            Self {
                outcomes: Mutex::new(HashMap::new()),
                failing_routes: Vec::new(),
                queries: AtomicUsize::new(0),
            }
        }

        fn script(&self, handle: &str, outcome: JobOutcome) {
            self.outcomes
                .lock()
                .unwrap()
                .insert(handle.to_string(), outcome);
        }
    }

    impl RouteConnector for ScriptedConnector {
        fn probe<'a>(
            &'a self,
            _route: &'a Route,
            _timeout: Duration,
        ) -> BoxFuture<'a, Result<(), ConnectorError>> {
            Box::pin(async { Ok(()) })
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
            route: &'a Route,
            handles: Vec<String>,
            _timeout: Duration,
        ) -> BoxFuture<'a, Result<Vec<JobStatusUpdate>, ConnectorError>> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            let fail = self.failing_routes.contains(&route.name);
            let outcomes = self.outcomes.lock().unwrap().clone();
            Box::pin(async move {
                if fail {
                    return Err(ConnectorError::Other("status endpoint down".into()));
                }
                Ok(handles
                    .into_iter()
                    .filter_map(|handle| {
                        outcomes.get(&handle).map(|outcome| JobStatusUpdate {
                            handle,
                            outcome: *outcome,
                            payload: None,
                        })
                    })
                    .collect())
            })
        }
    }

    struct Fixture {
        jobs: JobStore,
        routes: RouteStore,
        connector: Arc<ScriptedConnector>,
        leadership: SharedFlag,
        reconciler: BulkReconciler,
    }

    fn fixture(leader: bool) -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let jobs = JobStore::new(db.clone());
        let routes = RouteStore::new(db);
        let connector = Arc::new(ScriptedConnector::new());
        let leadership = SharedFlag::new(leader);
        let reconciler = BulkReconciler::new(
            jobs.clone(),
            routes.clone(),
            Arc::clone(&connector) as Arc<dyn RouteConnector>,
            Arc::new(leadership.clone()),
            Duration::from_secs(1),
            ExpiryPolicy {
                max_age_hours: 24,
                max_poll_count: 48,
            },
        );
        Fixture {
            jobs,
            routes,
            connector,
            leadership,
            reconciler,
        }
    }

    fn seed_route(f: &Fixture, name: &str) -> Route {
        let route = Route::new(name, "https://api.example.com", &["g"], &["m"]);
        f.routes.insert(&route).unwrap();
        route
    }

    #[tokio::test]
    async fn test_not_leader_makes_zero_provider_calls() {
        let f = fixture(false);
        let route = seed_route(&f, "r1");
        f.jobs.submit(&route.id, "h-1").unwrap();

        for _ in 0..5 {
            let outcome = f.reconciler.tick().await.unwrap();
            assert!(outcome.skipped_not_leader);
        }
        assert_eq!(f.connector.queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_leadership_granted_resumes_next_tick() {
        let f = fixture(false);
        let route = seed_route(&f, "r1");
        f.jobs.submit(&route.id, "h-1").unwrap();
        f.connector.script("h-1", JobOutcome::InProgress);

        assert!(f.reconciler.tick().await.unwrap().skipped_not_leader);

        f.leadership.set(true);
        let outcome = f.reconciler.tick().await.unwrap();
        assert!(!outcome.skipped_not_leader);
        assert_eq!(outcome.polled, 1);
        assert_eq!(f.connector.queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_succeeded_job_settles_once_and_is_never_requeried() {
        let f = fixture(true);
        let route = seed_route(&f, "r1");
        let id = f.jobs.submit(&route.id, "h-1").unwrap();
        f.connector.script("h-1", JobOutcome::Succeeded);

        let outcome = f.reconciler.tick().await.unwrap();
        assert_eq!(outcome.settled, 1);
        assert_eq!(
            f.jobs.get(&id).unwrap().unwrap().status,
            JobStatus::Succeeded
        );
        assert_eq!(f.connector.queries.load(Ordering::SeqCst), 1);

        // Settled: nothing pending, so no further provider queries at all.
        let outcome = f.reconciler.tick().await.unwrap();
        assert_eq!(outcome.polled, 0);
        assert_eq!(f.connector.queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_in_progress_job_stays_pending() {
        let f = fixture(true);
        let route = seed_route(&f, "r1");
        let id = f.jobs.submit(&route.id, "h-1").unwrap();
        f.connector.script("h-1", JobOutcome::InProgress);

        f.reconciler.tick().await.unwrap();
        let job = f.jobs.get(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::InProgress);
        assert_eq!(job.poll_count, 1);

        f.reconciler.tick().await.unwrap();
        assert_eq!(f.jobs.get(&id).unwrap().unwrap().poll_count, 2);
    }

    #[tokio::test]
    async fn test_one_failing_group_does_not_abort_others() {
        let f = fixture(true);
        let good = seed_route(&f, "good");
        let bad = seed_route(&f, "bad");
        let good_id = f.jobs.submit(&good.id, "h-good").unwrap();
        f.jobs.submit(&bad.id, "h-bad").unwrap();
        f.connector.script("h-good", JobOutcome::Succeeded);

        // Make the bad route's bulk query fail.
        let mut connector = ScriptedConnector::new();
        connector.script("h-good", JobOutcome::Succeeded);
        connector.failing_routes = vec!["bad".into()];
        let reconciler = BulkReconciler::new(
            f.jobs.clone(),
            f.routes.clone(),
            Arc::new(connector),
            Arc::new(SharedFlag::new(true)),
            Duration::from_secs(1),
            ExpiryPolicy {
                max_age_hours: 24,
                max_poll_count: 48,
            },
        );

        let outcome = reconciler.tick().await.unwrap();
        assert_eq!(outcome.failed_groups, 1);
        assert_eq!(outcome.settled, 1);
        assert_eq!(
            f.jobs.get(&good_id).unwrap().unwrap().status,
            JobStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_overdue_jobs_expire_before_polling() {
        let f = fixture(true);
        let route = seed_route(&f, "r1");
        let id = f.jobs.submit(&route.id, "h-1").unwrap();
        for _ in 0..48 {
            f.jobs.record_poll(&id).unwrap();
        }

        let outcome = f.reconciler.tick().await.unwrap();
        assert_eq!(outcome.expired, 1);
        assert_eq!(outcome.polled, 0);
        assert_eq!(f.jobs.get(&id).unwrap().unwrap().status, JobStatus::Expired);
        // The expired job never reached the provider.
        assert_eq!(f.connector.queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_handle_in_response_is_ignored() {
        let f = fixture(true);
        let route = seed_route(&f, "r1");
        let id = f.jobs.submit(&route.id, "h-1").unwrap();
        f.connector.script("h-1", JobOutcome::InProgress);
        f.connector.script("h-ghost", JobOutcome::Succeeded);

        // The provider can only answer for handles we asked about; a ghost
        // entry in the scripted map is filtered by the request handles.
        let outcome = f.reconciler.tick().await.unwrap();
        assert_eq!(outcome.polled, 1);
        assert_eq!(
            f.jobs.get(&id).unwrap().unwrap().status,
            JobStatus::InProgress
        );
    }
}
