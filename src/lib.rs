pub mod config;
pub mod connector;
pub mod db;
pub mod error;
pub mod jobs;
pub mod leadership;
pub mod options;
pub mod probe;
pub mod routes;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::connector::RouteConnector;
use crate::db::Database;
use crate::error::AppError;
use crate::jobs::reconciler::{BulkReconciler, ExpiryPolicy};
use crate::jobs::JobStore;
use crate::leadership::LeadershipProvider;
use crate::options::{OptionRegistry, OptionsStore};
use crate::probe::{BalanceProber, HealthProber};
use crate::routes::cache::{AbilityCache, RouteCandidate};
use crate::routes::store::RouteStore;
use crate::usage::{UsageBatchWriter, UsageEvent};

/// The orchestration core: the ability cache, the stores behind it, and the
/// background loops that keep them consistent.
///
/// The routing collaborator consumes `lookup`/`pick`, `enqueue_usage` and
/// `submit_async_job`; the bootstrap collaborator drives `rebuild_once` and
/// `start`.
#[derive(Clone)]
pub struct Orchestrator {
    pub config: Arc<Config>,
    pub db: Database,
    pub routes: RouteStore,
    pub jobs: JobStore,
    pub cache: Arc<AbilityCache>,
    pub usage: Arc<UsageBatchWriter>,
    pub options: Arc<OptionRegistry>,
    connector: Arc<dyn RouteConnector>,
    leadership: Arc<dyn LeadershipProvider>,
    shutdown: Arc<Notify>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        db: Database,
        connector: Arc<dyn RouteConnector>,
        leadership: Arc<dyn LeadershipProvider>,
    ) -> Self {
        let routes = RouteStore::new(db.clone());
        let jobs = JobStore::new(db.clone());
        let cache = Arc::new(AbilityCache::new(routes.clone()));
        let usage = Arc::new(UsageBatchWriter::new(db.clone(), config.usage.batch_size));
        let options = Arc::new(OptionRegistry::new(OptionsStore::new(db.clone())));

        Self {
            config,
            db,
            routes,
            jobs,
            cache,
            usage,
            options,
            connector,
            leadership,
            shutdown: Arc::new(Notify::new()),
        }
    }

    // -- surface consumed by the routing collaborator ------------------------

    /// Ordered route candidates for (group, model).
    pub fn lookup(&self, group: &str, model: &str) -> Vec<RouteCandidate> {
        self.cache.lookup(group, model)
    }

    /// Weighted pick within the best priority tier.
    pub fn pick(&self, group: &str, model: &str) -> Option<RouteCandidate> {
        self.cache.pick(group, model)
    }

    /// Hand a finished request's usage to the batch writer. Never blocks on
    /// storage.
    pub fn enqueue_usage(&self, event: UsageEvent) {
        self.usage.enqueue(event);
    }

    /// Record a job dispatched to an asynchronously-executing provider.
    /// Reconciliation is the bulk poller's job from here on.
    pub fn submit_async_job(&self, route_id: &str, handle: &str) -> Result<String, AppError> {
        self.jobs.submit(route_id, handle)
    }

    // -- surface consumed by the bootstrap collaborator ----------------------

    /// Startup build: recover stale probe claims, load the option snapshot,
    /// then build the ability cache under the repair-and-retry contract.
    /// An error from here means the process cannot route and must not serve.
    pub fn rebuild_once(&self) -> Result<(), AppError> {
        self.routes.reset_testing_routes()?;
        self.options.sync()?;
        let version = self.cache.build_with_repair()?;
        info!(version, "Initial ability cache built");
        Ok(())
    }

    /// Spawn every enabled background loop. Each loop owns its interval and
    /// runs for the process lifetime; only the usage writer observes the
    /// shutdown signal (for its final flush).
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        let sync_interval = self.config.sync_interval();

        handles.push(tokio::spawn(Arc::clone(&self.cache).run(sync_interval)));
        info!(secs = sync_interval.as_secs(), "Ability cache resync started");

        handles.push(tokio::spawn(Arc::clone(&self.options).run(sync_interval)));
        info!(secs = sync_interval.as_secs(), "Option sync started");

        {
            let writer = Arc::clone(&self.usage);
            let shutdown = Arc::clone(&self.shutdown);
            let interval = Duration::from_secs(self.config.usage.flush_interval_secs.max(1));
            handles.push(tokio::spawn(async move {
                writer.run(interval, &shutdown).await;
            }));
            info!(
                batch_size = self.config.usage.batch_size,
                secs = interval.as_secs(),
                "Usage batch writer started"
            );
        }

        if self.config.health.enabled {
            let prober = HealthProber::new(
                self.routes.clone(),
                Arc::clone(&self.connector),
                self.cache.notify_handle(),
                self.config.probe_timeout(),
                self.config.health.failure_threshold,
            );
            let interval = Duration::from_secs(self.config.health.frequency_secs.max(1));
            handles.push(tokio::spawn(prober.run(interval)));
            info!(secs = interval.as_secs(), "Health prober started");
        }

        {
            let prober = BalanceProber::new(
                self.routes.clone(),
                Arc::clone(&self.connector),
                self.config.balance_timeout(),
            );
            let interval = Duration::from_secs(self.config.balance.frequency_secs.max(1));
            handles.push(tokio::spawn(prober.run(interval)));
            info!(secs = interval.as_secs(), "Balance prober started");
        }

        if self.config.bulk.enabled {
            let reconciler = BulkReconciler::new(
                self.jobs.clone(),
                self.routes.clone(),
                Arc::clone(&self.connector),
                Arc::clone(&self.leadership),
                self.config.bulk_timeout(),
                ExpiryPolicy {
                    max_age_hours: self.config.bulk.max_job_age_hours,
                    max_poll_count: self.config.bulk.max_poll_count,
                },
            );
            let interval = Duration::from_secs(self.config.bulk.frequency_secs.max(1));
            handles.push(tokio::spawn(reconciler.run(interval)));
            info!(secs = interval.as_secs(), "Bulk job reconciler started");
        }

        handles
    }

    /// Signal shutdown and drain any usage events the writer task has not
    /// flushed yet. Safe to call alongside the writer's own final flush.
    pub fn stop(&self) -> Result<usize, AppError> {
        self.shutdown.notify_waiters();
        self.usage.flush_all()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
