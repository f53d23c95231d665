//! In-memory routing index over enabled routes.
//!
//! The cache maps (group, model) to an ordered set of route candidates and is
//! rebuilt wholesale from the store: a rebuild constructs a complete new
//! snapshot off-lock, then swaps the `Arc` in one write-lock acquisition.
//! Readers clone the current `Arc` and never observe a half-built index.
//!
//! The startup build is special-cased: a first failure triggers one repair
//! pass over the ability table followed by exactly one retry; a second
//! failure is fatal. Steady-state periodic rebuilds just log and wait for
//! the next tick, leaving the last good snapshot in service.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::AppError;
use crate::routes::{RouteStatus, store::RouteStore};

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

/// One route candidate for a (group, model) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteCandidate {
    pub route_id: String,
    pub name: String,
    pub priority: i64,
    pub weight: u32,
}

/// An immutable, fully-built routing index.
#[derive(Debug, Default)]
pub struct AbilitySnapshot {
    version: u64,
    built_at: Option<DateTime<Utc>>,
    index: HashMap<(String, String), Vec<RouteCandidate>>,
}

impl AbilitySnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn built_at(&self) -> Option<DateTime<Utc>> {
        self.built_at
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn candidates(&self, group: &str, model: &str) -> &[RouteCandidate] {
        self.index
            .get(&(group.to_string(), model.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

// ---------------------------------------------------------------------------
// AbilityCache
// ---------------------------------------------------------------------------

/// Process-wide routing index with atomic snapshot replacement.
pub struct AbilityCache {
    store: RouteStore,
    snapshot: RwLock<Arc<AbilitySnapshot>>,
    version: AtomicU64,
    /// Nudged by the probers on status changes so the resync loop wakes early.
    notify: Arc<Notify>,
}

impl AbilityCache {
    pub fn new(store: RouteStore) -> Self {
        Self {
            store,
            snapshot: RwLock::new(Arc::new(AbilitySnapshot::default())),
            version: AtomicU64::new(0),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Handle used to request an early resync.
    pub fn notify_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    /// The current snapshot (cheap Arc clone; never blocks on a rebuild).
    pub fn current(&self) -> Arc<AbilitySnapshot> {
        Arc::clone(&self.snapshot.read().expect("cache lock poisoned"))
    }

    /// Ordered candidates for (group, model): priority ascending, then name.
    /// Possibly empty; never stale mid-rebuild.
    pub fn lookup(&self, group: &str, model: &str) -> Vec<RouteCandidate> {
        self.current().candidates(group, model).to_vec()
    }

    /// Weighted-random pick within the best priority tier for (group, model).
    pub fn pick(&self, group: &str, model: &str) -> Option<RouteCandidate> {
        let snapshot = self.current();
        let candidates = snapshot.candidates(group, model);
        let best = candidates.first()?.priority;
        let tier: Vec<&RouteCandidate> =
            candidates.iter().take_while(|c| c.priority == best).collect();

        let total: u64 = tier.iter().map(|c| u64::from(c.weight.max(1))).sum();
        let mut point = rand::rng().random_range(0..total);
        for candidate in &tier {
            let w = u64::from(candidate.weight.max(1));
            if point < w {
                return Some((*candidate).clone());
            }
            point -= w;
        }
        None
    }

    /// Rebuild the index from the store and swap it in atomically.
    ///
    /// Fails without touching the served snapshot when the ability table is
    /// inconsistent (a row referencing a missing route).
    pub fn rebuild(&self) -> Result<u64, AppError> {
        let routes = self.store.list_all()?;
        let abilities = self.store.list_abilities()?;

        let by_id: HashMap<&str, &crate::routes::Route> =
            routes.iter().map(|r| (r.id.as_str(), r)).collect();

        let mut index: HashMap<(String, String), Vec<RouteCandidate>> = HashMap::new();
        for ability in &abilities {
            let route = by_id.get(ability.route_id.as_str()).ok_or_else(|| {
                AppError::OrphanedAbility {
                    group: ability.group.clone(),
                    model: ability.model.clone(),
                    route_id: ability.route_id.clone(),
                }
            })?;
            if !ability.enabled || route.status != RouteStatus::Enabled {
                continue;
            }
            index
                .entry((ability.group.clone(), ability.model.clone()))
                .or_default()
                .push(RouteCandidate {
                    route_id: route.id.clone(),
                    name: route.name.clone(),
                    priority: ability.priority,
                    weight: ability.weight,
                });
        }
        for candidates in index.values_mut() {
            candidates.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.name.cmp(&b.name)));
        }

        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        let next = Arc::new(AbilitySnapshot {
            version,
            built_at: Some(Utc::now()),
            index,
        });

        *self.snapshot.write().expect("cache lock poisoned") = next;
        debug!(version, routes = routes.len(), "Ability cache rebuilt");
        Ok(version)
    }

    /// Startup build with the repair-and-retry contract: on a first failure,
    /// run the ability repair pass and retry exactly once. A second failure
    /// is returned to the caller as fatal.
    pub fn build_with_repair(&self) -> Result<u64, AppError> {
        match self.rebuild() {
            Ok(version) => Ok(version),
            Err(first) => {
                warn!(error = %first, "Initial cache build failed, repairing ability table");
                let (removed, added) = self.store.repair_abilities()?;
                info!(removed, added, "Repair pass complete, retrying build");
                self.rebuild()
                    .map_err(|second| AppError::StartupBuild(second.to_string()))
            }
        }
    }

    /// Periodic resync loop. Rebuilds on every tick and whenever nudged;
    /// steady-state failures are logged and retried on the next tick.
    pub async fn run(self: Arc<Self>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; the startup path already built.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.notify.notified() => {}
            }
            if let Err(e) = self.rebuild() {
                error!(error = %e, "Periodic cache rebuild failed, keeping last snapshot");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
