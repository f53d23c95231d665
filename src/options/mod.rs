//! Live option and pricing sync.
//!
//! Mutable gateway options (including the per-model cost ratio table) live
//! in the `options` table and are reloaded into a process-wide snapshot on
//! a timer. Like the ability cache, the snapshot is replaced wholesale:
//! readers hold a complete prior or current snapshot, never a partial one.
//! A failed reload keeps the previous snapshot in force.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::db::Database;
use crate::error::AppError;

/// Option key prefix for per-model cost ratios, e.g. `model_ratio.m-large`.
const MODEL_RATIO_PREFIX: &str = "model_ratio.";

/// Option key holding the completion-unit multiplier.
const COMPLETION_RATIO_KEY: &str = "completion_ratio";

const DEFAULT_COMPLETION_RATIO: f64 = 1.0;

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Key/value option persistence.
#[derive(Clone)]
pub struct OptionsStore {
    db: Database,
}

impl OptionsStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), AppError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO options (key, value) VALUES (?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET value = ?2",
                rusqlite::params![key, value],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let value = self.db.with_conn(|conn| {
            match conn.query_row(
                "SELECT value FROM options WHERE key = ?1",
                rusqlite::params![key],
                |row| row.get(0),
            ) {
                Ok(v) => Ok(Some(v)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })?;
        Ok(value)
    }

    pub fn load_all(&self) -> Result<HashMap<String, String>, AppError> {
        let options = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM options")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<Result<HashMap<String, String>, _>>()
        })?;
        Ok(options)
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// A complete, immutable view of the option table.
#[derive(Debug, Default)]
pub struct OptionSnapshot {
    version: u64,
    options: HashMap<String, String>,
    model_ratios: HashMap<String, f64>,
    completion_ratio: f64,
}

impl OptionSnapshot {
    fn parse(version: u64, options: HashMap<String, String>) -> Self {
        let mut model_ratios = HashMap::new();
        for (key, value) in &options {
            if let Some(model) = key.strip_prefix(MODEL_RATIO_PREFIX) {
                match value.parse::<f64>() {
                    Ok(ratio) => {
                        model_ratios.insert(model.to_string(), ratio);
                    }
                    Err(_) => warn!(key = %key, value = %value, "Unparseable model ratio, skipping"),
                }
            }
        }
        // A JSON map under `model_ratios` is also accepted and wins over
        // individual keys.
        if let Some(raw) = options.get("model_ratios") {
            match serde_json::from_str::<HashMap<String, f64>>(raw) {
                Ok(map) => model_ratios.extend(map),
                Err(e) => warn!(error = %e, "Unparseable model_ratios blob, skipping"),
            }
        }

        let completion_ratio = options
            .get(COMPLETION_RATIO_KEY)
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_COMPLETION_RATIO);

        Self {
            version,
            options,
            model_ratios,
            completion_ratio,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn model_ratio(&self, model: &str) -> Option<f64> {
        self.model_ratios.get(model).copied()
    }

    pub fn completion_ratio(&self) -> f64 {
        self.completion_ratio
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Process-wide option snapshot with atomic replacement on sync.
pub struct OptionRegistry {
    store: OptionsStore,
    snapshot: RwLock<Arc<OptionSnapshot>>,
    version: AtomicU64,
}

impl OptionRegistry {
    pub fn new(store: OptionsStore) -> Self {
        Self {
            store,
            snapshot: RwLock::new(Arc::new(OptionSnapshot::default())),
            version: AtomicU64::new(0),
        }
    }

    /// The current snapshot (cheap Arc clone).
    pub fn current(&self) -> Arc<OptionSnapshot> {
        Arc::clone(&self.snapshot.read().expect("options lock poisoned"))
    }

    /// Reload the full option table and swap the snapshot in atomically.
    pub fn sync(&self) -> Result<u64, AppError> {
        let options = self.store.load_all()?;
        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        let next = Arc::new(OptionSnapshot::parse(version, options));
        *self.snapshot.write().expect("options lock poisoned") = next;
        debug!(version, "Option snapshot reloaded");
        Ok(version)
    }

    /// Billing cost for one request: ratio is USD per 1M prompt units, with
    /// completion units weighted by the completion ratio. Unknown models
    /// cost 0.0 and log a warning, matching the routing collaborator's
    /// "unpriced is free" stance.
    pub fn cost_for(&self, model: &str, prompt_units: u32, completion_units: u32) -> f64 {
        let snapshot = self.current();
        let Some(ratio) = snapshot.model_ratio(model) else {
            warn!(model = %model, "No cost ratio for model, charging 0.0");
            return 0.0;
        };
        let weighted =
            f64::from(prompt_units) + f64::from(completion_units) * snapshot.completion_ratio();
        ratio * weighted / 1_000_000.0
    }

    /// Periodic reload loop. A failed reload keeps the prior snapshot.
    pub async fn run(self: Arc<Self>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; startup already synced.
        interval.tick().await;

        loop {
            interval.tick().await;
            if let Err(e) = self.sync() {
                error!(error = %e, "Option sync failed, keeping last snapshot");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
