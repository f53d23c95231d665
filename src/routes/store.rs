use rusqlite::{Row, params};

use crate::db::Database;
use crate::error::AppError;
use crate::routes::{Route, RouteStatus, join_csv, split_csv};

/// A persisted ability row: one (group, model) pair a route claims to serve.
#[derive(Debug, Clone, PartialEq)]
pub struct AbilityRow {
    pub group: String,
    pub model: String,
    pub route_id: String,
    pub priority: i64,
    pub weight: u32,
    pub enabled: bool,
}

/// Route persistence against the SQLite store.
///
/// The ability table is written here, always in the same transaction as the
/// route change that caused it, so the projection only drifts through
/// out-of-band deletions (which `repair_abilities` reconciles).
#[derive(Clone)]
pub struct RouteStore {
    pub(crate) db: Database,
}

impl RouteStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a route and derive its ability rows.
    pub fn insert(&self, route: &Route) -> Result<(), AppError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO routes (id, name, kind, endpoint, api_key, groups, models, \
                 priority, weight, status, balance, consecutive_failures, last_checked_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    route.id,
                    route.name,
                    route.kind,
                    route.endpoint,
                    route.api_key,
                    join_csv(&route.groups),
                    join_csv(&route.models),
                    route.priority,
                    route.weight,
                    route.status.to_string(),
                    route.balance,
                    route.consecutive_failures,
                    route.last_checked_at,
                ],
            )?;
            insert_abilities(&tx, route)?;
            tx.commit()?;
            Ok(())
        })?;

        tracing::info!(route = %route.name, models = route.models.len(), "Route inserted");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Route>, AppError> {
        let result = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_ROUTE} WHERE id = ?1"))?;
            match stmt.query_row(params![id], row_to_route) {
                Ok(r) => Ok(Some(r)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })?;
        Ok(result)
    }

    pub fn list_all(&self) -> Result<Vec<Route>, AppError> {
        let routes = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_ROUTE} ORDER BY priority, name"))?;
            let rows = stmt.query_map([], row_to_route)?;
            rows.collect::<Result<Vec<_>, _>>()
        })?;
        Ok(routes)
    }

    pub fn list_abilities(&self) -> Result<Vec<AbilityRow>, AppError> {
        let abilities = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT group_name, model, route_id, priority, weight, enabled \
                 FROM abilities ORDER BY group_name, model, priority",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(AbilityRow {
                    group: row.get(0)?,
                    model: row.get(1)?,
                    route_id: row.get(2)?,
                    priority: row.get(3)?,
                    weight: row.get(4)?,
                    enabled: row.get::<_, i64>(5)? != 0,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()
        })?;
        Ok(abilities)
    }

    /// Update a route's status, mirroring the enabled flag onto its ability
    /// rows in the same transaction.
    pub fn update_status(&self, id: &str, status: RouteStatus) -> Result<(), AppError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "UPDATE routes SET status = ?1 WHERE id = ?2",
                params![status.to_string(), id],
            )?;
            tx.execute(
                "UPDATE abilities SET enabled = ?1 WHERE route_id = ?2",
                params![(status == RouteStatus::Enabled) as i64, id],
            )?;
            tx.commit()?;
            Ok(())
        })?;
        Ok(())
    }

    /// Atomically claim a route for an in-flight health probe. Returns false
    /// when the route is already being probed (or no longer exists).
    pub fn try_claim_for_testing(&self, id: &str) -> Result<bool, AppError> {
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE routes SET status = 'testing' WHERE id = ?1 AND status != 'testing'",
                params![id],
            )
        })?;
        Ok(changed > 0)
    }

    /// Record the outcome of a health probe: new status, failure counter,
    /// and check timestamp.
    pub fn record_health_check(
        &self,
        id: &str,
        status: RouteStatus,
        consecutive_failures: u32,
    ) -> Result<(), AppError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "UPDATE routes SET status = ?1, consecutive_failures = ?2, \
                 last_checked_at = datetime('now') WHERE id = ?3",
                params![status.to_string(), consecutive_failures, id],
            )?;
            tx.execute(
                "UPDATE abilities SET enabled = ?1 WHERE route_id = ?2",
                params![(status == RouteStatus::Enabled) as i64, id],
            )?;
            tx.commit()?;
            Ok(())
        })?;
        Ok(())
    }

    pub fn update_balance(&self, id: &str, balance: f64) -> Result<(), AppError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE routes SET balance = ?1 WHERE id = ?2",
                params![balance, id],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// Recover routes left in the transient `testing` status by a previous
    /// crash mid-probe; the next probe decides their real state. Returns the
    /// number reset.
    pub fn reset_testing_routes(&self) -> Result<usize, AppError> {
        let reset = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE routes SET status = 'enabled' WHERE status = 'testing'",
                [],
            )
        })?;
        if reset > 0 {
            tracing::warn!(reset, "Reset routes stuck in testing status");
        }
        Ok(reset)
    }

    /// Delete a route and its ability rows. Orphans only ever arise from
    /// out-of-band writes or partial crashes, never from this path.
    pub fn delete(&self, id: &str) -> Result<(), AppError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute("DELETE FROM routes WHERE id = ?1", params![id])?;
            tx.execute("DELETE FROM abilities WHERE route_id = ?1", params![id])?;
            tx.commit()?;
            Ok(())
        })?;
        Ok(())
    }

    /// Reconcile the ability table against the route set: drop rows whose
    /// route no longer exists and re-derive rows a route should have but
    /// doesn't. Returns (removed, added).
    pub fn repair_abilities(&self) -> Result<(usize, usize), AppError> {
        let (removed, added) = self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;

            let removed = tx.execute(
                "DELETE FROM abilities WHERE route_id NOT IN (SELECT id FROM routes)",
                [],
            )?;

            let mut added = 0usize;
            {
                let mut stmt = tx.prepare(SELECT_ROUTE)?;
                let routes = stmt
                    .query_map([], row_to_route)?
                    .collect::<Result<Vec<_>, _>>()?;
                let mut insert = tx.prepare(
                    "INSERT OR IGNORE INTO abilities \
                     (group_name, model, route_id, priority, weight, enabled) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for route in &routes {
                    let enabled = (route.status == RouteStatus::Enabled) as i64;
                    for group in &route.groups {
                        for model in &route.models {
                            added += insert.execute(params![
                                group,
                                model,
                                route.id,
                                route.priority,
                                route.weight,
                                enabled,
                            ])?;
                        }
                    }
                }
            }

            tx.commit()?;
            Ok((removed, added))
        })?;

        tracing::info!(removed, added, "Ability table repaired");
        Ok((removed, added))
    }
}

const SELECT_ROUTE: &str = "SELECT id, name, kind, endpoint, api_key, groups, models, \
     priority, weight, status, balance, consecutive_failures, last_checked_at FROM routes";

fn row_to_route(row: &Row<'_>) -> Result<Route, rusqlite::Error> {
    let groups: String = row.get(5)?;
    let models: String = row.get(6)?;
    let status: String = row.get(9)?;
    Ok(Route {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: row.get(2)?,
        endpoint: row.get(3)?,
        api_key: row.get(4)?,
        groups: split_csv(&groups),
        models: split_csv(&models),
        priority: row.get(7)?,
        weight: row.get(8)?,
        status: status.parse().unwrap_or(RouteStatus::Disabled),
        balance: row.get(10)?,
        consecutive_failures: row.get(11)?,
        last_checked_at: row.get(12)?,
    })
}

fn insert_abilities(
    tx: &rusqlite::Transaction<'_>,
    route: &Route,
) -> Result<(), rusqlite::Error> {
    let mut stmt = tx.prepare_cached(
        "INSERT OR REPLACE INTO abilities \
         (group_name, model, route_id, priority, weight, enabled) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    let enabled = (route.status == RouteStatus::Enabled) as i64;
    for group in &route.groups {
        for model in &route.models {
            stmt.execute(params![group, model, route.id, route.priority, route.weight, enabled])?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
