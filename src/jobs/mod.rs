//! Asynchronous provider jobs.
//!
//! Some providers execute generation requests asynchronously; the request
//! path records a job here and the bulk reconciler settles it later.
//! Terminal states are written once and never revisited.

pub mod reconciler;

use rusqlite::{Row, params};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::db::Database;
use crate::error::AppError;

pub use self::reconciler::BulkReconciler;

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Submitted,
    InProgress,
    Succeeded,
    Failed,
    Expired,
}

impl JobStatus {
    /// Terminal states are immutable once written.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Expired)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Submitted => write!(f, "submitted"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(Self::Submitted),
            "in_progress" => Ok(Self::InProgress),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("Unknown job status: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// JobRecord
// ---------------------------------------------------------------------------

/// Persisted state of one externally-executing job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub route_id: String,
    /// The provider-side job handle used for status queries.
    pub handle: String,
    pub status: JobStatus,
    pub payload: Option<serde_json::Value>,
    pub poll_count: u32,
    pub submitted_at: String,
    pub last_polled_at: Option<String>,
}

// ---------------------------------------------------------------------------
// JobStore
// ---------------------------------------------------------------------------

/// Job persistence against the SQLite store.
#[derive(Clone)]
pub struct JobStore {
    db: Database,
}

impl JobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record a newly dispatched job. Returns the generated job id.
    pub fn submit(&self, route_id: &str, handle: &str) -> Result<String, AppError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO async_jobs (id, route_id, handle, status) \
                 VALUES (?1, ?2, ?3, 'submitted')",
                params![id, route_id, handle],
            )?;
            Ok(())
        })?;
        tracing::debug!(job = %id, route = %route_id, "Async job recorded");
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Result<Option<JobRecord>, AppError> {
        let result = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_JOB} WHERE id = ?1"))?;
            match stmt.query_row(params![id], row_to_job) {
                Ok(job) => Ok(Some(job)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })?;
        Ok(result)
    }

    /// Jobs still awaiting a terminal status, oldest first.
    pub fn list_pending(&self) -> Result<Vec<JobRecord>, AppError> {
        let jobs = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_JOB} WHERE status IN ('submitted', 'in_progress') ORDER BY submitted_at"
            ))?;
            let rows = stmt.query_map([], row_to_job)?;
            rows.collect::<Result<Vec<_>, _>>()
        })?;
        Ok(jobs)
    }

    /// Count one poll attempt against a job.
    pub fn record_poll(&self, id: &str) -> Result<(), AppError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE async_jobs SET poll_count = poll_count + 1, \
                 last_polled_at = datetime('now') WHERE id = ?1",
                params![id],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// Apply a provider-reported status. Terminal rows are never overwritten;
    /// the guard makes re-applying a settled status a no-op.
    pub fn apply_status(
        &self,
        id: &str,
        status: JobStatus,
        payload: Option<&serde_json::Value>,
    ) -> Result<bool, AppError> {
        let payload_text = payload.map(serde_json::Value::to_string);
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE async_jobs SET status = ?1, payload = COALESCE(?2, payload) \
                 WHERE id = ?3 AND status IN ('submitted', 'in_progress')",
                params![status.to_string(), payload_text, id],
            )
        })?;
        Ok(changed > 0)
    }

    /// Force-expire pending jobs past the age or poll-count ceiling.
    /// Returns the number expired.
    pub fn expire_overdue(&self, max_age_hours: u64, max_poll_count: u32) -> Result<usize, AppError> {
        let expired = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE async_jobs SET status = 'expired' \
                 WHERE status IN ('submitted', 'in_progress') \
                 AND (submitted_at <= datetime('now', ?1) OR poll_count >= ?2)",
                params![format!("-{max_age_hours} hours"), max_poll_count],
            )
        })?;
        if expired > 0 {
            tracing::warn!(expired, "Force-expired overdue async jobs");
        }
        Ok(expired)
    }
}

const SELECT_JOB: &str = "SELECT id, route_id, handle, status, payload, poll_count, \
     submitted_at, last_polled_at FROM async_jobs";

fn row_to_job(row: &Row<'_>) -> Result<JobRecord, rusqlite::Error> {
    let status: String = row.get(3)?;
    let payload: Option<String> = row.get(4)?;
    Ok(JobRecord {
        id: row.get(0)?,
        route_id: row.get(1)?,
        handle: row.get(2)?,
        status: status.parse().unwrap_or(JobStatus::Failed),
        payload: payload.and_then(|p| serde_json::from_str(&p).ok()),
        poll_count: row.get(5)?,
        submitted_at: row.get(6)?,
        last_polled_at: row.get(7)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
