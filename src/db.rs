use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Thread-safe database handle wrapping a SQLite connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database at the given path with WAL mode.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for concurrent reads
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Execute a closure with access to the database connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, rusqlite::Error>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self.conn.lock().expect("database mutex poisoned");
        f(&conn)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })?;
        Ok(())
    }
}

// No foreign key from abilities to routes: ability rows are a maintained
// projection and may drift (a deleted route can leave orphans behind).
// Orphans fail the cache rebuild and are reconciled by repair_abilities().
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS routes (
    id                      TEXT PRIMARY KEY,
    name                    TEXT NOT NULL UNIQUE,
    kind                    TEXT NOT NULL DEFAULT 'openai',
    endpoint                TEXT NOT NULL,
    api_key                 TEXT NOT NULL DEFAULT '',
    groups                  TEXT NOT NULL DEFAULT 'default',
    models                  TEXT NOT NULL DEFAULT '',
    priority                INTEGER NOT NULL DEFAULT 0,
    weight                  INTEGER NOT NULL DEFAULT 1,
    status                  TEXT NOT NULL DEFAULT 'enabled'
                            CHECK (status IN ('enabled', 'disabled', 'testing')),
    balance                 REAL NOT NULL DEFAULT 0.0,
    consecutive_failures    INTEGER NOT NULL DEFAULT 0,
    last_checked_at         TEXT,
    created_at              TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS abilities (
    group_name  TEXT NOT NULL,
    model       TEXT NOT NULL,
    route_id    TEXT NOT NULL,
    priority    INTEGER NOT NULL DEFAULT 0,
    weight      INTEGER NOT NULL DEFAULT 1,
    enabled     INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (group_name, model, route_id)
);
CREATE INDEX IF NOT EXISTS idx_abilities_route ON abilities(route_id);

CREATE TABLE IF NOT EXISTS usage_log (
    id                  TEXT PRIMARY KEY,
    route_id            TEXT NOT NULL,
    requester_id        TEXT NOT NULL,
    model               TEXT NOT NULL,
    prompt_units        INTEGER NOT NULL DEFAULT 0,
    completion_units    INTEGER NOT NULL DEFAULT 0,
    cost                REAL NOT NULL DEFAULT 0.0,
    created_at          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_usage_log_route ON usage_log(route_id);
CREATE INDEX IF NOT EXISTS idx_usage_log_created ON usage_log(created_at);

CREATE TABLE IF NOT EXISTS async_jobs (
    id              TEXT PRIMARY KEY,
    route_id        TEXT NOT NULL,
    handle          TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'submitted'
                    CHECK (status IN ('submitted', 'in_progress', 'succeeded', 'failed', 'expired')),
    payload         TEXT,
    poll_count      INTEGER NOT NULL DEFAULT 0,
    submitted_at    TEXT NOT NULL DEFAULT (datetime('now')),
    last_polled_at  TEXT
);
CREATE INDEX IF NOT EXISTS idx_async_jobs_status ON async_jobs(status);
CREATE INDEX IF NOT EXISTS idx_async_jobs_route ON async_jobs(route_id);

CREATE TABLE IF NOT EXISTS options (
    key     TEXT PRIMARY KEY,
    value   TEXT NOT NULL
);
"#;
