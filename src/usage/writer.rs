use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rusqlite::params;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::db::Database;
use crate::error::AppError;
use crate::usage::UsageEvent;

/// Buffers usage events in memory and batch-writes them to the `usage_log`
/// table in a single transaction per flush.
///
/// `enqueue` never touches storage; it appends under a short-lived mutex and
/// nudges the background flusher once the batch threshold is reached. A
/// failed flush re-buffers the drained events at the front of the queue, so
/// billing data is delayed, never lost.
pub struct UsageBatchWriter {
    db: Database,
    buffer: Mutex<Vec<UsageEvent>>,
    batch_size: usize,
    notify: Notify,
    flushes: AtomicU64,
}

impl UsageBatchWriter {
    pub fn new(db: Database, batch_size: usize) -> Self {
        Self {
            db,
            buffer: Mutex::new(Vec::new()),
            batch_size: batch_size.max(1),
            notify: Notify::new(),
            flushes: AtomicU64::new(0),
        }
    }

    /// Append an event to the buffer. Returns immediately; storage I/O
    /// happens on the flusher task.
    pub fn enqueue(&self, event: UsageEvent) {
        let should_flush = {
            let mut buffer = self.buffer.lock().expect("usage buffer poisoned");
            buffer.push(event);
            buffer.len() >= self.batch_size
        };
        if should_flush {
            self.notify.notify_one();
        }
    }

    /// Number of events currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.lock().expect("usage buffer poisoned").len()
    }

    /// Number of successful flushes so far.
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Drain up to one batch and write it. Returns the number of events
    /// written (0 when the buffer was empty). On failure the drained events
    /// go back to the front of the buffer and the error is returned.
    pub fn flush(&self) -> Result<usize, AppError> {
        let batch: Vec<UsageEvent> = {
            let mut buffer = self.buffer.lock().expect("usage buffer poisoned");
            let n = buffer.len().min(self.batch_size);
            buffer.drain(..n).collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        match write_batch(&self.db, &batch) {
            Ok(()) => {
                let count = batch.len();
                self.flushes.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(count, "Flushed usage batch");
                Ok(count)
            }
            Err(e) => {
                tracing::error!(count = batch.len(), error = %e, "Usage flush failed, re-buffering");
                let mut buffer = self.buffer.lock().expect("usage buffer poisoned");
                buffer.splice(0..0, batch);
                Err(e)
            }
        }
    }

    /// Drain the whole buffer in batch-sized transactions. Stops at the
    /// first failure (events stay buffered). Returns the total written.
    pub fn flush_all(&self) -> Result<usize, AppError> {
        let mut total = 0;
        loop {
            let written = self.flush()?;
            total += written;
            if written < self.batch_size {
                return Ok(total);
            }
        }
    }

    /// Background flush loop: drains on the size-threshold nudge, on the
    /// timer, and once more on shutdown.
    pub async fn run(&self, flush_interval: Duration, shutdown: &Notify) {
        let mut interval = tokio::time::interval(flush_interval);
        // Don't pile up ticks while we're busy flushing.
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; nothing is buffered yet.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = self.notify.notified() => {
                    while self.buffered() >= self.batch_size {
                        if self.flush().is_err() {
                            break;
                        }
                    }
                }
                _ = interval.tick() => {
                    if self.buffered() > 0 {
                        let _ = self.flush_all();
                    }
                }
                _ = shutdown.notified() => {
                    match self.flush_all() {
                        Ok(count) => tracing::info!(count, "Usage writer shutting down"),
                        Err(e) => {
                            tracing::error!(error = %e, "Final usage flush failed, events lost at exit")
                        }
                    }
                    break;
                }
            }
        }
    }
}

/// Write a batch of usage events inside a single transaction.
fn write_batch(db: &Database, events: &[UsageEvent]) -> Result<(), AppError> {
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO usage_log (id, route_id, requester_id, model, \
                 prompt_units, completion_units, cost, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for event in events {
                stmt.execute(params![
                    Uuid::new_v4().to_string(),
                    event.route_id,
                    event.requester_id,
                    event.model,
                    event.prompt_units,
                    event.completion_units,
                    event.cost,
                    event.created_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    })?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn event(cost: f64) -> UsageEvent {
        UsageEvent::new("r-1", "u-1", "m-1", cost, 100, 50)
    }

    fn stored_count(db: &Database) -> i64 {
        db.with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM usage_log", [], |row| row.get(0)))
            .unwrap()
    }

    #[test]
    fn test_flush_empty_is_noop() {
        let writer = UsageBatchWriter::new(test_db(), 10);
        assert_eq!(writer.flush().unwrap(), 0);
        assert_eq!(writer.flushes(), 0);
    }

    #[test]
    fn test_flush_writes_batch() {
        let db = test_db();
        let writer = UsageBatchWriter::new(db.clone(), 10);
        for _ in 0..3 {
            writer.enqueue(event(0.5));
        }

        assert_eq!(writer.flush().unwrap(), 3);
        assert_eq!(stored_count(&db), 3);
        assert_eq!(writer.buffered(), 0);
        assert_eq!(writer.flushes(), 1);
    }

    #[test]
    fn test_flush_drains_at_most_one_batch() {
        let db = test_db();
        let writer = UsageBatchWriter::new(db.clone(), 100);
        for _ in 0..150 {
            writer.enqueue(event(0.1));
        }

        assert_eq!(writer.flush().unwrap(), 100);
        assert_eq!(stored_count(&db), 100);
        assert_eq!(writer.buffered(), 50);
    }

    #[test]
    fn test_flush_failure_rebuffers_in_order() {
        let db = test_db();
        let writer = UsageBatchWriter::new(db.clone(), 10);
        writer.enqueue(event(1.0));
        writer.enqueue(event(2.0));

        // Sabotage the table so the write fails.
        db.with_conn(|conn| {
            conn.execute("ALTER TABLE usage_log RENAME TO usage_log_hidden", [])?;
            Ok(())
        })
        .unwrap();
        assert!(writer.flush().is_err());
        assert_eq!(writer.buffered(), 2);
        assert_eq!(writer.flushes(), 0);

        // Restore the table; the same events land exactly once.
        db.with_conn(|conn| {
            conn.execute("ALTER TABLE usage_log_hidden RENAME TO usage_log", [])?;
            Ok(())
        })
        .unwrap();
        assert_eq!(writer.flush().unwrap(), 2);
        assert_eq!(stored_count(&db), 2);
        assert_eq!(writer.buffered(), 0);

        let costs: Vec<f64> = db
            .with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT cost FROM usage_log ORDER BY rowid")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect()
            })
            .unwrap();
        assert_eq!(costs, vec![1.0, 2.0]);
    }

    #[test]
    fn test_flush_all_drains_everything() {
        let db = test_db();
        let writer = UsageBatchWriter::new(db.clone(), 10);
        for _ in 0..25 {
            writer.enqueue(event(0.1));
        }

        assert_eq!(writer.flush_all().unwrap(), 25);
        assert_eq!(stored_count(&db), 25);
        assert_eq!(writer.flushes(), 3); // 10 + 10 + 5
    }

    #[tokio::test]
    async fn test_threshold_triggers_exactly_one_flush() {
        let db = test_db();
        let writer = Arc::new(UsageBatchWriter::new(db.clone(), 100));
        let shutdown = Arc::new(Notify::new());

        let flusher = {
            let writer = Arc::clone(&writer);
            let shutdown = Arc::clone(&shutdown);
            // Timer far in the future: only the threshold nudge can flush.
            tokio::spawn(async move { writer.run(Duration::from_secs(3600), &shutdown).await })
        };

        for _ in 0..150 {
            writer.enqueue(event(0.1));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(writer.flushes(), 1);
        assert_eq!(stored_count(&db), 100);
        assert_eq!(writer.buffered(), 50);

        shutdown.notify_one();
        flusher.await.unwrap();
    }

    #[tokio::test]
    async fn test_timer_flushes_partial_batch() {
        let db = test_db();
        let writer = Arc::new(UsageBatchWriter::new(db.clone(), 100));
        let shutdown = Arc::new(Notify::new());

        let flusher = {
            let writer = Arc::clone(&writer);
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move { writer.run(Duration::from_millis(50), &shutdown).await })
        };

        writer.enqueue(event(0.5));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(stored_count(&db), 1);
        assert_eq!(writer.buffered(), 0);

        shutdown.notify_one();
        flusher.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_performs_final_flush() {
        let db = test_db();
        let writer = Arc::new(UsageBatchWriter::new(db.clone(), 100));
        let shutdown = Arc::new(Notify::new());

        let flusher = {
            let writer = Arc::clone(&writer);
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move { writer.run(Duration::from_secs(3600), &shutdown).await })
        };
        tokio::task::yield_now().await;

        writer.enqueue(event(1.0));
        writer.enqueue(event(2.0));

        shutdown.notify_one();
        flusher.await.unwrap();

        assert_eq!(stored_count(&db), 2);
        assert_eq!(writer.buffered(), 0);
    }
}
