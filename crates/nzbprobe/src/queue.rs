//! Persistent verification queue backed by SQLite
//!
//! One row per known NZB path. A row means "we have seen this file"; a
//! processed row means "we have attempted verification", regardless of the
//! outcome. Timestamps are stored in UTC. All operations degrade on store
//! errors (returning `false`, empty or zero with a logged warning) so that a
//! flaky disk never takes the scanner down; only opening the store is
//! allowed to fail hard.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::warn;

use crate::error::Result;

/// Processed items are kept for this long before pruning.
pub const RETENTION: Duration = Duration::from_secs(30 * 24 * 3600);

/// One entry of the verification queue.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub file_path: String,
    pub added: DateTime<Utc>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub process_count: i64,
}

/// SQLite-backed queue of known manifest files.
pub struct VerifyQueue {
    pool: SqlitePool,
}

impl VerifyQueue {
    /// Open or create the queue database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());
        // One connection serialises every read-then-write flow.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue (
                file_path TEXT PRIMARY KEY,
                added TIMESTAMP NOT NULL,
                processed BOOLEAN NOT NULL DEFAULT 0,
                processed_at TIMESTAMP,
                process_count INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_queue_processed_at ON queue(processed_at)")
            .execute(&pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_queue_processed ON queue(processed)")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Close the underlying store.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Escape hatch for tests and one-off maintenance queries.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert `path` if it is new. Returns `true` only on insertion.
    pub async fn add(&self, path: &Path) -> bool {
        let key = path_key(path);
        let result = sqlx::query(
            "INSERT OR IGNORE INTO queue (file_path, added, processed, process_count) \
             VALUES (?, ?, 0, 0)",
        )
        .bind(&key)
        .bind(Utc::now())
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => done.rows_affected() > 0,
            Err(err) => {
                warn!(path = %key, error = %err, "failed to add file to queue");
                false
            }
        }
    }

    /// Whether `path` is already known.
    pub async fn contains(&self, path: &Path) -> bool {
        let key = path_key(path);
        let result = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM queue WHERE file_path = ?)",
        )
        .bind(&key)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(exists) => exists,
            Err(err) => {
                warn!(path = %key, error = %err, "failed to check queue membership");
                false
            }
        }
    }

    /// Record a completed verification attempt for `path`, successful or
    /// not. Returns `true` iff a row was updated.
    pub async fn mark_processed(&self, path: &Path) -> bool {
        let key = path_key(path);
        let result = sqlx::query(
            "UPDATE queue SET processed = 1, processed_at = ?, \
             process_count = process_count + 1 WHERE file_path = ?",
        )
        .bind(Utc::now())
        .bind(&key)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => done.rows_affected() > 0,
            Err(err) => {
                warn!(path = %key, error = %err, "failed to mark file as processed");
                false
            }
        }
    }

    /// Items that have never been processed.
    pub async fn pending_items(&self) -> Vec<QueueItem> {
        let result = sqlx::query(
            "SELECT file_path, added, processed, processed_at, process_count \
             FROM queue WHERE processed = 0 ORDER BY file_path",
        )
        .fetch_all(&self.pool)
        .await;

        match result {
            Ok(rows) => rows.iter().map(row_to_item).collect(),
            Err(err) => {
                warn!(error = %err, "failed to query pending items");
                Vec::new()
            }
        }
    }

    /// Processed items whose `processed_at` is older than `interval`. No
    /// ordering is promised.
    pub async fn items_due_for_reprocessing(&self, interval: Duration) -> Vec<QueueItem> {
        let Ok(age) = ChronoDuration::from_std(interval) else {
            return Vec::new();
        };
        if age <= ChronoDuration::zero() {
            return Vec::new();
        }
        let cutoff = Utc::now() - age;

        let result = sqlx::query(
            "SELECT file_path, added, processed, processed_at, process_count \
             FROM queue WHERE processed = 1 AND processed_at < ?",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await;

        match result {
            Ok(rows) => rows.iter().map(row_to_item).collect(),
            Err(err) => {
                warn!(error = %err, "failed to query items for reprocessing");
                Vec::new()
            }
        }
    }

    /// Count of items processed within the current local day.
    pub async fn processed_today(&self) -> u64 {
        let (start, end) = local_day_window();
        let result = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM queue WHERE processed = 1 \
             AND processed_at >= ? AND processed_at < ?",
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(count) => count.max(0) as u64,
            Err(err) => {
                warn!(error = %err, "failed to count items processed today");
                0
            }
        }
    }

    /// Delete processed items older than `max_age`. Returns how many rows
    /// were removed.
    pub async fn prune_old_items(&self, max_age: Duration) -> u64 {
        let Ok(age) = ChronoDuration::from_std(max_age) else {
            return 0;
        };
        let cutoff = Utc::now() - age;

        let result =
            sqlx::query("DELETE FROM queue WHERE processed = 1 AND processed_at < ?")
                .bind(cutoff)
                .execute(&self.pool)
                .await;

        match result {
            Ok(done) => done.rows_affected(),
            Err(err) => {
                warn!(error = %err, "failed to prune old queue items");
                0
            }
        }
    }
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn row_to_item(row: &SqliteRow) -> QueueItem {
    QueueItem {
        file_path: row.get("file_path"),
        added: row.get("added"),
        processed: row.get("processed"),
        processed_at: row.get("processed_at"),
        process_count: row.get("process_count"),
    }
}

/// The daily budget window is the process's local day, expressed in UTC for
/// the stored-timestamp comparison.
fn local_day_window() -> (DateTime<Utc>, DateTime<Utc>) {
    let midnight = Local::now().date_naive().and_time(NaiveTime::MIN);
    let start = midnight
        .and_local_timezone(Local)
        .earliest()
        .unwrap_or_else(Local::now)
        .with_timezone(&Utc);
    (start, start + ChronoDuration::hours(24))
}
