// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable walk progress.
//!
//! Two things survive a crash here:
//!
//! - **Step snapshots** `(walk_id, page_number) → offset`: the checkpoints a
//!   step emits while it publishes. A retried step resumes from them.
//! - **Walk cursors** `walk_id → (cursor, completed)`: the input of the
//!   next step, written after each step completes. A restarted process
//!   continues the walk from there.
//!
//! # Debounced Snapshots
//!
//! Snapshots arrive after every sub-batch, so they are debounced:
//! - `record()` updates the in-memory cache immediately and marks it dirty
//! - `flush_dirty()` persists all dirty snapshots in a batch
//! - The orchestrator flushes after each step attempt, and a background
//!   task flushes periodically
//!
//! A crash between `record()` and `flush_dirty()` loses at most one flush
//! interval of snapshots. The retried step then starts from an older
//! offset and republishes a few entities (at-least-once, safe). It never
//! starts from a newer one.
//!
//! Walk cursors are written through immediately.
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with exponential backoff
//! (5 attempts, 10ms doubling to 500ms). Cache updates never wait on disk.

use crate::error::{FanoutError, Result};
use crate::types::{Cursor, Progress};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Path that selects a private in-memory database.
pub const IN_MEMORY_PATH: &str = ":memory:";

fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::progress_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

type SnapshotKey = (String, u64);

/// Committed position of a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkCursor {
    /// Input of the next step (or of the last one, once completed).
    pub cursor: Cursor,
    pub completed: bool,
    /// Milliseconds since the epoch.
    pub updated_at: i64,
}

/// SQLite-backed progress storage with a write-back snapshot cache.
pub struct ProgressStore {
    pool: SqlitePool,
    snapshots: Arc<RwLock<HashMap<SnapshotKey, u32>>>,
    dirty: Arc<RwLock<HashSet<SnapshotKey>>>,
    /// Held by every snapshot write or delete that touches disk, so a
    /// flush can never re-create a row that `discard` just removed.
    disk_lock: Mutex<()>,
    path: String,
}

impl ProgressStore {
    /// Open (or create) the store at `path`. `":memory:"` keeps it in memory.
    pub async fn new(path: impl AsRef<Path>, wal_mode: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Initializing progress store");

        let in_memory = path_str == IN_MEMORY_PATH;
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path_str)
        };

        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| FanoutError::Config(format!("Invalid SQLite path: {}", e)))?
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);
        if wal_mode && !in_memory {
            options = options.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        }

        // Each in-memory connection is its own database, so keep exactly one alive.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(2)
        };
        let pool = pool_options.connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS step_progress (
                walk_id TEXT NOT NULL,
                page_number INTEGER NOT NULL,
                last_offset INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (walk_id, page_number)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS walks (
                walk_id TEXT PRIMARY KEY,
                last_offset INTEGER NOT NULL,
                page_number INTEGER NOT NULL,
                completed INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, i64, i64)> =
            sqlx::query_as("SELECT walk_id, page_number, last_offset FROM step_progress")
                .fetch_all(&pool)
                .await?;

        let mut snapshots = HashMap::new();
        for (walk_id, page_number, last_offset) in rows {
            let (Ok(page_number), Ok(last_offset)) = (u64::try_from(page_number), u32::try_from(last_offset))
            else {
                warn!(walk_id = %walk_id, page_number, last_offset, "Ignoring out-of-range progress row");
                continue;
            };
            debug!(walk_id = %walk_id, page_number, last_offset, "Loaded step snapshot from disk");
            snapshots.insert((walk_id, page_number), last_offset);
        }

        if !snapshots.is_empty() {
            info!(count = snapshots.len(), "Restored step snapshots from previous run");
        }

        Ok(Self {
            pool,
            snapshots: Arc::new(RwLock::new(snapshots)),
            dirty: Arc::new(RwLock::new(HashSet::new())),
            disk_lock: Mutex::new(()),
            path: path_str,
        })
    }

    /// Private in-memory store (tests, dry runs).
    pub async fn in_memory() -> Result<Self> {
        Self::new(IN_MEMORY_PATH, false).await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Step snapshots
    // ═══════════════════════════════════════════════════════════════════════

    /// Record a snapshot (debounced).
    ///
    /// Offsets only move forward per `(walk_id, page_number)`; an older
    /// snapshot arriving late is ignored. Returns whether it advanced.
    pub async fn record(&self, walk_id: &str, progress: Progress) -> bool {
        let key = (walk_id.to_string(), progress.page_number);
        {
            let mut snapshots = self.snapshots.write().await;
            match snapshots.get(&key) {
                Some(&existing) if existing >= progress.offset => return false,
                _ => {
                    snapshots.insert(key.clone(), progress.offset);
                }
            }
        }

        self.dirty.write().await.insert(key);
        debug!(
            walk_id,
            page_number = progress.page_number,
            offset = progress.offset,
            "Step snapshot updated (pending flush)"
        );
        true
    }

    /// Latest snapshot for one step of a walk.
    pub async fn snapshot(&self, walk_id: &str, page_number: u32) -> Option<Progress> {
        let key = (walk_id.to_string(), u64::from(page_number));
        self.snapshots
            .read()
            .await
            .get(&key)
            .map(|&offset| Progress::new(page_number, offset))
    }

    /// All snapshots of a walk, ordered by page.
    pub async fn snapshots_for(&self, walk_id: &str) -> Vec<Progress> {
        let mut out: Vec<Progress> = self
            .snapshots
            .read()
            .await
            .iter()
            .filter(|((w, _), _)| w == walk_id)
            .map(|((_, page_number), &offset)| Progress {
                page_number: *page_number,
                offset,
            })
            .collect();
        out.sort_by_key(|p| p.page_number);
        out
    }

    /// Flush all dirty snapshots to disk.
    ///
    /// Returns the number of snapshots flushed.
    pub async fn flush_dirty(&self) -> Result<usize> {
        let _disk = self.disk_lock.lock().await;
        let dirty_keys: Vec<SnapshotKey> = {
            let mut dirty = self.dirty.write().await;
            dirty.drain().collect()
        };

        if dirty_keys.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;
        let mut flushed = 0;
        let mut errors = 0;

        for key in dirty_keys {
            // Discarded since it was marked dirty.
            let Some(offset) = self.snapshots.read().await.get(&key).copied() else {
                continue;
            };
            let (walk_id, page_number) = key;
            let page = page_number as i64;
            let result = execute_with_retry("progress_flush", || async {
                sqlx::query(
                    r#"
                    INSERT INTO step_progress (walk_id, page_number, last_offset, updated_at)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(walk_id, page_number) DO UPDATE SET
                        last_offset = MAX(step_progress.last_offset, excluded.last_offset),
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(&walk_id)
                .bind(page)
                .bind(i64::from(offset))
                .bind(now)
                .execute(pool)
                .await
            })
            .await;

            match result {
                Ok(_) => flushed += 1,
                Err(e) => {
                    errors += 1;
                    warn!(walk_id = %walk_id, page_number, error = %e, "Failed to flush step snapshot");
                    // Re-mark as dirty so we retry next flush
                    self.dirty.write().await.insert((walk_id, page_number));
                }
            }
        }

        if flushed > 0 || errors > 0 {
            debug!(flushed, errors, "Flushed dirty step snapshots");
            crate::metrics::record_progress_flush(flushed, errors);
        }

        if errors > 0 {
            return Err(FanoutError::Internal(format!(
                "Failed to flush {} step snapshots",
                errors
            )));
        }

        Ok(flushed)
    }

    pub async fn has_dirty(&self) -> bool {
        !self.dirty.read().await.is_empty()
    }

    pub async fn dirty_count(&self) -> usize {
        self.dirty.read().await.len()
    }

    /// Drop the snapshot of a completed step.
    pub async fn discard(&self, walk_id: &str, page_number: u32) -> Result<()> {
        let key = (walk_id.to_string(), u64::from(page_number));
        let _disk = self.disk_lock.lock().await;
        self.snapshots.write().await.remove(&key);
        self.dirty.write().await.remove(&key);

        let pool = &self.pool;
        execute_with_retry("progress_discard", || async {
            sqlx::query("DELETE FROM step_progress WHERE walk_id = ? AND page_number = ?")
                .bind(walk_id)
                .bind(i64::from(page_number))
                .execute(pool)
                .await
        })
        .await?;

        debug!(walk_id, page_number, "Discarded step snapshot");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Walk cursors
    // ═══════════════════════════════════════════════════════════════════════

    /// Persist the cursor of a walk (write-through).
    pub async fn save_walk(&self, walk_id: &str, cursor: Cursor, completed: bool) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;

        execute_with_retry("walk_save", || async {
            sqlx::query(
                r#"
                INSERT INTO walks (walk_id, last_offset, page_number, completed, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(walk_id) DO UPDATE SET
                    last_offset = excluded.last_offset,
                    page_number = excluded.page_number,
                    completed = excluded.completed,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(walk_id)
            .bind(i64::from(cursor.offset))
            .bind(i64::from(cursor.page_number))
            .bind(completed)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        debug!(walk_id, offset = cursor.offset, page_number = cursor.page_number, completed, "Walk cursor saved");
        Ok(())
    }

    /// Committed cursor of a walk, if it ever ran.
    pub async fn load_walk(&self, walk_id: &str) -> Result<Option<WalkCursor>> {
        let row: Option<(i64, i64, bool, i64)> = sqlx::query_as(
            "SELECT last_offset, page_number, completed, updated_at FROM walks WHERE walk_id = ?",
        )
        .bind(walk_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(offset, page_number, completed, updated_at)| {
            let offset = u32::try_from(offset)
                .map_err(|_| FanoutError::Internal(format!("stored walk offset {} out of range", offset)))?;
            let page_number = u32::try_from(page_number).map_err(|_| {
                FanoutError::Internal(format!("stored page number {} out of range", page_number))
            })?;
            Ok(WalkCursor {
                cursor: Cursor::new(offset, page_number),
                completed,
                updated_at,
            })
        })
        .transpose()
    }

    /// Forget a walk: its cursor and every snapshot.
    pub async fn delete_walk(&self, walk_id: &str) -> Result<()> {
        let _disk = self.disk_lock.lock().await;
        self.snapshots.write().await.retain(|(w, _), _| w != walk_id);
        self.dirty.write().await.retain(|(w, _)| w != walk_id);

        let pool = &self.pool;
        execute_with_retry("walk_delete", || async {
            let mut tx = pool.begin().await?;
            sqlx::query("DELETE FROM step_progress WHERE walk_id = ?")
                .bind(walk_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM walks WHERE walk_id = ?")
                .bind(walk_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await
        })
        .await?;

        info!(walk_id, "Deleted walk progress");
        Ok(())
    }

    /// Walk ids with a stored cursor.
    pub async fn walk_ids(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT walk_id FROM walks ORDER BY walk_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(w,)| w).collect())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Flush dirty snapshots every `interval` until `shutdown` fires.
    pub fn spawn_flush_task(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.flush_dirty().await {
                            warn!(error = %e, "Periodic progress flush failed");
                        }
                    }
                }
            }
            debug!("Progress flush task stopped");
        })
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;

        execute_with_retry("progress_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Flush dirty snapshots, checkpoint WAL, close the pool.
    pub async fn close(&self) {
        if self.has_dirty().await {
            match self.flush_dirty().await {
                Ok(count) => info!(count, "Flushed dirty step snapshots on close"),
                Err(e) => warn!(error = %e, "Failed to flush dirty step snapshots on close"),
            }
        }

        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Progress store closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_snapshot_record_and_flush() {
        let dir = tempdir().unwrap();
        let store = ProgressStore::new(dir.path().join("progress.db"), true).await.unwrap();

        assert!(store.snapshot("walk", 0).await.is_none());

        assert!(store.record("walk", Progress::new(0, 25)).await);
        assert_eq!(store.snapshot("walk", 0).await, Some(Progress::new(0, 25)));
        assert!(store.has_dirty().await);

        let flushed = store.flush_dirty().await.unwrap();
        assert_eq!(flushed, 1);
        assert!(!store.has_dirty().await);

        store.close().await;
    }

    #[tokio::test]
    async fn test_snapshot_never_moves_backwards() {
        let store = ProgressStore::in_memory().await.unwrap();

        assert!(store.record("walk", Progress::new(2, 50)).await);
        assert!(!store.record("walk", Progress::new(2, 40)).await);
        assert!(!store.record("walk", Progress::new(2, 50)).await);
        assert_eq!(store.snapshot("walk", 2).await.map(|p| p.offset), Some(50));

        store.close().await;
    }

    #[tokio::test]
    async fn test_snapshot_persistence() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("persist.db");

        {
            let store = ProgressStore::new(&db_path, true).await.unwrap();
            store.record("walk", Progress::new(3, 310)).await;
            store.flush_dirty().await.unwrap();
            store.close().await;
        }

        {
            let store = ProgressStore::new(&db_path, true).await.unwrap();
            assert_eq!(store.snapshot("walk", 3).await, Some(Progress::new(3, 310)));
            store.close().await;
        }
    }

    #[tokio::test]
    async fn test_close_flushes_dirty() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("close_flush.db");

        {
            let store = ProgressStore::new(&db_path, true).await.unwrap();
            store.record("walk", Progress::new(0, 99)).await;
            store.close().await;
        }

        {
            let store = ProgressStore::new(&db_path, true).await.unwrap();
            assert_eq!(store.snapshot("walk", 0).await.map(|p| p.offset), Some(99));
            store.close().await;
        }
    }

    #[tokio::test]
    async fn test_debounce_multiple_updates() {
        let store = ProgressStore::in_memory().await.unwrap();

        store.record("walk", Progress::new(0, 10)).await;
        store.record("walk", Progress::new(0, 20)).await;
        store.record("walk", Progress::new(0, 30)).await;
        assert_eq!(store.dirty_count().await, 1);

        store.record("other", Progress::new(0, 5)).await;
        assert_eq!(store.dirty_count().await, 2);

        assert_eq!(store.flush_dirty().await.unwrap(), 2);
        assert_eq!(store.dirty_count().await, 0);

        store.close().await;
    }

    #[tokio::test]
    async fn test_discard_removes_snapshot() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("discard.db");

        {
            let store = ProgressStore::new(&db_path, true).await.unwrap();
            store.record("walk", Progress::new(1, 40)).await;
            store.record("walk", Progress::new(2, 60)).await;
            store.flush_dirty().await.unwrap();
            store.discard("walk", 1).await.unwrap();
            assert!(store.snapshot("walk", 1).await.is_none());
            assert_eq!(store.snapshots_for("walk").await, vec![Progress::new(2, 60)]);
            store.close().await;
        }

        {
            let store = ProgressStore::new(&db_path, true).await.unwrap();
            assert!(store.snapshot("walk", 1).await.is_none());
            assert!(store.snapshot("walk", 2).await.is_some());
            store.close().await;
        }
    }

    #[tokio::test]
    async fn test_discard_during_flush_stays_discarded() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("discard_race.db");

        {
            let store = ProgressStore::new(&db_path, true).await.unwrap();
            store.record("walk", Progress::new(0, 20)).await;

            // Suspend the flush inside its write, then discard concurrently.
            let mut flush = std::pin::pin!(store.flush_dirty());
            let (flushed, discarded) = match futures::poll!(flush.as_mut()) {
                std::task::Poll::Ready(flushed) => (flushed, store.discard("walk", 0).await),
                std::task::Poll::Pending => tokio::join!(flush, store.discard("walk", 0)),
            };
            flushed.unwrap();
            discarded.unwrap();

            assert!(store.snapshot("walk", 0).await.is_none());
            assert!(!store.has_dirty().await);
            store.close().await;
        }

        {
            let store = ProgressStore::new(&db_path, true).await.unwrap();
            assert!(store.snapshot("walk", 0).await.is_none());
            store.close().await;
        }
    }

    #[tokio::test]
    async fn test_flush_skips_snapshot_discarded_while_dirty() {
        let store = ProgressStore::in_memory().await.unwrap();
        store.record("walk", Progress::new(0, 20)).await;
        store.record("walk", Progress::new(1, 45)).await;
        store.discard("walk", 0).await.unwrap();

        assert_eq!(store.flush_dirty().await.unwrap(), 1);
        assert_eq!(store.snapshots_for("walk").await, vec![Progress::new(1, 45)]);

        store.close().await;
    }

    #[tokio::test]
    async fn test_walk_cursor_roundtrip() {
        let store = ProgressStore::in_memory().await.unwrap();

        assert!(store.load_walk("walk").await.unwrap().is_none());

        store.save_walk("walk", Cursor::new(25, 1), false).await.unwrap();
        let saved = store.load_walk("walk").await.unwrap().unwrap();
        assert_eq!(saved.cursor, Cursor::new(25, 1));
        assert!(!saved.completed);
        assert!(saved.updated_at > 0);

        store.save_walk("walk", Cursor::new(30, 1), true).await.unwrap();
        let saved = store.load_walk("walk").await.unwrap().unwrap();
        assert!(saved.completed);
        assert_eq!(store.walk_ids().await.unwrap(), vec!["walk".to_string()]);

        store.close().await;
    }

    #[tokio::test]
    async fn test_delete_walk_clears_everything() {
        let store = ProgressStore::in_memory().await.unwrap();
        store.save_walk("walk", Cursor::new(25, 1), false).await.unwrap();
        store.record("walk", Progress::new(1, 40)).await;
        store.record("keep", Progress::new(0, 7)).await;

        store.delete_walk("walk").await.unwrap();

        assert!(store.load_walk("walk").await.unwrap().is_none());
        assert!(store.snapshots_for("walk").await.is_empty());
        assert_eq!(store.snapshot("keep", 0).await.map(|p| p.offset), Some(7));
        assert_eq!(store.dirty_count().await, 1);

        store.close().await;
    }

    #[tokio::test]
    async fn test_flush_task_persists_in_background() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("flush_task.db");
        let store = Arc::new(ProgressStore::new(&db_path, true).await.unwrap());
        let shutdown = CancellationToken::new();
        let handle = store.spawn_flush_task(Duration::from_millis(10), shutdown.clone());

        store.record("walk", Progress::new(0, 12)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!store.has_dirty().await);

        shutdown.cancel();
        handle.await.unwrap();
        store.close().await;
    }

    #[tokio::test]
    async fn test_execute_with_retry_succeeds_immediately() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Ok(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count, 1);
    }

    #[tokio::test]
    async fn test_execute_with_retry_fails_on_non_busy_error() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempt_count, 1);
    }

    #[test]
    fn test_is_sqlite_busy_error_other_variants() {
        assert!(!is_sqlite_busy_error(&sqlx::Error::RowNotFound));
        assert!(!is_sqlite_busy_error(&sqlx::Error::PoolTimedOut));
    }
}
