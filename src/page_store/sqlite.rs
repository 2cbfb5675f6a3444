//! SQLite page store for local runs and Docker-free tests.
//!
//! SQLite has no REPEATABLE READ level; a deferred transaction reads a
//! consistent snapshot from its first statement on (WAL mode), which gives
//! the same guarantee for a single page.

use super::PageStore;
use crate::error::{FanoutError, Result};
use crate::types::{BoxFuture, Entity};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Clone)]
pub struct SqlitePageStore {
    pool: SqlitePool,
}

impl SqlitePageStore {
    /// Connect to `url` (e.g. `sqlite://entities.db?mode=rwc`).
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| FanoutError::Config(format!("Invalid SQLite URL: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|e| FanoutError::store("connect", e))?;

        info!(url = %url, "Connected to SQLite entity store");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the `entities` table if missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entities (
                id INTEGER PRIMARY KEY,
                external_id TEXT NOT NULL UNIQUE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| FanoutError::store("ensure_schema", e))?;
        Ok(())
    }

    /// Insert entities, ignoring ids that already exist.
    pub async fn insert_entities(&self, entities: &[Entity]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| FanoutError::store("insert", e))?;
        for entity in entities {
            sqlx::query("INSERT OR IGNORE INTO entities (id, external_id) VALUES (?, ?)")
                .bind(i64::from(entity.id))
                .bind(entity.external_id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(|e| FanoutError::store("insert", e))?;
        }
        tx.commit().await.map_err(|e| FanoutError::store("insert", e))?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn decode_row((id, external_id): (i64, String)) -> Result<Entity> {
    let id = u32::try_from(id)
        .map_err(|_| FanoutError::store_msg("decode", format!("entity id {} out of range", id)))?;
    let external_id = Uuid::parse_str(&external_id).map_err(|e| {
        FanoutError::store_msg("decode", format!("entity {} has invalid external_id: {}", id, e))
    })?;
    Ok(Entity::new(id, external_id))
}

impl PageStore for SqlitePageStore {
    type Tx = Transaction<'static, Sqlite>;

    fn begin(&self) -> BoxFuture<'_, Self::Tx> {
        Box::pin(async move {
            self.pool
                .begin()
                .await
                .map_err(|e| FanoutError::store("begin", e))
        })
    }

    fn fetch_batch<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        since_offset: u32,
        limit: u32,
    ) -> BoxFuture<'a, Vec<Entity>> {
        Box::pin(async move {
            let rows: Vec<(i64, String)> = sqlx::query_as(
                "SELECT id, external_id FROM entities WHERE id > ? ORDER BY id ASC LIMIT ?",
            )
            .bind(i64::from(since_offset))
            .bind(i64::from(limit))
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| FanoutError::store("fetch_batch", e))?;

            debug!(since_offset, limit, rows = rows.len(), "Fetched SQLite batch");
            rows.into_iter().map(decode_row).collect()
        })
    }

    fn commit(&self, tx: Self::Tx) -> BoxFuture<'_, ()> {
        Box::pin(async move { tx.commit().await.map_err(|e| FanoutError::store("commit", e)) })
    }

    fn rollback(&self, tx: Self::Tx) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            tx.rollback()
                .await
                .map_err(|e| FanoutError::store("rollback", e))
        })
    }
}
