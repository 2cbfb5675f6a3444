//! Postgres page store.
//!
//! Every transaction runs at REPEATABLE READ, READ WRITE: rows committed by
//! other writers after the first read stay invisible until the step ends.

use super::PageStore;
use crate::error::{FanoutError, Result};
use crate::types::{BoxFuture, Entity};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const FETCH_BATCH_SQL: &str =
    "SELECT CAST(id AS BIGINT) AS id, external_id FROM entities WHERE id > $1 ORDER BY id ASC LIMIT $2";

#[derive(Clone)]
pub struct PgPageStore {
    pool: PgPool,
}

impl PgPageStore {
    pub async fn connect(url: &str, max_connections: u32, acquire_timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| FanoutError::store("connect", e))?;

        info!(max_connections, "Connected to Postgres entity store");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `entities` table if missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entities (
                id SERIAL PRIMARY KEY,
                external_id UUID NOT NULL UNIQUE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| FanoutError::store("ensure_schema", e))?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl PageStore for PgPageStore {
    type Tx = Transaction<'static, Postgres>;

    fn begin(&self) -> BoxFuture<'_, Self::Tx> {
        Box::pin(async move {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| FanoutError::store("begin", e))?;

            // Must be the first statement of the transaction.
            sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ WRITE")
                .execute(&mut *tx)
                .await
                .map_err(|e| FanoutError::store("begin", e))?;

            Ok(tx)
        })
    }

    fn fetch_batch<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        since_offset: u32,
        limit: u32,
    ) -> BoxFuture<'a, Vec<Entity>> {
        Box::pin(async move {
            let rows: Vec<(i64, Uuid)> = sqlx::query_as(FETCH_BATCH_SQL)
                .bind(i64::from(since_offset))
                .bind(i64::from(limit))
                .fetch_all(&mut **tx)
                .await
                .map_err(|e| FanoutError::store("fetch_batch", e))?;

            debug!(since_offset, limit, rows = rows.len(), "Fetched Postgres batch");

            rows.into_iter()
                .map(|(id, external_id)| {
                    let id = u32::try_from(id).map_err(|_| {
                        FanoutError::store_msg("decode", format!("entity id {} out of range", id))
                    })?;
                    Ok(Entity::new(id, external_id))
                })
                .collect()
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
