// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded, ordered read access to the entity set.
//!
//! A [`PageStore`] exposes four primitives: open a transaction, fetch one
//! ascending batch above an offset, commit, roll back. Everything above that
//! (sub-batching up to the page cap, the `has_more` rule, scoped
//! transactions) is shared code in this module and [`crate::transaction`].
//!
//! # Page Shape
//!
//! ```text
//! since_offset = 0, page_limit = 25, batch_size = 10, store holds ids 1..=30
//!
//!   fetch(0, 10)  → 1..=10   fetched = 10
//!   fetch(10, 10) → 11..=20  fetched = 20
//!   fetch(20, 5)  → 21..=25  fetched = 25 == page_limit → has_more = true
//!
//! since_offset = 25
//!   fetch(25, 10) → 26..=30  short batch → exhausted, has_more = false
//! ```
//!
//! `has_more` is a heuristic: a page that ends exactly on the last row
//! reports `true`, and the next step reads an empty page.

pub mod memory;
pub mod postgres;
pub mod sqlite;

pub use memory::InMemoryPageStore;
pub use postgres::PgPageStore;
pub use sqlite::SqlitePageStore;

use crate::context::StepContext;
use crate::error::{FanoutError, Result};
use crate::types::{BoxFuture, Entity};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Transactional source of entities.
///
/// Implementations never retry internally; errors bubble to the
/// orchestrator for classification.
pub trait PageStore: Send + Sync + 'static {
    /// Open transaction. Repeatable-read where the backend supports it.
    type Tx: Send + 'static;

    /// Open a transaction.
    fn begin(&self) -> BoxFuture<'_, Self::Tx>;

    /// Up to `limit` entities with `id > since_offset`, ascending by id.
    fn fetch_batch<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        since_offset: u32,
        limit: u32,
    ) -> BoxFuture<'a, Vec<Entity>>;

    fn commit(&self, tx: Self::Tx) -> BoxFuture<'_, ()>;

    fn rollback(&self, tx: Self::Tx) -> BoxFuture<'_, ()>;
}

/// Handle to the transaction of one step.
///
/// Passed explicitly to the code that reads inside the transaction. The
/// scope that opened it takes the transaction back out when it ends, so a
/// clone kept past that point only yields [`FanoutError::TransactionClosed`].
pub struct TxHandle<T> {
    inner: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for TxHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send> TxHandle<T> {
    pub(crate) fn open(tx: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(tx))),
        }
    }

    pub(crate) async fn close(&self) -> Option<T> {
        self.inner.lock().await.take()
    }

    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    /// Fetch one batch inside this transaction.
    pub async fn fetch_batch<S>(&self, store: &S, since_offset: u32, limit: u32) -> Result<Vec<Entity>>
    where
        S: PageStore<Tx = T>,
    {
        let mut guard = self.inner.lock().await;
        let tx = guard.as_mut().ok_or_else(|| FanoutError::TransactionClosed {
            operation: "fetch_batch".to_string(),
        })?;
        store.fetch_batch(tx, since_offset, limit).await
    }
}

/// Walks one page as consecutive sub-batches.
#[derive(Debug, Clone)]
pub struct Pager {
    since: u32,
    page_limit: u32,
    batch_size: u32,
    fetched: u32,
    exhausted: bool,
}

impl Pager {
    pub fn new(since_offset: u32, page_limit: u32, batch_size: u32) -> Self {
        Self {
            since: since_offset,
            page_limit,
            batch_size: batch_size.clamp(1, page_limit.max(1)),
            fetched: 0,
            exhausted: page_limit == 0,
        }
    }

    /// Size of the next sub-batch, or `None` once the page is done.
    pub fn next_limit(&self) -> Option<u32> {
        if self.exhausted || self.fetched >= self.page_limit {
            return None;
        }
        Some(self.batch_size.min(self.page_limit - self.fetched))
    }

    /// Record a batch fetched with `requested` as limit.
    ///
    /// Rejects batches that are too long, unordered, or not above the
    /// current offset; the engine's offset arithmetic depends on all three.
    pub fn accept(&mut self, requested: u32, batch: &[Entity]) -> Result<()> {
        if batch.len() > requested as usize {
            return Err(FanoutError::Internal(format!(
                "store returned {} entities for a batch of {}",
                batch.len(),
                requested
            )));
        }

        let mut prev = self.since;
        for entity in batch {
            if entity.id <= prev {
                return Err(FanoutError::Internal(format!(
                    "store returned id {} after {} (ids must ascend above offset {})",
                    entity.id, prev, self.since
                )));
            }
            prev = entity.id;
        }

        self.since = prev;
        self.fetched = self.fetched.saturating_add(batch.len() as u32);
        if batch.len() < requested as usize {
            self.exhausted = true;
        }
        Ok(())
    }

    /// Fetch the next sub-batch. `None` when the page is complete.
    pub async fn next_batch<S: PageStore>(
        &mut self,
        ctx: &StepContext,
        store: &S,
        tx: &TxHandle<S::Tx>,
    ) -> Result<Option<Vec<Entity>>> {
        let Some(limit) = self.next_limit() else {
            return Ok(None);
        };

        let batch = ctx.guard(tx.fetch_batch(store, self.since, limit)).await?;
        self.accept(limit, &batch)?;

        if batch.is_empty() {
            return Ok(None);
        }
        Ok(Some(batch))
    }

    /// True iff the page read exactly `page_limit` entities.
    pub fn has_more(&self) -> bool {
        self.page_limit > 0 && self.fetched == self.page_limit
    }

    pub fn fetched(&self) -> u32 {
        self.fetched
    }

    /// Highest id read so far (or the starting offset).
    pub fn last_id(&self) -> u32 {
        self.since
    }
}

/// Read a whole page inside `tx`: entities ascending, plus `has_more`.
pub async fn read_page<S: PageStore>(
    ctx: &StepContext,
    store: &S,
    tx: &TxHandle<S::Tx>,
    since_offset: u32,
    page_limit: u32,
    batch_size: u32,
) -> Result<(Vec<Entity>, bool)> {
    let mut pager = Pager::new(since_offset, page_limit, batch_size);
    let mut entities = Vec::new();
    while let Some(batch) = pager.next_batch(ctx, store, tx).await? {
        entities.extend(batch);
    }
    Ok((entities, pager.has_more()))
}
