//! In-memory page store.
//!
//! Each transaction reads a snapshot taken at `begin()`, so rows inserted
//! while a step runs are invisible to it (repeatable read). Counts
//! transactions by outcome and can inject fetch/commit failures, which is
//! what the engine tests lean on.

use super::PageStore;
use crate::error::FanoutError;
use crate::types::{BoxFuture, Entity};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

type Rows = Arc<BTreeMap<u32, Entity>>;

/// Snapshot transaction over [`InMemoryPageStore`].
#[derive(Debug)]
pub struct MemoryTx {
    id: u64,
    snapshot: Rows,
}

impl MemoryTx {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug)]
pub struct InMemoryPageStore {
    rows: RwLock<Rows>,
    next_tx: AtomicU64,
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    fetches: AtomicUsize,
    /// Fetches allowed before failing (usize::MAX = never fail).
    fail_fetch_after: AtomicUsize,
    fail_commit: AtomicBool,
}

impl Default for InMemoryPageStore {
    fn default() -> Self {
        Self {
            rows: RwLock::default(),
            next_tx: AtomicU64::new(0),
            begins: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
            fail_fetch_after: AtomicUsize::new(usize::MAX),
            fail_commit: AtomicBool::new(false),
        }
    }
}

impl InMemoryPageStore {
    pub fn new() -> Self {
        Self::with_entities(Vec::new())
    }

    pub fn with_entities(entities: impl IntoIterator<Item = Entity>) -> Self {
        let rows: BTreeMap<u32, Entity> = entities.into_iter().map(|e| (e.id, e)).collect();
        Self {
            rows: RwLock::new(Arc::new(rows)),
            ..Default::default()
        }
    }

    /// Entities with the given ids and deterministic external ids.
    pub fn with_ids(ids: impl IntoIterator<Item = u32>) -> Self {
        Self::with_entities(
            ids.into_iter()
                .map(|id| Entity::new(id, Uuid::from_u128(u128::from(id)))),
        )
    }

    /// Insert or replace an entity. Open transactions do not see it.
    pub async fn insert(&self, entity: Entity) {
        let mut rows = self.rows.write().await;
        Arc::make_mut(&mut rows).insert(entity.id, entity);
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    /// Fail every fetch after `n` more successful ones.
    pub fn fail_fetches_after(&self, n: usize) {
        let done = self.fetches.load(Ordering::SeqCst);
        self.fail_fetch_after.store(done.saturating_add(n), Ordering::SeqCst);
    }

    pub fn fail_commits(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }

    /// Clear injected failures.
    pub fn heal(&self) {
        self.fail_fetch_after.store(usize::MAX, Ordering::SeqCst);
        self.fail_commit.store(false, Ordering::SeqCst);
    }

    pub fn begin_count(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Transactions begun but neither committed nor rolled back.
    pub fn open_transactions(&self) -> usize {
        self.begin_count()
            .saturating_sub(self.commit_count() + self.rollback_count())
    }
}

impl PageStore for InMemoryPageStore {
    type Tx = MemoryTx;

    fn begin(&self) -> BoxFuture<'_, MemoryTx> {
        Box::pin(async move {
            let snapshot = Arc::clone(&*self.rows.read().await);
            let id = self.next_tx.fetch_add(1, Ordering::SeqCst);
            self.begins.fetch_add(1, Ordering::SeqCst);
            debug!(tx_id = id, rows = snapshot.len(), "Memory transaction opened");
            Ok(MemoryTx { id, snapshot })
        })
    }

    fn fetch_batch<'a>(
        &'a self,
        tx: &'a mut MemoryTx,
        since_offset: u32,
        limit: u32,
    ) -> BoxFuture<'a, Vec<Entity>> {
        Box::pin(async move {
            let done = self.fetches.fetch_add(1, Ordering::SeqCst);
            if done >= self.fail_fetch_after.load(Ordering::SeqCst) {
                return Err(FanoutError::store_msg("fetch_batch", "injected fetch failure"));
            }

            Ok(tx
                .snapshot
                .range((Bound::Excluded(since_offset), Bound::Unbounded))
                .take(limit as usize)
                .map(|(_, e)| *e)
                .collect())
        })
    }

    fn commit(&self, tx: MemoryTx) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.fail_commit.load(Ordering::SeqCst) {
                // A failed commit still ends the transaction.
                self.rollbacks.fetch_add(1, Ordering::SeqCst);
                return Err(FanoutError::store_msg("commit", "injected commit failure"));
            }
            self.commits.fetch_add(1, Ordering::SeqCst);
            debug!(tx_id = tx.id, "Memory transaction committed");
            Ok(())
        })
    }

    fn rollback(&self, tx: MemoryTx) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            debug!(tx_id = tx.id, "Memory transaction rolled back");
            Ok(())
        })
    }
}
