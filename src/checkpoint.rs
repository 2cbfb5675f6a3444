//! Checkpoint emission and resume.
//!
//! A step reports `{page_number, offset}` after each published sub-batch.
//! Whoever runs the step decides what to do with it; the engine never waits
//! on it for correctness. A retry of the same step starts from
//! `max(input offset, last snapshot)`.

use crate::error::Result;
use crate::progress::ProgressStore;
use crate::types::{BoxFuture, Cursor, Progress};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Receives progress snapshots while a step runs.
///
/// Failures are reported to the engine, which logs them and carries on.
pub trait CheckpointSink: Send + Sync {
    fn record(&self, progress: Progress) -> BoxFuture<'_, ()>;
}

/// Drops every snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpCheckpointSink;

impl CheckpointSink for NoOpCheckpointSink {
    fn record(&self, _progress: Progress) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Starting offset of a resumed step. Never lower than either input.
pub fn resume_offset(input_offset: u32, prior: Option<Progress>) -> u32 {
    prior.map_or(input_offset, |p| p.offset.max(input_offset))
}

/// `input` with its offset moved up to the prior snapshot, if any.
pub fn resume_cursor(input: Cursor, prior: Option<Progress>) -> Cursor {
    Cursor {
        offset: resume_offset(input.offset, prior),
        page_number: input.page_number,
    }
}

/// Sink backed by the [`ProgressStore`].
///
/// Snapshots land in the store's cache right away and on disk at the next
/// flush (or immediately with [`ProgressSink::durable`]). The latest one is
/// also broadcast on a `watch` channel for anyone supervising the walk.
#[derive(Clone)]
pub struct ProgressSink {
    store: Arc<ProgressStore>,
    walk_id: String,
    durable: bool,
    latest: Option<Arc<watch::Sender<Option<Progress>>>>,
}

impl ProgressSink {
    pub fn new(store: Arc<ProgressStore>, walk_id: impl Into<String>) -> Self {
        Self {
            store,
            walk_id: walk_id.into(),
            durable: false,
            latest: None,
        }
    }

    /// Flush to disk on every snapshot instead of waiting for the next flush.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Also publish each snapshot on `sender`.
    pub fn broadcast_to(mut self, sender: Arc<watch::Sender<Option<Progress>>>) -> Self {
        self.latest = Some(sender);
        self
    }

    pub fn walk_id(&self) -> &str {
        &self.walk_id
    }

    async fn record_inner(&self, progress: Progress) -> Result<()> {
        let advanced = self.store.record(&self.walk_id, progress).await;
        if !advanced {
            debug!(walk_id = %self.walk_id, offset = progress.offset, "Snapshot did not advance, ignored");
            return Ok(());
        }

        if let Some(latest) = &self.latest {
            latest.send_replace(Some(progress));
        }

        if self.durable {
            self.store.flush_dirty().await?;
        }
        Ok(())
    }
}

impl CheckpointSink for ProgressSink {
    fn record(&self, progress: Progress) -> BoxFuture<'_, ()> {
        Box::pin(self.record_inner(progress))
    }
}
