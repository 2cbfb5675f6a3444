// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The fan-out step.
//!
//! One step is one transaction:
//!
//! ```text
//! ctx.check()                      cancelled? fail before any I/O
//! with_transaction {
//!     loop sub-batch (≤ batch_size, until page_limit or short batch) {
//!         for entity in batch (ascending id) {
//!             publish(topic, external_id)      error → rollback, propagate
//!             running = max(running, id)
//!         }
//!         checkpoint {page_number, running}     best-effort
//!     }
//! }                                commit (failure is a hard error)
//! → PageResult { offset: running, has_more, page_number }
//! ```
//!
//! Publishes inside one page are sequential, so checkpoint offsets are
//! trivially non-decreasing. Publishes are not retracted on rollback; a
//! retry republishes from the last checkpoint (at-least-once).

use crate::checkpoint::CheckpointSink;
use crate::context::StepContext;
use crate::error::Result;
use crate::metrics;
use crate::page_store::{PageStore, Pager, TxHandle};
use crate::publisher::{DEFAULT_TOPIC, Publisher};
use crate::resilience::{RateLimitConfig, RateLimiter};
use crate::transaction::with_transaction;
use crate::types::{BoxFuture, Cursor, PageResult, Progress};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default number of entities per step.
pub const DEFAULT_PAGE_LIMIT: u32 = 100;

/// Default number of entities per store round-trip.
pub const DEFAULT_BATCH_SIZE: u32 = 25;

/// Anything that can run one step of a walk.
///
/// The seam between the orchestrator and the engine, and the capability the
/// instrumentation decorator wraps.
pub trait StepRunner: Send + Sync {
    fn run_step<'a>(
        &'a self,
        ctx: &'a StepContext,
        cursor: Cursor,
        checkpoint: &'a dyn CheckpointSink,
    ) -> BoxFuture<'a, PageResult>;
}

impl<R: StepRunner + ?Sized> StepRunner for Arc<R> {
    fn run_step<'a>(
        &'a self,
        ctx: &'a StepContext,
        cursor: Cursor,
        checkpoint: &'a dyn CheckpointSink,
    ) -> BoxFuture<'a, PageResult> {
        (**self).run_step(ctx, cursor, checkpoint)
    }
}

/// Tunables for [`FanoutEngine`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Topic every entity is published to.
    pub topic: String,
    /// Page cap: entities per step.
    pub page_limit: u32,
    /// Entities per store round-trip; a checkpoint follows each one.
    pub batch_size: u32,
    /// Pause before each checkpoint (back-pressure simulation).
    pub processing_delay: Duration,
    /// Publish throttle. `None` publishes as fast as the broker acks.
    pub publish_rate: Option<RateLimitConfig>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            page_limit: DEFAULT_PAGE_LIMIT,
            batch_size: DEFAULT_BATCH_SIZE,
            processing_delay: Duration::ZERO,
            publish_rate: None,
        }
    }
}

/// Reads pages from `S` and publishes each entity through `P`.
pub struct FanoutEngine<S, P> {
    store: Arc<S>,
    publisher: Arc<P>,
    settings: EngineSettings,
    limiter: Option<RateLimiter>,
}

impl<S: PageStore, P: Publisher> FanoutEngine<S, P> {
    pub fn new(store: Arc<S>, publisher: Arc<P>, settings: EngineSettings) -> Self {
        let limiter = settings.publish_rate.clone().map(RateLimiter::new);
        Self {
            store,
            publisher,
            settings,
            limiter,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn publisher(&self) -> &Arc<P> {
        &self.publisher
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Run one step starting at `cursor`.
    pub async fn step(
        &self,
        ctx: &StepContext,
        cursor: Cursor,
        checkpoint: &dyn CheckpointSink,
    ) -> Result<PageResult> {
        ctx.check()?;

        let result = with_transaction(self.store.as_ref(), ctx, |tx_ctx, tx| {
            self.publish_page(tx_ctx, tx, cursor, checkpoint)
        })
        .await?;

        debug!(
            page_number = result.page_number,
            from = cursor.offset,
            to = result.offset,
            has_more = result.has_more,
            "Step committed"
        );
        Ok(result)
    }

    async fn publish_page(
        &self,
        ctx: StepContext,
        tx: TxHandle<S::Tx>,
        cursor: Cursor,
        checkpoint: &dyn CheckpointSink,
    ) -> Result<PageResult> {
        let topic = self.settings.topic.as_str();
        let mut pager = Pager::new(cursor.offset, self.settings.page_limit, self.settings.batch_size);
        let mut running = cursor.offset;

        while let Some(batch) = pager.next_batch(&ctx, self.store.as_ref(), &tx).await? {
            for entity in &batch {
                if let Some(limiter) = &self.limiter {
                    ctx.guard(async {
                        limiter.acquire().await;
                        Ok(())
                    })
                    .await?;
                }

                let key = entity.key();
                if let Err(e) = ctx.guard(self.publisher.publish(topic, &key)).await {
                    debug!(id = entity.id, key = %key, error = %e, "Publish failed, abandoning page");
                    return Err(e);
                }
                running = running.max(entity.id);
            }
            metrics::record_entities_published(topic, batch.len());

            if !self.settings.processing_delay.is_zero() {
                let delay = self.settings.processing_delay;
                ctx.guard(async {
                    tokio::time::sleep(delay).await;
                    Ok(())
                })
                .await?;
            }

            self.emit_checkpoint(&ctx, checkpoint, Progress::new(cursor.page_number, running))
                .await?;
        }

        Ok(PageResult {
            offset: running,
            has_more: pager.has_more(),
            page_number: cursor.page_number,
        })
    }

    /// Sink failures are tolerated. Only cancellation or the deadline firing
    /// while the sink runs stops the step.
    async fn emit_checkpoint(
        &self,
        ctx: &StepContext,
        sink: &dyn CheckpointSink,
        progress: Progress,
    ) -> Result<()> {
        match ctx.guard(sink.record(progress)).await {
            Ok(()) => {
                metrics::record_checkpoint(true);
                debug!(page_number = progress.page_number, offset = progress.offset, "Checkpoint recorded");
            }
            Err(e) => {
                ctx.check()?;
                metrics::record_checkpoint(false);
                warn!(
                    page_number = progress.page_number,
                    offset = progress.offset,
                    error = %e,
                    "Checkpoint sink failed, continuing"
                );
            }
        }
        Ok(())
    }
}

impl<S: PageStore, P: Publisher> StepRunner for FanoutEngine<S, P> {
    fn run_step<'a>(
        &'a self,
        ctx: &'a StepContext,
        cursor: Cursor,
        checkpoint: &'a dyn CheckpointSink,
    ) -> BoxFuture<'a, PageResult> {
        Box::pin(self.step(ctx, cursor, checkpoint))
    }
}
