//! Observability decorators.
//!
//! Each wrapper implements the same trait as the component it wraps and
//! only adds spans, logs and metrics around the delegated call:
//!
//! ```text
//! Orchestrator ─► InstrumentedRunner<FanoutEngine<InstrumentedStore<S>, InstrumentedPublisher<P>>>
//! ```
//!
//! Core logic never depends on them; dropping a wrapper changes nothing but
//! telemetry.

use crate::checkpoint::CheckpointSink;
use crate::context::StepContext;
use crate::engine::StepRunner;
use crate::metrics;
use crate::page_store::PageStore;
use crate::publisher::Publisher;
use crate::types::{BoxFuture, Cursor, Entity, PageResult};
use std::time::Instant;
use tracing::{Instrument, debug, debug_span, info_span, warn};

/// [`PageStore`] wrapper recording each primitive.
pub struct InstrumentedStore<S> {
    inner: S,
}

impl<S: PageStore> InstrumentedStore<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: PageStore> PageStore for InstrumentedStore<S> {
    type Tx = S::Tx;

    fn begin(&self) -> BoxFuture<'_, Self::Tx> {
        Box::pin(async move {
            let started = Instant::now();
            let result = self.inner.begin().await;
            metrics::record_store_operation("begin", result.is_ok(), started.elapsed());
            result
        })
    }

    fn fetch_batch<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        since_offset: u32,
        limit: u32,
    ) -> BoxFuture<'a, Vec<Entity>> {
        let span = debug_span!(
            "store.fetch_batch",
            since = since_offset,
            limit,
            page.count = tracing::field::Empty,
            page.first = tracing::field::Empty,
            page.last = tracing::field::Empty,
        );
        Box::pin(
            async move {
                let started = Instant::now();
                let result = self.inner.fetch_batch(tx, since_offset, limit).await;
                let elapsed = started.elapsed();
                metrics::record_store_operation("fetch_batch", result.is_ok(), elapsed);

                match &result {
                    Ok(batch) => {
                        let span = tracing::Span::current();
                        span.record("page.count", batch.len());
                        if let (Some(first), Some(last)) = (batch.first(), batch.last()) {
                            span.record("page.first", first.id);
                            span.record("page.last", last.id);
                        }
                        metrics::record_batch_fetched(batch.len(), elapsed);
                        debug!(count = batch.len(), "Batch fetched");
                    }
                    Err(e) => warn!(error = %e, "Batch fetch failed"),
                }
                result
            }
            .instrument(span),
        )
    }

    fn commit(&self, tx: Self::Tx) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let started = Instant::now();
            let result = self.inner.commit(tx).await;
            metrics::record_store_operation("commit", result.is_ok(), started.elapsed());
            result
        })
    }

    fn rollback(&self, tx: Self::Tx) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let started = Instant::now();
            let result = self.inner.rollback(tx).await;
            metrics::record_store_operation("rollback", result.is_ok(), started.elapsed());
            result
        })
    }
}

/// [`StepRunner`] wrapper: one `fanout.step` span per step.
pub struct InstrumentedRunner<R> {
    inner: R,
    walk_id: String,
}

impl<R: StepRunner> InstrumentedRunner<R> {
    pub fn new(inner: R, walk_id: impl Into<String>) -> Self {
        Self {
            inner,
            walk_id: walk_id.into(),
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }
}

impl<R: StepRunner> StepRunner for InstrumentedRunner<R> {
    fn run_step<'a>(
        &'a self,
        ctx: &'a StepContext,
        cursor: Cursor,
        checkpoint: &'a dyn CheckpointSink,
    ) -> BoxFuture<'a, PageResult> {
        let span = info_span!(
            "fanout.step",
            walk_id = %self.walk_id,
            fanout.offset = cursor.offset,
            page.number = cursor.page_number,
            page.has_more = tracing::field::Empty,
            page.end = tracing::field::Empty,
        );
        Box::pin(
            async move {
                let started = Instant::now();
                let result = self.inner.run_step(ctx, cursor, checkpoint).await;
                match &result {
                    Ok(page) => {
                        let span = tracing::Span::current();
                        span.record("page.has_more", page.has_more);
                        span.record("page.end", page.offset);
                        debug!(
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            advanced_by = page.offset.saturating_sub(cursor.offset),
                            "Step finished"
                        );
                    }
                    Err(e) => warn!(error = %e, retryable = e.is_retryable(), "Step failed"),
                }
                result
            }
            .instrument(span),
        )
    }
}

/// [`Publisher`] wrapper counting acks and failures per topic.
pub struct InstrumentedPublisher<P> {
    inner: P,
}

impl<P: Publisher> InstrumentedPublisher<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

impl<P: Publisher> Publisher for InstrumentedPublisher<P> {
    fn publish<'a>(&'a self, topic: &'a str, key: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let started = Instant::now();
            let result = self.inner.publish(topic, key).await;
            metrics::record_publish_latency(topic, started.elapsed());
            if let Err(e) = &result {
                metrics::record_publish_failure(topic);
                debug!(topic, key, error = %e, "Publish failed");
            }
            result
        })
    }
}
