// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Walk orchestrator.
//!
//! Drives one logical walk step by step, strictly sequentially:
//! - Feeds each step's [`PageResult`] into the next step's [`Cursor`]
//! - Retries failed steps with exponential backoff, resuming each retry
//!   from the step's last checkpoint
//! - Persists the walk cursor after every committed step, so a restarted
//!   process continues where the last one stopped
//!
//! # Retry Policy
//!
//! The step is the unit of retry. Store errors, publish errors and step
//! deadline expiry are retried; caller cancellation, panics and
//! programming faults are not. When retries run out the walk fails with
//! [`FanoutError::WalkFailed`], carrying the last known offset.

mod step;
mod types;

pub use step::execute_step;
pub use types::{WalkReport, WalkState};

use crate::checkpoint::{ProgressSink, resume_offset};
use crate::context::StepContext;
use crate::engine::StepRunner;
use crate::error::{FanoutError, Result};
use crate::metrics;
use crate::progress::ProgressStore;
use crate::resilience::RetryConfig;
use crate::types::{Cursor, PageResult, Progress};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Default walk identity.
pub const DEFAULT_WALK_ID: &str = "entity-fanout";

/// Retry and timeout policy of a walk.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub retry: RetryConfig,
    /// Deadline of each step attempt.
    pub step_timeout: Duration,
    /// Flush every checkpoint to disk instead of debouncing.
    pub durable_checkpoints: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            step_timeout: Duration::from_secs(600),
            durable_checkpoints: false,
        }
    }
}

/// Runs one walk to completion.
pub struct Orchestrator<R> {
    walk_id: String,
    runner: R,
    progress: Arc<ProgressStore>,
    settings: OrchestratorSettings,

    /// Walk state (broadcast to watchers)
    state_tx: watch::Sender<WalkState>,
    state_rx: watch::Receiver<WalkState>,

    /// Latest in-flight checkpoint
    progress_tx: Arc<watch::Sender<Option<Progress>>>,
}

impl<R: StepRunner> Orchestrator<R> {
    pub fn new(
        walk_id: impl Into<String>,
        runner: R,
        progress: Arc<ProgressStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(WalkState::Pending);
        let (progress_tx, _) = watch::channel(None);
        let walk_id = walk_id.into();
        metrics::set_walk_state(&walk_id, "Pending");

        Self {
            walk_id,
            runner,
            progress,
            settings,
            state_tx,
            state_rx,
            progress_tx: Arc::new(progress_tx),
        }
    }

    pub fn walk_id(&self) -> &str {
        &self.walk_id
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn progress_store(&self) -> &Arc<ProgressStore> {
        &self.progress
    }

    /// Get current walk state.
    pub fn state(&self) -> WalkState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<WalkState> {
        self.state_rx.clone()
    }

    /// Get a receiver for the latest checkpoint of the running step.
    pub fn progress_receiver(&self) -> watch::Receiver<Option<Progress>> {
        self.progress_tx.subscribe()
    }

    fn set_state(&self, state: WalkState) {
        self.state_tx.send_replace(state);
        metrics::set_walk_state(&self.walk_id, &state.to_string());
    }

    /// Run the walk until a step reports `has_more = false`.
    ///
    /// Continues from the persisted walk cursor if there is one. A walk
    /// already recorded as completed returns at once.
    pub async fn run(&self, ctx: &StepContext) -> Result<WalkReport> {
        let mut busy = None;
        let claimed = self.state_tx.send_if_modified(|state| {
            if state.is_active() {
                busy = Some(*state);
                false
            } else {
                *state = WalkState::Running;
                true
            }
        });
        if !claimed {
            return Err(FanoutError::InvalidState {
                expected: "Pending, Completed or Failed".to_string(),
                actual: busy.map_or_else(|| "unknown".to_string(), |s| s.to_string()),
            });
        }
        metrics::set_walk_state(&self.walk_id, "Running");

        let outcome = self.walk(ctx).await;

        if let Err(e) = self.progress.flush_dirty().await {
            warn!(walk_id = %self.walk_id, error = %e, "Failed to flush progress at end of run");
        }

        match &outcome {
            Ok(_) => self.set_state(WalkState::Completed),
            Err(_) => self.set_state(WalkState::Failed),
        }
        outcome
    }

    async fn walk(&self, ctx: &StepContext) -> Result<WalkReport> {
        let mut persisted = self.progress.load_walk(&self.walk_id).await?;

        // A finished walk is walked again from the start, picking up rows
        // added since. Only an unfinished one resumes.
        if let Some(saved) = persisted
            && saved.completed
        {
            info!(
                walk_id = %self.walk_id,
                previous_offset = saved.cursor.offset,
                "Previous walk completed, starting over"
            );
            self.progress.delete_walk(&self.walk_id).await?;
            persisted = None;
        }

        let resumed_from = persisted.map(|w| w.cursor);
        let mut cursor = resumed_from.unwrap_or_else(Cursor::start);
        info!(
            walk_id = %self.walk_id,
            offset = cursor.offset,
            page_number = cursor.page_number,
            resumed = resumed_from.is_some(),
            "Walk starting"
        );

        let sink = ProgressSink::new(Arc::clone(&self.progress), self.walk_id.clone())
            .durable(self.settings.durable_checkpoints)
            .broadcast_to(Arc::clone(&self.progress_tx));

        let mut steps = 0u32;
        let mut attempts = 0usize;
        loop {
            let (result, used) = self.step_with_retry(ctx, cursor, &sink).await?;
            steps = steps.saturating_add(1);
            attempts = attempts.saturating_add(used);
            metrics::set_walk_offset(&self.walk_id, result.offset);

            if result.has_more {
                cursor = Cursor::next(&result);
                self.progress.save_walk(&self.walk_id, cursor, false).await?;
                continue;
            }

            let last = Cursor::new(result.offset, result.page_number);
            self.progress.save_walk(&self.walk_id, last, true).await?;
            info!(
                walk_id = %self.walk_id,
                steps,
                attempts,
                final_offset = result.offset,
                "Walk completed"
            );
            return Ok(WalkReport {
                walk_id: self.walk_id.clone(),
                steps,
                attempts,
                final_offset: result.offset,
                last_page: result.page_number,
                resumed_from,
            });
        }
    }

    /// Run the step at `cursor` until it commits or retries run out.
    async fn step_with_retry(
        &self,
        ctx: &StepContext,
        cursor: Cursor,
        sink: &ProgressSink,
    ) -> Result<(PageResult, usize)> {
        let retry = &self.settings.retry;
        let mut attempt = 0usize;

        loop {
            attempt = attempt.saturating_add(1);
            if attempt > 1 {
                self.set_state(WalkState::Running);
            }

            let attempt_ctx = ctx.with_timeout(self.settings.step_timeout);
            let err = match execute_step(&attempt_ctx, &self.runner, &self.progress, sink, &self.walk_id, cursor)
                .await
            {
                Ok(result) => return Ok((result, attempt)),
                Err(e) => e,
            };

            // The caller's own cancellation or deadline ends the walk.
            let caller_done = ctx.check().is_err();
            if !err.is_retryable() || caller_done || !retry.allows_retry(attempt) {
                return Err(self.walk_failed(cursor, attempt, err).await);
            }

            let delay = retry.delay_for_attempt(attempt);
            warn!(
                walk_id = %self.walk_id,
                page_number = cursor.page_number,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Step failed, retrying"
            );
            metrics::record_step_retry(&self.walk_id, attempt);
            self.set_state(WalkState::AwaitingRetry);

            let backoff = ctx
                .guard(async {
                    tokio::time::sleep(delay).await;
                    Ok(())
                })
                .await;
            if let Err(e) = backoff {
                return Err(self.walk_failed(cursor, attempt, e).await);
            }
        }
    }

    async fn walk_failed(&self, cursor: Cursor, attempts: usize, source: FanoutError) -> FanoutError {
        let snapshot = self.progress.snapshot(&self.walk_id, cursor.page_number).await;
        let last_offset = resume_offset(cursor.offset, snapshot);
        error!(
            walk_id = %self.walk_id,
            page_number = cursor.page_number,
            last_offset,
            attempts,
            error = %source,
            "Walk failed"
        );
        FanoutError::WalkFailed {
            walk_id: self.walk_id.clone(),
            page_number: cursor.page_number,
            last_offset,
            attempts,
            source: Box::new(source),
        }
    }
}
