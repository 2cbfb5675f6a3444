//! One resumable step attempt.

use crate::checkpoint::{CheckpointSink, resume_cursor};
use crate::context::StepContext;
use crate::engine::StepRunner;
use crate::error::Result;
use crate::metrics;
use crate::progress::ProgressStore;
use crate::types::{Cursor, PageResult};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Run the step for `input`, resuming from its last snapshot.
///
/// The attempt starts at `max(input.offset, snapshot.offset)`. After a
/// commit the snapshot is discarded; after a failure the pending snapshots
/// are flushed so a crash before the retry still keeps them.
pub async fn execute_step<R: StepRunner + ?Sized>(
    ctx: &StepContext,
    runner: &R,
    progress: &ProgressStore,
    sink: &dyn CheckpointSink,
    walk_id: &str,
    input: Cursor,
) -> Result<PageResult> {
    let prior = progress.snapshot(walk_id, input.page_number).await;
    let cursor = resume_cursor(input, prior);
    if cursor.offset > input.offset {
        info!(
            walk_id,
            page_number = input.page_number,
            from = input.offset,
            resumed_at = cursor.offset,
            "Resuming step from checkpoint"
        );
        metrics::record_step_resumed(walk_id, cursor.offset - input.offset);
    }

    let started = Instant::now();
    match runner.run_step(ctx, cursor, sink).await {
        Ok(result) => {
            metrics::record_step(walk_id, "success", started.elapsed());
            if let Err(e) = progress.discard(walk_id, input.page_number).await {
                // A stale snapshot never exceeds the committed page end.
                warn!(walk_id, page_number = input.page_number, error = %e, "Failed to discard step snapshot");
            }
            debug!(walk_id, page_number = result.page_number, offset = result.offset, "Step succeeded");
            Ok(result)
        }
        Err(e) => {
            let outcome = if e.is_retryable() { "retryable_error" } else { "fatal_error" };
            metrics::record_step(walk_id, outcome, started.elapsed());
            if let Err(flush_err) = progress.flush_dirty().await {
                warn!(walk_id, error = %flush_err, "Failed to flush snapshots after step failure");
            }
            Err(e)
        }
    }
}
