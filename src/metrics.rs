//! Metrics for observability.
//!
//! Thin wrappers over the `metrics` facade. The library installs no
//! exporter; the binary (or the embedding service) decides where they go.
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `fanout_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use fanout_engine::metrics;
//! use std::time::Duration;
//!
//! metrics::record_entities_published("EntityUpserted", 25);
//! metrics::record_step("entity-fanout", "success", Duration::from_millis(420));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Step Metrics
// =============================================================================

/// Record one step attempt and how it ended.
pub fn record_step(walk_id: &str, outcome: &str, duration: Duration) {
    counter!(
        "fanout_steps_total",
        "walk_id" => walk_id.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("fanout_step_duration_seconds", "walk_id" => walk_id.to_string())
        .record(duration.as_secs_f64());
}

/// Record a step retry scheduled by the orchestrator.
pub fn record_step_retry(walk_id: &str, attempt: usize) {
    counter!("fanout_step_retries_total", "walk_id" => walk_id.to_string()).increment(1);
    gauge!("fanout_step_attempt", "walk_id" => walk_id.to_string()).set(attempt as f64);
}

/// Record a step resumed from a checkpoint ahead of its input offset.
pub fn record_step_resumed(walk_id: &str, skipped: u32) {
    counter!("fanout_step_resumes_total", "walk_id" => walk_id.to_string()).increment(1);
    histogram!("fanout_step_resume_skip", "walk_id" => walk_id.to_string()).record(f64::from(skipped));
}

/// Gauge for the committed walk offset.
pub fn set_walk_offset(walk_id: &str, offset: u32) {
    gauge!("fanout_walk_offset", "walk_id" => walk_id.to_string()).set(f64::from(offset));
}

/// Gauge for walk state.
pub fn set_walk_state(walk_id: &str, state: &str) {
    let value = match state {
        "Pending" => 0.0,
        "Running" => 1.0,
        "AwaitingRetry" => 2.0,
        "Completed" => 3.0,
        "Failed" => 4.0,
        _ => -1.0,
    };
    gauge!("fanout_walk_state", "walk_id" => walk_id.to_string()).set(value);
}

// =============================================================================
// Store Metrics
// =============================================================================

/// Record one sub-batch read from the page store.
pub fn record_batch_fetched(count: usize, duration: Duration) {
    counter!("fanout_batches_fetched_total").increment(1);
    counter!("fanout_entities_read_total").increment(count as u64);
    histogram!("fanout_fetch_duration_seconds").record(duration.as_secs_f64());
}

/// Record how a transaction ended (commit, rollback, panic, nested, commit_failed).
pub fn record_transaction(outcome: &str) {
    counter!("fanout_transactions_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record store operation latency by operation type.
pub fn record_store_operation(operation: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "fanout_store_operations_total",
        "operation" => operation.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!("fanout_store_operation_duration_seconds", "operation" => operation.to_string())
        .record(duration.as_secs_f64());
}

// =============================================================================
// Publish Metrics
// =============================================================================

/// Record entities published to a topic.
pub fn record_entities_published(topic: &str, count: usize) {
    counter!("fanout_entities_published_total", "topic" => topic.to_string()).increment(count as u64);
}

/// Record a publish the broker failed or rejected.
pub fn record_publish_failure(topic: &str) {
    counter!("fanout_publish_failures_total", "topic" => topic.to_string()).increment(1);
}

/// Record publish latency.
pub fn record_publish_latency(topic: &str, duration: Duration) {
    histogram!("fanout_publish_duration_seconds", "topic" => topic.to_string())
        .record(duration.as_secs_f64());
}

// =============================================================================
// Checkpoint Metrics
// =============================================================================

/// Record a checkpoint emission from inside a step.
pub fn record_checkpoint(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("fanout_checkpoints_total", "status" => status).increment(1);
}

/// Record progress flush batch (debounced writes).
pub fn record_progress_flush(flushed: usize, errors: usize) {
    counter!("fanout_progress_flushes_total").increment(1);
    counter!("fanout_progress_flushed_count").increment(flushed as u64);
    if errors > 0 {
        counter!("fanout_progress_flush_errors_total").increment(errors as u64);
    }
}

/// Record progress store SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn progress_retries_total(operation: &str) {
    counter!("fanout_progress_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Circuit Breaker Metrics
// =============================================================================

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "fanout_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set circuit breaker state gauge (0=closed, 1=half_open, 2=open).
pub fn set_circuit_state(circuit_name: &str, state: &str) {
    let value = match state {
        "closed" => 0.0,
        "half_open" => 1.0,
        "open" => 2.0,
        _ => -1.0,
    };
    gauge!("fanout_circuit_state", "circuit" => circuit_name.to_string()).set(value);
}

/// Record circuit breaker rejection (circuit was open).
pub fn record_circuit_rejection(circuit_name: &str) {
    counter!(
        "fanout_circuit_rejections_total",
        "circuit" => circuit_name.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    // No recorder is installed in tests; these only check nothing panics.

    #[test]
    fn test_record_step() {
        record_step("walk-1", "success", Duration::from_millis(50));
        record_step("walk-1", "retryable_error", Duration::ZERO);
        record_step("", "fatal_error", Duration::from_secs(600));
    }

    #[test]
    fn test_record_step_retry_and_resume() {
        record_step_retry("walk-1", 1);
        record_step_retry("walk-1", usize::MAX);
        record_step_resumed("walk-1", 0);
        record_step_resumed("walk-1", 75);
    }

    #[test]
    fn test_set_walk_state_all_states() {
        set_walk_state("walk-1", "Pending");
        set_walk_state("walk-1", "Running");
        set_walk_state("walk-1", "AwaitingRetry");
        set_walk_state("walk-1", "Completed");
        set_walk_state("walk-1", "Failed");
        // Unknown state should map to -1
        set_walk_state("walk-1", "Unknown");
    }

    #[test]
    fn test_set_walk_offset() {
        set_walk_offset("walk-1", 0);
        set_walk_offset("walk-1", u32::MAX);
    }

    #[test]
    fn test_store_metrics() {
        record_batch_fetched(25, Duration::from_millis(3));
        record_batch_fetched(0, Duration::ZERO);
        record_transaction("commit");
        record_transaction("panic");
        record_store_operation("begin", true, Duration::from_micros(200));
        record_store_operation("commit", false, Duration::from_millis(1));
    }

    #[test]
    fn test_publish_metrics() {
        record_entities_published("EntityUpserted", 100);
        record_publish_failure("EntityUpserted");
        record_publish_latency("EntityUpserted", Duration::from_millis(2));
    }

    #[test]
    fn test_checkpoint_metrics() {
        record_checkpoint(true);
        record_checkpoint(false);
        record_progress_flush(3, 0);
        record_progress_flush(1, 2);
        progress_retries_total("progress_flush");
    }

    #[test]
    fn test_set_circuit_state_all_states() {
        set_circuit_state("broker", "closed");
        set_circuit_state("broker", "half_open");
        set_circuit_state("broker", "open");
        set_circuit_state("broker", "unknown");
        record_circuit_call("broker", "success");
        record_circuit_rejection("broker");
    }
}
