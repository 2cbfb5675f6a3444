// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the fan-out engine.
//!
//! Errors are categorized by their source (page store, broker, progress
//! store, programming faults) and carry enough context to resume a walk
//! by hand when retries run out.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Store` | Mostly | Connection, query, commit/rollback failures |
//! | `Publish` | Yes | Broker unavailable, message rejected, circuit open |
//! | `DeadlineExceeded` | Yes | Step attempt ran past its timeout |
//! | `Cancelled` | No | Caller cancelled the walk |
//! | `ProgressStore` | No | Local SQLite errors (needs operator attention) |
//! | `NestedTransaction` | No | Programming fault, carries a backtrace |
//! | `TransactionClosed` | No | Handle used after its scope ended |
//! | `Panicked` | No | Step body panicked inside a transaction |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Orchestrator state machine violation |
//! | `WalkFailed` | No | Retries exhausted, carries the last known offset |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! The page store and the publisher never retry on their own. The
//! orchestrator consults [`FanoutError::is_retryable()`] and retries the
//! whole step; the individual publish is never the unit of retry.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for fan-out operations.
pub type Result<T> = std::result::Result<T, FanoutError>;

/// Errors that can occur while walking and publishing entities.
#[derive(Error, Debug)]
pub enum FanoutError {
    /// The caller cancelled the step.
    ///
    /// Checked before any store I/O and between publishes. Not retried by
    /// the orchestrator; the caller decides whether to run the walk again.
    #[error("Step cancelled")]
    Cancelled,

    /// The step attempt ran past its deadline.
    ///
    /// Raised cooperatively from inside the step, which rolls back first.
    /// Retryable: the next attempt resumes from the last checkpoint.
    #[error("Step deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    /// Page store error (connection, query, commit, rollback).
    #[error("Store error ({operation}): {message}")]
    Store {
        operation: String,
        message: String,
        #[source]
        source: Option<sqlx::Error>,
    },

    /// Broker rejected or failed to acknowledge a message.
    ///
    /// Fatal to the current step, which is rolled back and retried whole.
    #[error("Publish error ({topic}, key {key}): {message}")]
    Publish {
        topic: String,
        key: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// SQLite error while persisting walk progress.
    ///
    /// Not retryable - indicates local database issues that need attention.
    #[error("Progress store error: {0}")]
    ProgressStore(#[from] sqlx::Error),

    /// A transaction was requested while one is already active in this step.
    #[error("Nested transaction rejected: a transaction is already active in this step\n{backtrace}")]
    NestedTransaction { backtrace: String },

    /// A transaction handle was used after its scope committed or rolled back.
    #[error("Transaction handle used after its scope closed ({operation})")]
    TransactionClosed { operation: String },

    /// The transactional body panicked; the transaction was rolled back.
    #[error("Step panicked inside transaction: {message}\n{backtrace}")]
    Panicked { message: String, backtrace: String },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Orchestrator state machine violation.
    ///
    /// Occurs when `run()` is called on a walk that is already running.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// The walk gave up on a step.
    ///
    /// `last_offset` is the highest offset known published, so the walk can
    /// be resumed from there by hand.
    #[error("Walk {walk_id} failed at page {page_number} (last offset {last_offset}) after {attempts} attempt(s): {source}")]
    WalkFailed {
        walk_id: String,
        page_number: u32,
        last_offset: u32,
        attempts: usize,
        #[source]
        source: Box<FanoutError>,
    },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FanoutError {
    /// Create a store error from a sqlx::Error
    pub fn store(operation: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Store {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a store error without source
    pub fn store_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a publish error from a redis::RedisError
    pub fn publish(topic: impl Into<String>, key: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Publish {
            topic: topic.into(),
            key: key.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a publish error without source
    pub fn publish_msg(
        topic: impl Into<String>,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Publish {
            topic: topic.into(),
            key: key.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Check if the orchestrator should retry the step that produced this error
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store {
                operation, source, ..
            } => operation != "decode" && source.as_ref().is_none_or(is_transient_sqlx),
            Self::Publish { .. } => true,
            Self::DeadlineExceeded(_) => true,
            Self::Cancelled => false, // Caller policy
            Self::ProgressStore(_) => false,
            Self::NestedTransaction { .. } => false,
            Self::TransactionClosed { .. } => false,
            Self::Panicked { .. } => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::WalkFailed { .. } => false,
            Self::Internal(_) => false,
        }
    }

    /// True for caller-initiated cancellation (not deadline expiry).
    pub fn is_cancellation(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::WalkFailed { source, .. } => source.is_cancellation(),
            _ => false,
        }
    }
}

/// Decode and schema errors will fail the same way on every retry.
fn is_transient_sqlx(e: &sqlx::Error) -> bool {
    !matches!(
        e,
        sqlx::Error::Configuration(_)
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnIndexOutOfBounds { .. }
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::TypeNotFound { .. }
            | sqlx::Error::RowNotFound
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_store_connection() {
        let err = FanoutError::store("fetch_batch", sqlx::Error::PoolTimedOut);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("fetch_batch"));
    }

    #[test]
    fn test_not_retryable_store_decode() {
        let err = FanoutError::store("fetch_batch", sqlx::Error::ColumnNotFound("external_id".into()));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_store_decode_msg() {
        let err = FanoutError::store_msg("decode", "entity id 4294967296 out of range");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_is_retryable_store_msg() {
        let err = FanoutError::store_msg("commit", "connection reset");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_is_retryable_publish() {
        let err = FanoutError::publish_msg("EntityUpserted", "abc", "broker unavailable");
        assert!(err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains("EntityUpserted"));
        assert!(msg.contains("abc"));
    }

    #[test]
    fn test_is_retryable_deadline() {
        let err = FanoutError::DeadlineExceeded(Duration::from_secs(600));
        assert!(err.is_retryable());
        assert!(!err.is_cancellation());
    }

    #[test]
    fn test_not_retryable_cancelled() {
        let err = FanoutError::Cancelled;
        assert!(!err.is_retryable());
        assert!(err.is_cancellation());
    }

    #[test]
    fn test_not_retryable_nested_transaction() {
        let err = FanoutError::NestedTransaction {
            backtrace: "at fanout_engine::transaction".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("already active"));
        assert!(err.to_string().contains("fanout_engine::transaction"));
    }

    #[test]
    fn test_not_retryable_panicked() {
        let err = FanoutError::Panicked {
            message: "index out of bounds".to_string(),
            backtrace: String::new(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("index out of bounds"));
    }

    #[test]
    fn test_not_retryable_progress_store() {
        let err = FanoutError::from(sqlx::Error::PoolClosed);
        assert!(matches!(err, FanoutError::ProgressStore(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_invalid_state() {
        let err = FanoutError::InvalidState {
            expected: "Pending".to_string(),
            actual: "Running".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Pending"));
        assert!(err.to_string().contains("Running"));
    }

    #[test]
    fn test_walk_failed_reports_last_offset() {
        let err = FanoutError::WalkFailed {
            walk_id: "entity-fanout".to_string(),
            page_number: 3,
            last_offset: 275,
            attempts: 5,
            source: Box::new(FanoutError::publish_msg("EntityUpserted", "k", "timeout")),
        };
        assert!(!err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains("last offset 275"));
        assert!(msg.contains("page 3"));
        assert!(msg.contains("5 attempt"));
    }

    #[test]
    fn test_walk_failed_cancellation_passthrough() {
        let err = FanoutError::WalkFailed {
            walk_id: "w".to_string(),
            page_number: 0,
            last_offset: 0,
            attempts: 1,
            source: Box::new(FanoutError::Cancelled),
        };
        assert!(err.is_cancellation());
    }
}
