//! Walk state and outcome types.
//!
//! # State Transitions
//!
//! ```text
//!              run()
//! Pending ───────────→ Running ←──────────────┐
//!                       │  │  │               │ (backoff elapsed)
//!        (has_more=false)  │  │ (retryable    │
//!                       │  │  └─ error) → AwaitingRetry
//!                       ↓  │                  │
//!                 Completed│                  │ (retries exhausted,
//!                          │ (non-retryable)  │  cancelled)
//!                          ↓                  ↓
//!                        Failed ←─────────────┘
//! ```
//!
//! `Running → Running` on every step that returns `has_more = true`.
//! Completed and Failed walks may be run again; a completed walk returns at
//! once, a failed one resumes from its persisted cursor.

use crate::types::Cursor;
use serde::Serialize;

/// State of one walk.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WalkState {
    /// Created, `run()` not called yet.
    Pending,

    /// A step is executing (or about to).
    Running,

    /// The last step failed with a retryable error; waiting out the backoff.
    AwaitingRetry,

    /// The last step reported `has_more = false`.
    Completed,

    /// Retries exhausted or the error was not retryable.
    Failed,
}

impl WalkState {
    /// True while `run()` is in progress.
    pub fn is_active(&self) -> bool {
        matches!(self, WalkState::Running | WalkState::AwaitingRetry)
    }
}

impl std::fmt::Display for WalkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WalkState::Pending => write!(f, "Pending"),
            WalkState::Running => write!(f, "Running"),
            WalkState::AwaitingRetry => write!(f, "AwaitingRetry"),
            WalkState::Completed => write!(f, "Completed"),
            WalkState::Failed => write!(f, "Failed"),
        }
    }
}

/// Summary of a finished walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalkReport {
    pub walk_id: String,
    /// Steps that committed during this `run()`.
    pub steps: u32,
    /// Step attempts during this `run()`, retries included.
    pub attempts: usize,
    pub final_offset: u32,
    pub last_page: u32,
    /// Persisted cursor the run started from, if it continued an earlier one.
    pub resumed_from: Option<Cursor>,
}
