//! Core data types shared by the store, engine and orchestrator.
//!
//! ```text
//! Cursor { offset, page_number }            step input
//!    │
//!    ▼  FanoutEngine::run_step
//! Progress { page_number, offset }          emitted during the step (0..n)
//!    │
//!    ▼
//! PageResult { offset, has_more, page_number }   step output
//! ```
//!
//! `offset` is always the highest entity id known to be published. It never
//! decreases across the steps of one walk.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

/// Boxed future returned by the store, publisher and runner traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = crate::error::Result<T>> + Send + 'a>>;

/// One record of the source set.
///
/// `id` is assigned by the store and drives pagination. `external_id` is the
/// message key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: u32,
    pub external_id: Uuid,
}

impl Entity {
    pub fn new(id: u32, external_id: Uuid) -> Self {
        Self { id, external_id }
    }

    /// Message key in hyphenated string form.
    pub fn key(&self) -> String {
        self.external_id.to_string()
    }
}

/// Step input: where the page starts and which page this is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub offset: u32,
    pub page_number: u32,
}

impl Cursor {
    /// Start of a fresh walk.
    pub fn start() -> Self {
        Self::default()
    }

    pub fn new(offset: u32, page_number: u32) -> Self {
        Self { offset, page_number }
    }

    /// Cursor for the step after `result`.
    pub fn next(result: &PageResult) -> Self {
        Self {
            offset: result.offset,
            page_number: result.page_number.saturating_add(1),
        }
    }
}

/// Step output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResult {
    pub offset: u32,
    pub has_more: bool,
    pub page_number: u32,
}

/// Checkpoint snapshot emitted while a step is in flight.
///
/// Handed back verbatim when the step is retried, so the retry can skip
/// what the failed attempt already published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub page_number: u64,
    pub offset: u32,
}

impl Progress {
    pub fn new(page_number: u32, offset: u32) -> Self {
        Self {
            page_number: u64::from(page_number),
            offset,
        }
    }
}
