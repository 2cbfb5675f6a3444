//! Shared test utilities for integration, property and chaos tests.
//!
//! This module provides:
//! - Postgres and Redis testcontainer setup
//! - A recording publisher with scripted failures
//! - A recording checkpoint sink
//! - Entity and engine builders

#[allow(dead_code)]
pub mod containers;
pub mod mock_publisher;

#[allow(unused_imports)]
pub use containers::*;
#[allow(unused_imports)]
pub use mock_publisher::*;

use fanout_engine::{EngineSettings, Entity, FanoutEngine, InMemoryPageStore, OrchestratorSettings};
use fanout_engine::resilience::RetryConfig;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Deterministic external id for entity `id`.
#[allow(dead_code)]
pub fn key_for(id: u32) -> String {
    Uuid::from_u128(u128::from(id)).to_string()
}

/// Entities `1..=n` with deterministic external ids.
#[allow(dead_code)]
pub fn entities(n: u32) -> Vec<Entity> {
    (1..=n)
        .map(|id| Entity::new(id, Uuid::from_u128(u128::from(id))))
        .collect()
}

/// Engine settings with a small page so walks take several steps.
#[allow(dead_code)]
pub fn small_pages(page_limit: u32, batch_size: u32) -> EngineSettings {
    EngineSettings {
        page_limit,
        batch_size,
        ..EngineSettings::default()
    }
}

/// Orchestrator settings with fast retries.
#[allow(dead_code)]
pub fn fast_retries(max_attempts: usize) -> OrchestratorSettings {
    OrchestratorSettings {
        retry: RetryConfig {
            max_attempts,
            ..RetryConfig::testing()
        },
        step_timeout: Duration::from_secs(5),
        durable_checkpoints: false,
    }
}

/// In-memory engine over ids `1..=n`.
#[allow(dead_code)]
pub fn memory_engine(
    n: u32,
    publisher: Arc<RecordingPublisher>,
    settings: EngineSettings,
) -> FanoutEngine<InMemoryPageStore, RecordingPublisher> {
    FanoutEngine::new(Arc::new(InMemoryPageStore::with_ids(1..=n)), publisher, settings)
}
