//! # Fan-out Engine
//!
//! Walks an ordered entity set in bounded pages, publishes one message per
//! entity to a broker, and records enough progress that the walk can be
//! interrupted anywhere and resumed without skipping entities.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                               fanout-engine                               │
//! │                                                                           │
//! │  ┌──────────────┐  cursor   ┌──────────────┐  page   ┌──────────────────┐ │
//! │  │ Orchestrator │──────────►│ FanoutEngine │────────►│ PageStore        │ │
//! │  │ (retry loop) │◄──────────│ (one step =  │         │ (Postgres/SQLite)│ │
//! │  └──────────────┘ PageResult│  one tx)     │────────►└──────────────────┘ │
//! │         │                   └──────────────┘ publish ┌──────────────────┐ │
//! │         ▼                          │        ────────►│ Publisher        │ │
//! │  ┌───────────────┐   checkpoint    │                 │ (Redis Streams)  │ │
//! │  │ ProgressStore │◄────────────────┘                 └──────────────────┘ │
//! │  │ (SQLite)      │                                                        │
//! │  └───────────────┘                                                        │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - Offsets never decrease across the steps of a walk
//! - Every entity above the starting offset is published at least once
//! - A retried step resumes from `max(input offset, last checkpoint)`
//! - Delivery is at-least-once; consumers must tolerate duplicates
//!
//! ## Usage
//!
//! ```rust,no_run
//! use fanout_engine::{
//!     EngineSettings, FanoutEngine, InMemoryPageStore, NoOpPublisher, Orchestrator,
//!     OrchestratorSettings, ProgressStore, StepContext,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> fanout_engine::Result<()> {
//!     let store = Arc::new(InMemoryPageStore::with_ids(1..=30));
//!     let engine = FanoutEngine::new(store, Arc::new(NoOpPublisher), EngineSettings::default());
//!     let progress = Arc::new(ProgressStore::in_memory().await?);
//!
//!     let orchestrator = Orchestrator::new("entity-fanout", engine, progress, OrchestratorSettings::default());
//!     let report = orchestrator.run(&StepContext::background()).await?;
//!     assert_eq!(report.final_offset, 30);
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod circuit_breaker;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod instrument;
pub mod metrics;
pub mod orchestrator;
pub mod page_store;
pub mod progress;
pub mod publisher;
pub mod resilience;
pub mod transaction;
pub mod types;

// Re-exports for convenience
pub use checkpoint::{CheckpointSink, NoOpCheckpointSink, ProgressSink, resume_offset};
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitPublisher};
pub use config::{BrokerConfig, FanoutConfig, ProgressConfig, StoreConfig, WalkConfig};
pub use context::StepContext;
pub use engine::{EngineSettings, FanoutEngine, StepRunner};
pub use error::{FanoutError, Result};
pub use instrument::{InstrumentedPublisher, InstrumentedRunner, InstrumentedStore};
pub use orchestrator::{Orchestrator, OrchestratorSettings, WalkReport, WalkState, execute_step};
pub use page_store::{InMemoryPageStore, PageStore, PgPageStore, SqlitePageStore, TxHandle, read_page};
pub use progress::{ProgressStore, WalkCursor};
pub use publisher::{NoOpPublisher, Publisher, RedisStreamPublisher};
pub use transaction::with_transaction;
pub use types::{Cursor, Entity, PageResult, Progress};
