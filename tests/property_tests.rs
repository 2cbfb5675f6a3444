//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

mod common;

use common::{RecordingPublisher, RecordingSink};
use fanout_engine::page_store::Pager;
use fanout_engine::resilience::RetryConfig;
use fanout_engine::{
    Cursor, EngineSettings, Entity, FanoutEngine, InMemoryPageStore, Orchestrator,
    OrchestratorSettings, Progress, ProgressStore, StepContext, resume_offset,
};
use proptest::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(fut)
}

fn settings(page_limit: u32, batch_size: u32) -> EngineSettings {
    EngineSettings {
        page_limit,
        batch_size,
        ..EngineSettings::default()
    }
}

/// Retries without backoff so failing cases stay fast.
fn instant_retries(max_attempts: usize) -> OrchestratorSettings {
    OrchestratorSettings {
        retry: RetryConfig {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..RetryConfig::testing()
        },
        step_timeout: Duration::from_secs(5),
        durable_checkpoints: false,
    }
}

fn id_of(key: &str) -> u32 {
    Uuid::parse_str(key).unwrap().as_u128() as u32
}

// =============================================================================
// Pager Properties
// =============================================================================

proptest! {
    /// Sub-batch limits never exceed the batch size or the remaining cap,
    /// and their sum never exceeds the page cap.
    #[test]
    fn pager_limits_stay_within_cap(
        page_limit in 0u32..200,
        batch_size in 0u32..64,
        available in 0u32..400,
    ) {
        let mut pager = Pager::new(0, page_limit, batch_size);
        let mut next_id = 1u32;
        let mut total = 0u32;

        while let Some(limit) = pager.next_limit() {
            prop_assert!(limit >= 1);
            prop_assert!(limit <= batch_size.max(1));
            prop_assert!(total + limit <= page_limit);

            let take = limit.min(available.saturating_sub(total));
            let batch: Vec<Entity> = (next_id..next_id + take)
                .map(|id| Entity::new(id, Uuid::from_u128(id as u128)))
                .collect();
            next_id += take;
            total += take;
            pager.accept(limit, &batch).unwrap();
            if take == 0 {
                break;
            }
        }

        prop_assert_eq!(pager.fetched(), total);
        prop_assert_eq!(total, page_limit.min(available));
        prop_assert_eq!(pager.has_more(), page_limit > 0 && total == page_limit);
    }

    /// A batch that does not ascend above the current offset is rejected.
    #[test]
    fn pager_rejects_non_ascending_batches(since in 1u32..1000, back in 0u32..1000) {
        let mut pager = Pager::new(since, 10, 10);
        let stale = since.saturating_sub(back);
        let batch = vec![Entity::new(stale, Uuid::nil())];
        prop_assert!(pager.accept(10, &batch).is_err());
    }

    /// Resuming never moves below the input offset or the snapshot.
    #[test]
    fn resume_offset_is_max_of_inputs(
        input in any::<u32>(),
        snapshot in proptest::option::of(any::<u32>()),
    ) {
        let prior = snapshot.map(|offset| Progress::new(0, offset));
        let resumed = resume_offset(input, prior);
        prop_assert!(resumed >= input);
        if let Some(offset) = snapshot {
            prop_assert!(resumed >= offset);
            prop_assert!(resumed == input || resumed == offset);
        } else {
            prop_assert_eq!(resumed, input);
        }
    }
}

// =============================================================================
// Walk Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// A healthy walk publishes every entity exactly once, in ascending id
    /// order, and takes floor(n / page_limit) + 1 steps.
    #[test]
    fn healthy_walk_publishes_each_entity_once(
        ids in proptest::collection::btree_set(1u32..5_000, 0..150),
        page_limit in 1u32..40,
        batch_size in 1u32..40,
    ) {
        let (published, report) = block_on(async {
            let publisher = Arc::new(RecordingPublisher::new());
            let engine = FanoutEngine::new(
                Arc::new(InMemoryPageStore::with_ids(ids.iter().copied())),
                Arc::clone(&publisher),
                settings(page_limit, batch_size),
            );
            let progress = Arc::new(ProgressStore::in_memory().await.unwrap());
            let orch = Orchestrator::new("prop", engine, progress, instant_retries(3));
            let report = orch.run(&StepContext::background()).await.unwrap();
            (publisher.published(), report)
        });

        let published_ids: Vec<u32> = published.iter().map(|k| id_of(k)).collect();
        let expected: Vec<u32> = ids.iter().copied().collect();
        prop_assert_eq!(&published_ids, &expected);

        let n = ids.len() as u32;
        prop_assert_eq!(report.steps, n / page_limit + 1);
        prop_assert_eq!(report.final_offset, ids.iter().next_back().copied().unwrap_or(0));
    }

    /// With transient publish failures and enough retries, nothing is
    /// skipped: every entity is published at least once.
    #[test]
    fn failures_never_skip_entities(
        n in 1u32..120,
        failing in proptest::collection::btree_set(0usize..200, 0..12),
        page_limit in 1u32..30,
        batch_size in 1u32..15,
    ) {
        let published = block_on(async {
            let publisher = Arc::new(RecordingPublisher::failing_calls(failing.iter().copied()));
            let engine = FanoutEngine::new(
                Arc::new(InMemoryPageStore::with_ids(1..=n)),
                Arc::clone(&publisher),
                settings(page_limit, batch_size),
            );
            let progress = Arc::new(ProgressStore::in_memory().await.unwrap());
            let orch = Orchestrator::new("prop", engine, progress, instant_retries(20));
            orch.run(&StepContext::background()).await.unwrap();
            publisher.published()
        });

        let seen: BTreeSet<u32> = published.iter().map(|k| id_of(k)).collect();
        prop_assert_eq!(seen, (1..=n).collect::<BTreeSet<u32>>());
    }

    /// Checkpoints of one step ascend, end at the step's offset and never
    /// go below the starting offset.
    #[test]
    fn checkpoints_are_monotonic_within_a_step(
        n in 0u32..120,
        start in 0u32..60,
        page_limit in 1u32..50,
        batch_size in 1u32..20,
    ) {
        let (offsets, result) = block_on(async {
            let engine = FanoutEngine::new(
                Arc::new(InMemoryPageStore::with_ids(1..=n)),
                Arc::new(RecordingPublisher::new()),
                settings(page_limit, batch_size),
            );
            let sink = RecordingSink::new();
            let result = engine
                .step(&StepContext::background(), Cursor::new(start, 0), &sink)
                .await
                .unwrap();
            (sink.offsets(), result)
        });

        prop_assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
        prop_assert!(offsets.iter().all(|o| *o >= start));
        prop_assert!(result.offset >= start);
        if let Some(last) = offsets.last() {
            prop_assert_eq!(*last, result.offset);
        }
    }

    /// Feeding each step's result into the next cursor never moves the
    /// offset backwards, and the chain ends on the highest id.
    #[test]
    fn step_offsets_never_decrease(
        ids in proptest::collection::btree_set(1u32..2_000, 0..120),
        start in 0u32..500,
        page_limit in 1u32..30,
        batch_size in 1u32..15,
    ) {
        let offsets = block_on(async {
            let engine = FanoutEngine::new(
                Arc::new(InMemoryPageStore::with_ids(ids.iter().copied())),
                Arc::new(RecordingPublisher::new()),
                settings(page_limit, batch_size),
            );
            let ctx = StepContext::background();
            let sink = RecordingSink::new();
            let mut cursor = Cursor::new(start, 0);
            let mut offsets = Vec::new();
            loop {
                let result = engine.step(&ctx, cursor, &sink).await.unwrap();
                offsets.push(result.offset);
                if !result.has_more {
                    break;
                }
                cursor = Cursor::next(&result);
            }
            offsets
        });

        prop_assert!(offsets.iter().all(|o| *o >= start));
        prop_assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
        let highest = ids.range(start + 1..).next_back().copied().unwrap_or(start);
        prop_assert_eq!(offsets.last().copied(), Some(highest));
    }

    /// Duplicates only come from retried steps: without failures each key
    /// appears once, with failures no key appears more often than the
    /// number of attempts.
    #[test]
    fn duplicates_bounded_by_attempts(
        n in 1u32..80,
        failing in proptest::collection::btree_set(0usize..100, 1..6),
    ) {
        let (published, attempts) = block_on(async {
            let publisher = Arc::new(RecordingPublisher::failing_calls(failing.iter().copied()));
            let engine = FanoutEngine::new(
                Arc::new(InMemoryPageStore::with_ids(1..=n)),
                Arc::clone(&publisher),
                settings(25, 10),
            );
            let progress = Arc::new(ProgressStore::in_memory().await.unwrap());
            let orch = Orchestrator::new("prop", engine, progress, instant_retries(20));
            let report = orch.run(&StepContext::background()).await.unwrap();
            (publisher.published(), report.attempts)
        });

        let mut counts: HashMap<String, usize> = HashMap::new();
        for key in &published {
            *counts.entry(key.clone()).or_default() += 1;
        }
        prop_assert!(counts.values().all(|c| *c <= attempts));
    }
}
