//! Fuzz target for sub-batch arithmetic.
//!
//! Feeds the pager arbitrary caps and arbitrary (possibly hostile) batches.
//! It must never panic, never request past the page cap, and never move
//! its offset backwards.

#![no_main]

use fanout_engine::Entity;
use fanout_engine::page_store::Pager;
use libfuzzer_sys::fuzz_target;
use uuid::Uuid;

fuzz_target!(|data: (u32, u32, u32, Vec<Vec<u32>>)| {
    let (since, page_limit, batch_size, batches) = data;
    let mut pager = Pager::new(since, page_limit, batch_size);

    for ids in batches {
        let Some(limit) = pager.next_limit() else {
            break;
        };
        assert!(limit >= 1);
        assert!(limit <= page_limit - pager.fetched());

        let before = pager.last_id();
        let batch: Vec<Entity> = ids
            .into_iter()
            .map(|id| Entity::new(id, Uuid::nil()))
            .collect();

        if pager.accept(limit, &batch).is_ok() {
            assert!(pager.last_id() >= before);
            assert!(pager.fetched() <= page_limit);
        } else {
            break;
        }
    }
});
