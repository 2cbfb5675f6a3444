//! Fuzz target for configuration parsing.
//!
//! Arbitrary JSON must either fail to parse, fail validation, or produce
//! settings whose derived durations and limits are usable.

#![no_main]

use fanout_engine::FanoutConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(config) = serde_json::from_slice::<FanoutConfig>(data) else {
        return;
    };
    if config.validate().is_err() {
        return;
    }

    let engine = config.engine_settings();
    assert!(engine.page_limit > 0);
    assert!(engine.batch_size > 0);
    let _ = config.orchestrator_settings();
    let _ = config.store.backend();
});
