//! Recording doubles for the publisher and checkpoint seams.
//!
//! Records every acknowledged publish and every checkpoint for assertions.
//! Failures are scripted by call number (0-indexed, counting failed calls).

use fanout_engine::types::BoxFuture;
use fanout_engine::{CheckpointSink, FanoutError, Progress, Publisher};
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Publisher that records acknowledged keys.
///
/// # Example
/// ```rust,ignore
/// let publisher = Arc::new(RecordingPublisher::failing_calls([14]));
/// // run a walk...
/// assert_eq!(publisher.published().len(), 34);
/// ```
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<(String, String)>>,
    fail_calls: HashSet<usize>,
    /// Calls allowed before every call fails (0 = never).
    fail_from: AtomicUsize,
    panic_on: Option<usize>,
    broken: AtomicBool,
    calls: AtomicUsize,
}

#[allow(dead_code)]
impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail exactly the given calls.
    pub fn failing_calls(calls: impl IntoIterator<Item = usize>) -> Self {
        Self {
            fail_calls: calls.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Succeed `n` times, then fail every call until [`heal`](Self::heal).
    pub fn failing_from(n: usize) -> Self {
        let publisher = Self::default();
        publisher.fail_from.store(n + 1, Ordering::SeqCst);
        publisher
    }

    /// Fail every call until [`heal`](Self::heal).
    pub fn broken() -> Self {
        let publisher = Self::default();
        publisher.broken.store(true, Ordering::SeqCst);
        publisher
    }

    /// Panic on the given call.
    pub fn panicking_on(call: usize) -> Self {
        Self {
            panic_on: Some(call),
            ..Default::default()
        }
    }

    pub fn heal(&self) {
        self.broken.store(false, Ordering::SeqCst);
        self.fail_from.store(0, Ordering::SeqCst);
    }

    /// Acknowledged keys, in publish order.
    pub fn published(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(_, key)| key.clone())
            .collect()
    }

    /// Topics of acknowledged publishes.
    pub fn topics(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Publisher for RecordingPublisher {
    fn publish<'a>(&'a self, topic: &'a str, key: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panic_on == Some(n) {
                panic!("publisher state corrupted at call {}", n);
            }
            let fail_from = self.fail_from.load(Ordering::SeqCst);
            let exhausted = fail_from > 0 && n + 1 >= fail_from;
            if self.broken.load(Ordering::SeqCst) || exhausted || self.fail_calls.contains(&n) {
                return Err(FanoutError::publish_msg(topic, key, "broker unavailable"));
            }
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), key.to_string()));
            Ok(())
        })
    }
}

/// Checkpoint sink that records every progress report.
#[derive(Default)]
pub struct RecordingSink {
    recorded: Mutex<Vec<Progress>>,
    failing: AtomicBool,
}

#[allow(dead_code)]
impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose every report fails after being recorded.
    pub fn failing() -> Self {
        let sink = Self::default();
        sink.failing.store(true, Ordering::SeqCst);
        sink
    }

    pub fn recorded(&self) -> Vec<Progress> {
        self.recorded.lock().unwrap().clone()
    }

    pub fn offsets(&self) -> Vec<u32> {
        self.recorded().iter().map(|p| p.offset).collect()
    }
}

impl CheckpointSink for RecordingSink {
    fn record(&self, progress: Progress) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.recorded.lock().unwrap().push(progress);
            if self.failing.load(Ordering::SeqCst) {
                return Err(FanoutError::Internal("checkpoint sink unavailable".to_string()));
            }
            Ok(())
        })
    }
}
