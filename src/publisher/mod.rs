//! Broker side of the fan-out: one message per entity.
//!
//! A [`Publisher`] either acknowledges a message or reports it failed. It
//! never retries by itself; a failed publish fails the whole step, and the
//! step is what gets retried. Delivery is at-least-once, so consumers must
//! tolerate duplicates.

pub mod redis_stream;

pub use redis_stream::RedisStreamPublisher;

use crate::types::BoxFuture;
use std::sync::Arc;
use tracing::debug;

/// Default topic (stream name) for entity messages.
pub const DEFAULT_TOPIC: &str = "EntityUpserted";

/// At-least-once message sink.
///
/// Must be safe to share process-wide across unrelated walks.
pub trait Publisher: Send + Sync + 'static {
    /// Publish one message keyed by `key` and wait for the broker's ack.
    fn publish<'a>(&'a self, topic: &'a str, key: &'a str) -> BoxFuture<'a, ()>;
}

impl<P: Publisher + ?Sized> Publisher for Arc<P> {
    fn publish<'a>(&'a self, topic: &'a str, key: &'a str) -> BoxFuture<'a, ()> {
        (**self).publish(topic, key)
    }
}

impl<P: Publisher + ?Sized> Publisher for Box<P> {
    fn publish<'a>(&'a self, topic: &'a str, key: &'a str) -> BoxFuture<'a, ()> {
        (**self).publish(topic, key)
    }
}

/// Accepts every message and drops it. For dry runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpPublisher;

impl Publisher for NoOpPublisher {
    fn publish<'a>(&'a self, topic: &'a str, key: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            debug!(topic, key, "NoOp: publish");
            Ok(())
        })
    }
}
