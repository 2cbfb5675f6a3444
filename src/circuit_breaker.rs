//! Circuit breaker around the broker.
//!
//! When the broker keeps failing, every step would otherwise open a
//! transaction, read a page, and fail on the first publish. The breaker
//! fails those publishes fast instead, which the orchestrator treats like
//! any other publish error (rollback, backoff, retry).
//!
//! # States
//!
//! - **Closed**: Normal operation, publishes pass through
//! - **Open**: Broker unhealthy, publishes fail without reaching it
//! - **HalfOpen**: Probing whether the broker recovered
//!
//! # Usage
//!
//! ```rust,no_run
//! # use fanout_engine::circuit_breaker::{CircuitPublisher, CircuitConfig};
//! # use fanout_engine::publisher::{NoOpPublisher, Publisher};
//! # async fn example() -> fanout_engine::Result<()> {
//! let publisher = CircuitPublisher::new(NoOpPublisher, CircuitConfig::default());
//! publisher.publish("EntityUpserted", "3f1c…").await?;
//! # Ok(())
//! # }
//! ```

use crate::error::FanoutError;
use crate::metrics;
use crate::publisher::Publisher;
use crate::types::BoxFuture;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Error type for circuit-protected operations.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open).
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed.
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    /// Check if this is a rejection (circuit open).
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitError::Rejected)
    }

    /// Get the inner error if present.
    pub fn inner(&self) -> Option<&E> {
        match self {
            CircuitError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Number of consecutive failures to trip the circuit.
    pub failure_threshold: u32,
    /// Number of consecutive successes in half-open to close circuit.
    pub success_threshold: u32,
    /// How long to wait before attempting recovery (half-open).
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Fast recovery for testing.
    pub fn testing() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// A named circuit breaker with call accounting.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let threshold = config.failure_threshold.max(1);
        // Trips once every call in the closed window failed.
        let error_rate = (threshold - 1) as f32 / threshold as f32;
        let recloser = Recloser::custom()
            .error_rate(error_rate)
            .closed_len(threshold as usize)
            .half_open_len(config.success_threshold.max(1) as usize)
            .open_wait(config.recovery_timeout)
            .build();

        let name = name.into();
        metrics::set_circuit_state(&name, "closed");

        Self {
            name,
            inner: recloser.into(),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute an async operation through the circuit breaker.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(&self.name, "success");
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
                metrics::record_circuit_rejection(&self.name);
                metrics::set_circuit_state(&self.name, "open");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "Circuit call failed");
                metrics::record_circuit_call(&self.name, "failure");
                Err(CircuitError::Inner(e))
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}

/// Publisher decorator that fails fast while the broker is unhealthy.
pub struct CircuitPublisher<P> {
    inner: P,
    breaker: CircuitBreaker,
}

impl<P: Publisher> CircuitPublisher<P> {
    pub fn new(inner: P, config: CircuitConfig) -> Self {
        Self {
            inner,
            breaker: CircuitBreaker::new("broker", config),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

impl<P: Publisher> Publisher for CircuitPublisher<P> {
    fn publish<'a>(&'a self, topic: &'a str, key: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.breaker
                .call(|| self.inner.publish(topic, key))
                .await
                .map_err(|e| match e {
                    CircuitError::Rejected => {
                        FanoutError::publish_msg(topic, key, "broker circuit open, publish rejected")
                    }
                    CircuitError::Inner(inner) => inner,
                })
        })
    }
}
