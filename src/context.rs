//! Per-step execution context.
//!
//! Carries only what may travel implicitly: the cancellation token, the
//! attempt deadline, and whether a transaction is already open. The
//! transaction handle itself is passed as an explicit parameter.

use crate::error::{FanoutError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation, deadline and transaction nesting for one step.
#[derive(Debug, Clone)]
pub struct StepContext {
    cancel: CancellationToken,
    deadline: Option<(Instant, Duration)>,
    in_transaction: bool,
}

impl StepContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
            in_transaction: false,
        }
    }

    /// Context that is never cancelled. Mostly for tests and one-off tools.
    pub fn background() -> Self {
        Self::new(CancellationToken::new())
    }

    /// Same cancellation, bounded to `timeout` from now.
    ///
    /// An earlier deadline already on `self` is kept.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let at = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some((existing, existing_timeout)) if existing <= at => (existing, existing_timeout),
            _ => (at, timeout),
        };
        Self {
            cancel: self.cancel.clone(),
            deadline: Some(deadline),
            in_transaction: self.in_transaction,
        }
    }

    pub(crate) fn enter_transaction(&self) -> Self {
        Self {
            cancel: self.cancel.clone(),
            deadline: self.deadline,
            in_transaction: true,
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail if the step was cancelled or its deadline passed.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(FanoutError::Cancelled);
        }
        if let Some((at, timeout)) = self.deadline
            && Instant::now() >= at
        {
            return Err(FanoutError::DeadlineExceeded(timeout));
        }
        Ok(())
    }

    /// Race `fut` against cancellation and the deadline.
    ///
    /// Dropping `fut` early is fine for reads; a publish already handed to
    /// the broker may still land (at-least-once).
    pub async fn guard<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        let deadline = async {
            match self.deadline {
                Some((at, timeout)) => {
                    tokio::time::sleep_until(at).await;
                    timeout
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(FanoutError::Cancelled),
            timeout = deadline => Err(FanoutError::DeadlineExceeded(timeout)),
            res = fut => res,
        }
    }
}

impl Default for StepContext {
    fn default() -> Self {
        Self::background()
    }
}
