//! Scoped transactions with guaranteed release.
//!
//! [`with_transaction`] owns the transaction for exactly the duration of
//! one body:
//!
//! ```text
//! nested?  ──yes──► NestedTransaction (store untouched)
//!    │no
//! begin ─► body(ctx, handle)
//!             ├─ Ok(v)   ─► commit ─► Ok(v)        (commit failure is a hard error)
//!             ├─ Err(e)  ─► rollback ─► Err(e)
//!             └─ panic   ─► rollback ─► Panicked { message, backtrace }
//! ```
//!
//! The body gets the handle as a parameter and the context marked
//! in-transaction, so a second `with_transaction` from inside it fails
//! before reaching the store.

use crate::context::StepContext;
use crate::error::{FanoutError, Result};
use crate::metrics;
use crate::page_store::{PageStore, TxHandle};
use futures::FutureExt;
use std::any::Any;
use std::backtrace::Backtrace;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::{debug, error, warn};

/// Run `body` inside one store transaction.
pub async fn with_transaction<S, F, Fut, T>(store: &S, ctx: &StepContext, body: F) -> Result<T>
where
    S: PageStore,
    F: FnOnce(StepContext, TxHandle<S::Tx>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if ctx.in_transaction() {
        let backtrace = Backtrace::force_capture().to_string();
        error!(backtrace = %backtrace, "Nested transaction rejected");
        metrics::record_transaction("nested");
        return Err(FanoutError::NestedTransaction { backtrace });
    }

    let tx = store.begin().await?;
    let handle = TxHandle::open(tx);
    debug!("Transaction opened");

    let tx_ctx = ctx.enter_transaction();
    let body_handle = handle.clone();
    let outcome = AssertUnwindSafe(async move { body(tx_ctx, body_handle).await })
        .catch_unwind()
        .await;

    let Some(tx) = handle.close().await else {
        return Err(FanoutError::Internal(
            "transaction vanished from its handle before the scope ended".to_string(),
        ));
    };

    match outcome {
        Ok(Ok(value)) => {
            if let Err(e) = store.commit(tx).await {
                error!(error = %e, "Transaction commit failed");
                metrics::record_transaction("commit_failed");
                return Err(e);
            }
            debug!("Transaction committed");
            metrics::record_transaction("commit");
            Ok(value)
        }
        Ok(Err(e)) => {
            debug!(error = %e, "Step failed, rolling back");
            rollback_logged(store, tx).await;
            metrics::record_transaction("rollback");
            Err(e)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            let backtrace = Backtrace::force_capture().to_string();
            error!(panic = %message, "Step panicked inside transaction, rolling back");
            rollback_logged(store, tx).await;
            metrics::record_transaction("panic");
            Err(FanoutError::Panicked { message, backtrace })
        }
    }
}

/// Rollback failures are logged; the error that caused the rollback wins.
async fn rollback_logged<S: PageStore>(store: &S, tx: S::Tx) {
    if let Err(e) = store.rollback(tx).await {
        warn!(error = %e, "Rollback failed");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
