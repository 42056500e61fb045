//! Retry-wrapped remote calls.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use icebox_transfer::{RetryContext, RetryDecision};
use tokio_util::sync::CancellationToken;

use crate::error::{RemoteError, Stage, VaultError};
use crate::types::{EventSink, TransferEvent};

/// A failure that may or may not be worth another attempt.
pub(crate) trait Retryable: Display {
    fn is_retryable(&self) -> bool;

    /// Converts a non-retryable failure into the workflow error.
    fn into_fatal(self, stage: Stage) -> VaultError;
}

impl Retryable for RemoteError {
    fn is_retryable(&self) -> bool {
        RemoteError::is_retryable(self)
    }

    fn into_fatal(self, stage: Stage) -> VaultError {
        VaultError::Rejected {
            stage,
            source: self,
        }
    }
}

/// Sleeps for `delay` unless `cancel` fires first.
pub(crate) async fn pause(cancel: &CancellationToken, delay: Duration) -> Result<(), VaultError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(VaultError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

pub(crate) fn check_cancelled(cancel: &CancellationToken) -> Result<(), VaultError> {
    if cancel.is_cancelled() {
        Err(VaultError::Cancelled)
    } else {
        Ok(())
    }
}

/// Handles one failed attempt: fatal errors and exhausted budgets end the
/// loop, otherwise waits out the backoff delay.
pub(crate) async fn back_off<E: Retryable>(
    ctx: &mut RetryContext,
    stage: Stage,
    err: E,
    cancel: &CancellationToken,
    events: &EventSink,
) -> Result<(), VaultError> {
    if !err.is_retryable() {
        return Err(err.into_fatal(stage));
    }
    match ctx.record_failure(&err) {
        RetryDecision::Retry { attempt, delay } => {
            events.emit(TransferEvent::Retrying {
                stage,
                attempt,
                error: err.to_string(),
            });
            pause(cancel, delay).await
        }
        RetryDecision::Abort { attempts } => Err(VaultError::RetriesExhausted {
            stage,
            attempts,
            last_error: err.to_string(),
        }),
    }
}

/// Runs `op` until it succeeds, fails fatally, or exhausts `ctx`.
pub(crate) async fn with_retry<T, E, F, Fut>(
    ctx: &mut RetryContext,
    stage: Stage,
    cancel: &CancellationToken,
    events: &EventSink,
    mut op: F,
) -> Result<T, VaultError>
where
    E: Retryable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    loop {
        check_cancelled(cancel)?;
        match op().await {
            Ok(value) => {
                ctx.record_success();
                return Ok(value);
            }
            Err(err) => back_off(ctx, stage, err, cancel, events).await?,
        }
    }
}
