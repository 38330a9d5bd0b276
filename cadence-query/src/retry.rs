//! Attempt loop shared by queries and mutations.

use cadence_core::FetchError;
use std::time::Duration;
use tracing::debug;

use crate::config::RetryPolicy;
use crate::descriptor::FetchFuture;
use crate::signal::AbortSignal;

async fn with_timeout<T>(fut: FetchFuture<T>, timeout: Option<Duration>) -> Result<T, FetchError> {
    match timeout {
        None => fut.await,
        Some(after) => tokio::time::timeout(after, fut)
            .await
            .unwrap_or(Err(FetchError::Timeout { after })),
    }
}

/// Run `attempt` until it succeeds, fails permanently, or the policy is exhausted.
///
/// Only transient errors are retried. The signal is checked before every
/// attempt and raced against both the attempt and the backoff sleep.
pub(crate) async fn attempt_with_retry<T, F>(
    label: &str,
    retry: &RetryPolicy,
    timeout: Option<Duration>,
    signal: &AbortSignal,
    mut attempt: F,
) -> Result<T, FetchError>
where
    F: FnMut(AbortSignal) -> FetchFuture<T>,
{
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt_no = 0u32;
    loop {
        attempt_no += 1;
        if signal.is_aborted() {
            return Err(FetchError::Cancelled);
        }

        let result = tokio::select! {
            biased;
            _ = signal.aborted() => Err(FetchError::Cancelled),
            result = with_timeout(attempt(signal.clone()), timeout) => result,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt_no < max_attempts => {
                let delay = retry.delay_after(attempt_no);
                debug!(
                    label,
                    attempt = attempt_no,
                    max_attempts,
                    ?delay,
                    error = %err,
                    "transient failure, backing off"
                );
                tokio::select! {
                    biased;
                    _ = signal.aborted() => return Err(FetchError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => return Err(err),
        }
    }
}
