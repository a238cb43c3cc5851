//! Cancellable poll-until-true wait.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::error::IbuError;

/// Evaluate `condition` every `interval` until it returns `true` or an error.
///
/// The first evaluation happens after one interval. Cancellation of `cancel`
/// ends the wait with [`IbuError::Cancelled`] naming `waiting_for`.
pub async fn poll_until<F, Fut>(
    cancel: &CancellationToken,
    interval: Duration,
    waiting_for: &str,
    mut condition: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(IbuError::Cancelled(waiting_for.to_string()).into());
            }
            () = tokio::time::sleep(interval) => {}
        }

        if condition().await? {
            return Ok(());
        }
    }
}
