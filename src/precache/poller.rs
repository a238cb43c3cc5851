//! Bounded-retry query of the precaching job status.

use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::IbuError;
use crate::ops::PrepOps;
use crate::precache::JobPhase;
use crate::prep::task::Progress;

/// What a cancelled wait on the precaching job was waiting for.
pub const WAITING_FOR: &str = "precaching job completed";

/// Fetches the job status up to `retries` times, `interval` apart.
#[derive(Debug, Clone)]
pub struct StatusPoller {
    pub retries: u32,
    pub interval: Duration,
}

impl StatusPoller {
    pub const fn new(retries: u32, interval: Duration) -> Self {
        Self { retries, interval }
    }

    /// One poll round.
    ///
    /// Returns `Ok(true)` once the job succeeded and `Ok(false)` while it is
    /// still running (after publishing its progress). A failed job ends the
    /// round immediately with [`IbuError::PrecacheFailed`]; running out of
    /// attempts without a definite answer is [`IbuError::PrecacheStatusExhausted`].
    /// Cancellation of `cancel` between attempts ends the round with
    /// [`IbuError::Cancelled`].
    pub async fn check(&self, ops: &dyn PrepOps, progress: &Progress, cancel: &CancellationToken) -> Result<bool> {
        for attempt in 1..=self.retries {
            match ops.query_precache_status().await {
                Ok(Some(status)) => match status.phase {
                    JobPhase::Succeeded => {
                        info!("Precaching job succeeded");
                        return Ok(true);
                    }
                    JobPhase::Failed => {
                        warn!(message = %status.message, "Precaching job failed");
                        return Err(IbuError::PrecacheFailed.into());
                    }
                    JobPhase::Active => {
                        let message = if status.message.is_empty() {
                            "Precaching in progress".to_string()
                        } else {
                            format!("Precaching progress: {}", status.message)
                        };
                        debug!(%message, "Precaching job still active");
                        progress.set(message);
                        return Ok(false);
                    }
                },
                Err(e) if matches!(IbuError::find_in(&e), Some(IbuError::PrecacheFailed)) => {
                    return Err(e);
                }
                Ok(None) => debug!(attempt, "Precaching job status not available yet"),
                Err(e) => warn!(attempt, error = %e, "Failed to get precaching job status"),
            }

            if attempt < self.retries {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        return Err(IbuError::Cancelled(WAITING_FOR.to_string()).into());
                    }
                    () = tokio::time::sleep(self.interval) => {}
                }
            }
        }

        Err(IbuError::PrecacheStatusExhausted(self.retries).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::fake::{FakeOps, StatusReply};
    use crate::precache::JobStatus;
    use crate::precache::wait::poll_until;
    use tokio_util::sync::CancellationToken;

    const INTERVAL: Duration = Duration::from_secs(30);

    fn active(message: &str) -> StatusReply {
        StatusReply::Status(JobStatus::new(JobPhase::Active, message))
    }

    fn fake(statuses: Vec<StatusReply>) -> (tempfile::TempDir, FakeOps) {
        let host = tempfile::tempdir().unwrap();
        let ops = FakeOps::new(host.path()).with_statuses(statuses);
        (host, ops)
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_then_succeeded_stops_after_third_query() {
        let (_host, ops) = fake(vec![
            active("1/3 images"),
            active("2/3 images"),
            StatusReply::Status(JobStatus::new(JobPhase::Succeeded, "")),
            active("should never be read"),
        ]);
        let poller = StatusPoller::new(5, INTERVAL);
        let progress = Progress::default();
        let cancel = CancellationToken::new();

        poll_until(&cancel, INTERVAL, WAITING_FOR, || {
            poller.check(&ops, &progress, &cancel)
        })
        .await
        .unwrap();

        assert_eq!(ops.count("query_precache_status"), 3);
        assert_eq!(progress.get(), "Precaching progress: 2/3 images");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_returns_immediately() {
        let (_host, ops) = fake(vec![StatusReply::Status(JobStatus::new(JobPhase::Failed, "pull error"))]);
        let poller = StatusPoller::new(5, INTERVAL);
        let started = tokio::time::Instant::now();

        let err = poller.check(&ops, &Progress::default(), &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(IbuError::find_in(&err), Some(IbuError::PrecacheFailed)));
        assert_eq!(ops.count("query_precache_status"), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_sentinel_from_query_error() {
        let (_host, ops) = fake(vec![StatusReply::JobFailed]);
        let poller = StatusPoller::new(5, INTERVAL);

        let err = poller.check(&ops, &Progress::default(), &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(IbuError::find_in(&err), Some(IbuError::PrecacheFailed)));
        assert_eq!(ops.count("query_precache_status"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_indeterminate_results_exhaust_budget() {
        let (_host, ops) = fake(vec![
            StatusReply::Pending,
            StatusReply::Error("connection reset".to_string()),
            StatusReply::Pending,
        ]);
        let poller = StatusPoller::new(3, INTERVAL);
        let started = tokio::time::Instant::now();

        let err = poller.check(&ops, &Progress::default(), &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(
            IbuError::find_in(&err),
            Some(IbuError::PrecacheStatusExhausted(3))
        ));
        assert_eq!(
            err.to_string(),
            "Failed more than 3 times to fetch precaching job status"
        );
        assert_eq!(ops.count("query_precache_status"), 3);
        // No sleep after the last attempt
        assert_eq!(started.elapsed(), INTERVAL * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_without_message() {
        let (_host, ops) = fake(vec![active("")]);
        let poller = StatusPoller::new(5, INTERVAL);
        let progress = Progress::default();

        assert!(!poller.check(&ops, &progress, &CancellationToken::new()).await.unwrap());
        assert_eq!(progress.get(), "Precaching in progress");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_between_attempts_stops_querying() {
        let (_host, ops) = fake(vec![StatusReply::Pending; 5]);
        let poller = StatusPoller::new(5, INTERVAL);
        let progress = Progress::default();
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();

        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(INTERVAL + Duration::from_secs(1)).await;
            token.cancel();
        });

        let err = poll_until(&cancel, INTERVAL, WAITING_FOR, || {
            poller.check(&ops, &progress, &cancel)
        })
        .await
        .unwrap_err();

        assert!(matches!(IbuError::find_in(&err), Some(IbuError::Cancelled(_))));
        assert_eq!(err.to_string(), "Context canceled before precaching job completed");
        assert_eq!(ops.count("query_precache_status"), 1);
        assert_eq!(started.elapsed(), INTERVAL + Duration::from_secs(1));
    }
}
