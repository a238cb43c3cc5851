//! Bounded exponential backoff for calls against the Kubernetes API.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::IbuError;

/// Backoff schedule: `steps` attempts, the delay between them grows by `factor`
/// and never exceeds `cap`.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub steps: u32,
    pub duration: Duration,
    pub factor: f64,
    pub cap: Duration,
}

impl Backoff {
    /// Schedule used for conflicting writes (5 attempts, 10ms apart).
    pub const DEFAULT_RETRY: Self = Self {
        steps: 5,
        duration: Duration::from_millis(10),
        factor: 1.0,
        cap: Duration::from_secs(1),
    };

    /// Schedule used for remote reads (4 attempts, 10ms growing x5).
    pub const DEFAULT_BACKOFF: Self = Self {
        steps: 4,
        duration: Duration::from_millis(10),
        factor: 5.0,
        cap: Duration::from_secs(10),
    };

    /// Delays to sleep between consecutive attempts (`steps - 1` entries).
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let mut next = self.duration;
        (1..self.steps).map(move |_| {
            let current = next.min(self.cap);
            next = next.mul_f64(self.factor.max(1.0)).min(self.cap);
            current
        })
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::DEFAULT_BACKOFF
    }
}

/// Invoke `op` until it succeeds, fails with an error `retriable` rejects,
/// or the schedule is exhausted. The last error is returned.
pub async fn retry_on<T, E, F, Fut, R>(backoff: &Backoff, retriable: R, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut delays = backoff.delays();
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Remote call succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if retriable(&e) => match delays.next() {
                Some(delay) => {
                    warn!(
                        attempt,
                        max_attempts = backoff.steps,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Retriable error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
}

/// [`retry_on`] with the standard transient-error classification.
pub async fn retry_transient<T, F, Fut>(backoff: &Backoff, op: F) -> Result<T, IbuError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, IbuError>>,
{
    retry_on(backoff, IbuError::is_retriable, op).await
}
