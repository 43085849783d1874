//! Bounded retry with exponential backoff
//!
//! Resolver requests and transfers both go through [`retry_with_backoff`], so a
//! single [`RetryPolicy`] decides, per attempt and error, whether to try again.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::{HarvestError, Result};
use super::progress::{ProgressCallback, ProgressEvent};

/// What to do after a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self { max_retries, base_delay, max_delay }
    }

    /// Backoff before retry number `attempt + 1`, doubling from the base delay
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let factor = 2_u64.saturating_pow(attempt.min(32) as u32);
        let delay = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay.as_millis() as u64))
    }

    /// `attempt` counts the attempts that already failed, starting at 1
    pub fn decide(&self, attempt: usize, error: &HarvestError) -> RetryDecision {
        if !error.is_recoverable() || attempt > self.max_retries {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAfter(self.delay_for(attempt - 1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(1000), Duration::from_secs(60))
    }
}

/// Run `operation` until it succeeds, the policy gives up, or the run is cancelled
///
/// Recoverable errors that exhaust the budget are returned as
/// [`HarvestError::Transfer`]; anything else is returned as-is.
pub async fn retry_with_backoff<F, T, Fut>(
    policy: &RetryPolicy,
    label: &str,
    progress_callback: Option<&ProgressCallback>,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let error = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if error.is_cancelled() {
            return Err(error);
        }

        match policy.decide(attempt, &error) {
            RetryDecision::GiveUp if error.is_recoverable() => {
                debug!("Giving up on {} after {} attempt(s): {}", label, attempt, error);
                return Err(HarvestError::Transfer {
                    url: label.to_string(),
                    attempts: attempt,
                    last_error: error.to_string(),
                });
            }
            RetryDecision::GiveUp => {
                debug!("Error is not recoverable, failing immediately: {}", error);
                return Err(error);
            }
            RetryDecision::RetryAfter(delay) => {
                debug!("Retry attempt {} for {} after {:?} delay: {}", attempt + 1, label, delay, error);
                if let Some(callback) = progress_callback {
                    callback(ProgressEvent::RetryAttempt {
                        label: label.to_string(),
                        attempt,
                        max_attempts: policy.max_retries,
                    });
                }
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(HarvestError::Cancelled { reason: format!("retry of {} aborted", label) });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
