//! Retry and timeout helpers for network work.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::SwKitError;

/// How often, and how patiently, to repeat a failing operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts, at least 1.
    pub max_attempts: u32,
    /// Pause before the first retry; doubled for each later one.
    pub base_delay: Duration,
    /// Upper bound for a single pause.
    pub max_delay: Duration,
}

impl RetryConfig {
    /// `max_attempts` attempts with a 100ms doubling pause capped at 2s.
    /// Zero is treated as one attempt.
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }

    /// Replace the pause bounds.
    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay.max(base_delay);
        self
    }

    /// Pause after the `failures`-th failed attempt.
    pub fn backoff(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

/// Run `operation` until it succeeds or the attempts run out.
///
/// The error of the final attempt is returned.
pub async fn retry_with_backoff<T, E, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut failures = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if failures > 0 {
                    debug!(failures, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                failures += 1;
                if failures >= config.max_attempts {
                    return Err(e);
                }
                let pause = config.backoff(failures);
                warn!(failures, max_attempts = config.max_attempts, error = %e, ?pause, "Attempt failed, retrying");
                sleep(pause).await;
            }
        }
    }
}

/// Await `future`, giving up after `timeout`.
pub async fn with_timeout<T>(timeout: Duration, future: impl Future<Output = T>) -> Result<T, SwKitError> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| SwKitError::Timeout(timeout))
}
