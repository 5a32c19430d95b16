//! Retry with exponential backoff for transient runtime errors

use super::config::RetryConfig;
use crate::container::AdapterResult;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

const BACKOFF_FACTOR: u32 = 2;

/// Exponential backoff policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Base delay after the given failed attempt (1-based), without jitter
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = BACKOFF_FACTOR.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Backoff plus up to 10% random jitter, still capped
    fn jittered(&self, attempt: u32) -> Duration {
        let base = self.backoff_for(attempt);
        let spread = base.as_millis() as u64 / 10;
        let jitter = if spread > 0 {
            rand::thread_rng().gen_range(0..=spread)
        } else {
            0
        };
        (base + Duration::from_millis(jitter)).min(self.max_backoff)
    }
}

/// Run `call` until it succeeds, fails with a non-transient error, or the
/// attempts are used up. The last error is returned.
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    subject: &str,
    mut call: F,
) -> AdapterResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AdapterResult<T>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.jittered(attempt);
                tracing::warn!(
                    operation,
                    subject,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient runtime error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
