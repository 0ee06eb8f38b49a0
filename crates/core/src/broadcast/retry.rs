use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::ApiError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3, base_delay_ms: 1_000 }
    }
}

impl RetryPolicy {
    /// `base_delay * 2^attempt`, saturating instead of overflowing.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let multiplier = 1_u64 << exponent;
        Duration::from_millis(self.base_delay_ms.saturating_mul(multiplier))
    }

    fn wait_for(&self, error: &ApiError, attempt: u32) -> Duration {
        error
            .retry_after()
            .filter(|retry_after| !retry_after.is_zero())
            .unwrap_or_else(|| self.backoff(attempt))
    }
}

/// Invokes `operation`, retrying only when it fails with
/// [`ApiError::RateLimited`] and retries remain. Every other failure is
/// returned as-is on the first occurrence.
pub async fn with_rate_limit_retry<T, F, Fut>(
    policy: &RetryPolicy,
    action_name: &str,
    mut operation: F,
) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 0_u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_rate_limited() && attempt < policy.max_retries => {
                let wait = policy.wait_for(&error, attempt);
                warn!(
                    event_name = "broadcast.retry.rate_limited",
                    action = action_name,
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                    "rate limited; waiting before retry"
                );
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
