//! Bounded exponential backoff for external API calls

use crate::config::RetryPolicy;
use crate::error::ApiError;
use std::future::Future;
use tracing::debug;

/// Run `op` until it succeeds, fails with a non-transient error, or the policy
/// runs out of attempts. Returns the last error on exhaustion.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut retry = 0u32;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && retry + 1 < attempts => {
                let delay = policy.delay_for(retry);
                debug!(
                    operation,
                    attempt = retry + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying after backoff"
                );
                tokio::time::sleep(delay).await;
                retry += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
