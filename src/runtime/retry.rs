//! Bounded retries for engine calls

use crate::error::EngineError;
use std::future::Future;
use std::time::Duration;

/// How engine calls are bounded and retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; transient failures only
    pub max_retries: u32,
    /// Delay before the first retry, doubled each time
    pub backoff: Duration,
    /// Upper bound for a single attempt
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: Duration::from_millis(500),
            timeout: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn once(timeout: Duration) -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::ZERO,
            timeout,
        }
    }
}

/// Run `call` until it succeeds, fails permanently or retries run out.
///
/// An attempt that exceeds the timeout counts as a transient failure.
pub async fn run_with_retry<T, F, Fut>(
    what: &str,
    policy: &RetryPolicy,
    mut call: F,
) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut attempt: u32 = 0;
    let mut delay = policy.backoff;

    loop {
        let outcome = match tokio::time::timeout(policy.timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::transient(format!(
                "{} timed out after {:?}",
                what, policy.timeout
            ))),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                tracing::warn!(
                    "{} failed ({}), retry {}/{} in {:?}",
                    what,
                    e,
                    attempt,
                    policy.max_retries,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            Err(e) => {
                if e.is_transient() {
                    tracing::error!("{} failed after {} attempt(s): {}", what, attempt + 1, e);
                }
                return Err(e);
            }
        }
    }
}
