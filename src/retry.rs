use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{AttrGenError, Result};

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; a request runs at most `max_retries + 1` times.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Backoff before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.max(1.0).powi(retry.saturating_sub(1) as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Runs `operation` until it succeeds, fails with an error `classify` rejects,
/// or the retry budget is spent. `operation` receives the 0-based attempt number.
/// `hint` can stretch the backoff for a given error (e.g. a Retry-After header),
/// but never beyond `max_delay`.
pub async fn execute_with_retry<T, Op, Fut, Classify, Hint>(
    policy: &RetryPolicy,
    classify: Classify,
    hint: Hint,
    mut operation: Op,
) -> Result<T>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    Classify: Fn(&AttrGenError) -> bool,
    Hint: Fn(&AttrGenError) -> Option<Duration>,
{
    let mut attempt: u32 = 0;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < policy.max_retries && classify(&error) => {
                attempt += 1;
                let mut delay = policy.delay_for(attempt);
                if let Some(requested) = hint(&error) {
                    delay = delay.max(requested.min(policy.max_delay));
                }
                warn!(
                    attempt = attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "LLM request failed; retrying"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(error) => return Err(error),
        }
    }
}
