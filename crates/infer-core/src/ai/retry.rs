//! Exponential backoff with jitter for gateway requests
//!
//! Only failures before the response stream opens are retried: rate
//! limits (429), transient server errors (500, 502, 503, 504), request
//! timeouts (408) and connection failures.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Errors that know whether another attempt could succeed
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;

    /// Server-requested delay, when one was sent
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

/// Delay before attempt `attempt + 1`, without jitter. `attempt` starts at 1.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let factor = u64::from(config.backoff_multiplier.max(1))
        .saturating_pow(attempt.saturating_sub(1));
    let ms = config
        .initial_backoff_ms
        .saturating_mul(factor)
        .min(config.max_backoff_ms);
    Duration::from_millis(ms)
}

fn with_jitter(delay: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 10;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempts run out.
pub async fn with_retry<T, E, F, Fut>(config: &RetryConfig, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + Display,
{
    let max_attempts = if config.enabled {
        config.max_attempts.max(1)
    } else {
        1
    };

    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Request succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) if attempt < max_attempts && error.is_retryable() => {
                let delay = error
                    .retry_after()
                    .unwrap_or_else(|| with_jitter(backoff_delay(config, attempt)));
                tracing::warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retryable request failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => {
                if attempt > 1 {
                    tracing::warn!(attempt, error = %error, "Giving up after retries");
                }
                return Err(error);
            }
        }
    }
}
