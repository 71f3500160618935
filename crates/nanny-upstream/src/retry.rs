//! Retry with exponential backoff for upstream calls.

use crate::error::UpstreamError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Add up to 50% random jitter to every delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// `initial * multiplier^attempt`, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_millis() as f64;
        let capped = (base * self.backoff_multiplier.powi(attempt as i32))
            .min(self.max_backoff.as_millis() as f64) as u64;
        let jitter = if self.jitter && capped > 1 {
            rand::thread_rng().gen_range(0..capped / 2)
        } else {
            0
        };
        Duration::from_millis(capped.saturating_add(jitter))
    }
}

/// Outcome of [`retry`]: the value, or the last error with the number of
/// attempts made.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Success(T),
    Exhausted {
        last_error: UpstreamError,
        attempts: u32,
    },
}

/// Run `operation` until it succeeds, fails permanently, or the retries run
/// out.
pub async fn retry<F, Fut, T>(config: &RetryConfig, operation: F) -> RetryOutcome<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return RetryOutcome::Success(value),
            Err(e) if !e.is_retryable() || attempt > config.max_retries => {
                return RetryOutcome::Exhausted {
                    last_error: e,
                    attempts: attempt,
                }
            }
            Err(e) => {
                let delay = config.backoff(attempt - 1);
                tracing::debug!("attempt {} failed ({}), retrying in {:?}", attempt, e, delay);
                tokio::time::sleep(delay).await;
            }
        }
    }
}
