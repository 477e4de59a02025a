//! Bounded retry with backoff for transient provider failures.

use ragline_kernel::config::RetryConfig;
use ragline_kernel::error::{PipelineError, PipelineResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{Instrument, debug, warn};

/// Delay strategy between retry attempts.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum RetryBackoff {
    /// Fixed delay between each retry.
    Fixed(Duration),
    /// Delay doubles each attempt, capped at `max`.
    Exponential { base: Duration, max: Duration },
    /// Exponential backoff plus a random offset in `[-jitter/2, jitter/2)`.
    ExponentialWithJitter {
        base: Duration,
        max: Duration,
        jitter: Duration,
    },
}

impl RetryBackoff {
    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed(d) => *d,
            Self::Exponential { base, max } => exponential(*base, *max, attempt),
            Self::ExponentialWithJitter { base, max, jitter } => {
                let capped = exponential(*base, *max, attempt).as_millis() as i64;
                let jitter_ms = jitter.as_millis() as i64;
                let offset = if jitter_ms > 0 {
                    rand::thread_rng().gen_range(0..jitter_ms) - jitter_ms / 2
                } else {
                    0
                };
                Duration::from_millis((capped + offset).max(0) as u64)
            }
        }
    }
}

fn exponential(base: Duration, max: Duration, attempt: u32) -> Duration {
    let multiplier = 2u32.saturating_pow(attempt.min(16));
    base.saturating_mul(multiplier).min(max)
}

/// How often, and how patiently, a provider call is retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = no retry)
    pub max_retries: u32,
    pub backoff: RetryBackoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: RetryBackoff::Exponential {
                base: config.base_delay(),
                max: config.max_delay(),
            },
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: RetryBackoff::Fixed(Duration::ZERO),
        }
    }

    pub fn new(max_retries: u32, backoff: RetryBackoff) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Run `op`, retrying transient failures.
    ///
    /// Permanent errors are returned as-is on the first occurrence. When the
    /// retries of a transient error run out the result is
    /// [`PipelineError::RetriesExhausted`].
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> PipelineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PipelineResult<T>>,
    {
        let max_attempts = self.max_retries.saturating_add(1);
        let mut attempt = 0u32;
        loop {
            let span = tracing::info_span!("ragline.retry_attempt", operation, attempt, max_attempts);
            if attempt > 0 {
                let delay = self.backoff.delay_for(attempt - 1);
                debug!(
                    "Retry attempt {}/{} of {} after {}ms",
                    attempt + 1,
                    max_attempts,
                    operation,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).instrument(span.clone()).await;
            }

            match op().instrument(span).await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt + 1 < max_attempts => {
                    warn!(
                        "{} failed (attempt {}): {}, retrying",
                        operation,
                        attempt + 1,
                        error
                    );
                    attempt += 1;
                }
                Err(error) if error.is_transient() => {
                    return Err(PipelineError::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt + 1,
                        last_error: error.to_string(),
                    });
                }
                Err(error) => return Err(error),
            }
        }
    }
}
