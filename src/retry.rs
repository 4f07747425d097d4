//! Per-stage retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::models::Stage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
    /// Budget for a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.backoff_base_ms),
            multiplier: config.backoff_multiplier.max(1),
            max_delay: Duration::from_millis(config.backoff_max_ms),
            attempt_timeout: Duration::from_secs(config.stage_timeout_secs),
        }
    }

    /// Delay after the `failures`-th failed attempt (1-based), capped at
    /// `max_delay`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1);
        let factor = (self.multiplier as u64).saturating_pow(exp);
        let ms = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(ms).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails terminally, or the attempt limit
    /// is reached. Returns the result with the number of attempts made.
    ///
    /// An attempt exceeding `attempt_timeout` is dropped and fails the
    /// stage with [`PipelineError::Timeout`], which is never retried.
    pub async fn run<T, F, Fut>(&self, stage: Stage, mut op: F) -> (PipelineResult<T>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = PipelineResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(self.attempt_timeout, op(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(PipelineError::Timeout {
                    stage: stage.name().to_string(),
                    secs: self.attempt_timeout.as_secs(),
                }),
            };

            match outcome {
                Ok(value) => return (Ok(value), attempt),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        stage = %stage,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "stage failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }
}
