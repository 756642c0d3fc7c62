//! Exponential-backoff retry for transport operations.
//!
//! Connect and exec failures against a VM that is still booting are
//! expected; the retry facility wraps them with capped doubling delays.
//! Lifecycle steps (useradd, mount, and friends) are never retried here,
//! since repeating a half-applied privileged command is a side-effect
//! hazard.

use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::debug;

/// Retry policy: `max_attempts` tries with delays starting at
/// `initial_delay`, multiplied by `multiplier` after each attempt and capped
/// at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// The delay to sleep after a given 1-indexed attempt.
    pub(crate) fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = self.initial_delay.mul_f64(factor.max(0.0));
        delay.min(self.max_delay)
    }
}

/// Run `op` until it succeeds or `config.max_attempts` is exhausted.
///
/// The final error names the attempt count and wraps the last underlying
/// error. `label` describes the operation for the error message.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;

    for attempt in 1..=config.max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                debug!(
                    attempt,
                    max_attempts = config.max_attempts,
                    error = %e,
                    "{label} attempt failed"
                );
                last_error = Some(e);
            }
        }

        if attempt < config.max_attempts {
            tokio::time::sleep(config.delay_after(attempt)).await;
        }
    }

    let last = last_error.unwrap_or_else(|| anyhow!("no attempts were made"));
    Err(last.context(format!(
        "{label} failed after {} attempts",
        config.max_attempts
    )))
}
