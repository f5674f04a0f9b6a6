//! Timeout and bounded-retry policy wrapped around multi-step repository writes
//!
//! Each attempt runs under `tokio::time::timeout`. Serialization conflicts are
//! replayed with exponential backoff and jitter; anything else fails at once.

use crate::error::{AppError, AppResult};
use crate::repository::RepoResult;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct TransactionPolicy {
    /// Upper bound for one attempt
    pub timeout: Duration,
    /// Replays after the first attempt
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Add random jitter to backoff (±30%)
    pub jitter: bool,
}

impl Default for TransactionPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            jitter: true,
        }
    }
}

impl TransactionPolicy {
    pub fn with_timeout(timeout: Duration, max_retries: u32) -> Self {
        Self {
            timeout,
            max_retries,
            ..Default::default()
        }
    }

    /// Run `op` until it succeeds, fails permanently, or the retry budget is
    /// spent. `label` names the operation in logs.
    pub async fn run<F, Fut, T>(&self, label: &str, mut op: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RepoResult<T>>,
    {
        let mut attempt = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let outcome = tokio::time::timeout(self.timeout, op()).await;

            let err = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if e.is_transient() => e,
                Ok(Err(e)) => return Err(AppError::from(e)),
                Err(_) => {
                    warn!(
                        operation = label,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "transaction timed out"
                    );
                    return Err(AppError::Transient(format!(
                        "{label} timed out after {:?}",
                        self.timeout
                    )));
                }
            };

            attempt += 1;
            if attempt > self.max_retries {
                warn!(operation = label, retries = self.max_retries, error = %err, "retries exhausted");
                return Err(AppError::Transient(format!(
                    "{label} failed after {} retries: {err}",
                    self.max_retries
                )));
            }

            let delay = self.backoff_delay(backoff);
            warn!(
                operation = label,
                attempt,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                "serialization conflict, retrying"
            );
            tokio::time::sleep(delay).await;

            backoff = (backoff * 2).min(self.max_backoff);
        }
    }

    fn backoff_delay(&self, base: Duration) -> Duration {
        if self.jitter {
            let factor = 1.0 + rand::thread_rng().gen_range(-0.3..0.3);
            Duration::from_millis((base.as_millis() as f64 * factor) as u64)
        } else {
            base
        }
    }
}
