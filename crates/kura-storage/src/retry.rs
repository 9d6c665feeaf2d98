//! Bounded, cancellable retries for transport calls

use std::future::Future;
use std::time::Duration;

use kura_core::config::RetryConfig;
use tokio_util::sync::CancellationToken;

use crate::traits::{TransportError, TransportResult};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub backoff: Vec<Duration>,
}

impl RetryPolicy {
    /// Wait after failed attempt `attempt` (1-based); the last entry repeats
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let idx = attempt.saturating_sub(1) as usize;
        self.backoff
            .get(idx)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: config
                .backoff_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, runs out of attempts or the
/// token is cancelled. `op` receives the 1-based attempt number.
pub async fn retry_async<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &str,
    mut op: F,
) -> TransportResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = TransportResult<T>>,
{
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let wait = policy.backoff_for(attempt);
                tracing::warn!(
                    operation = %operation,
                    attempt = attempt,
                    max_attempts = policy.max_attempts,
                    backoff_ms = wait.as_millis(),
                    error = %e,
                    "Transfer attempt failed, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                    _ = tokio::time::sleep(wait) => {}
                }
                attempt += 1;
            }
            Err(e) => {
                tracing::debug!(
                    operation = %operation,
                    attempt = attempt,
                    error = %e,
                    "Transfer failed, not retrying"
                );
                return Err(e);
            }
        }
    }
}
