use crate::core::error::BackendError;
use log::warn;
use std::future::Future;
use std::time::Duration;
use tokio_retry2::strategy::{jitter, ExponentialBackoff};
use tokio_retry2::{Retry, RetryError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub retries: usize,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(retries: usize, delay_seconds: u64) -> Self {
        Self {
            retries,
            base_delay: Duration::from_secs(delay_seconds),
        }
    }

    pub fn none() -> Self {
        Self::new(0, 0)
    }

    /// Delays between attempts: base, 2x base, 4x base... capped at 64x base,
    /// each jittered.
    pub fn strategy(&self) -> impl Iterator<Item = Duration> {
        let base_ms = self.base_delay.as_millis() as u64;
        ExponentialBackoff::from_millis(2)
            .factor(base_ms / 2)
            .max_delay(self.base_delay * 64)
            .map(jitter)
            .take(self.retries)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy runs out of attempts.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let retries = policy.retries;
    let mut attempt = 0;
    Retry::spawn(policy.strategy(), || {
        attempt += 1;
        let current = attempt;
        let fut = op();
        async move {
            match fut.await {
                Ok(value) => Ok(value),
                Err(err) if err.retryable => {
                    if current <= retries {
                        warn!("{} failed: {}. Retrying ({}/{})", label, err, current, retries);
                    }
                    Err(RetryError::Transient {
                        err,
                        retry_after: None,
                    })
                }
                Err(err) => Err(RetryError::Permanent(err)),
            }
        }
    })
    .await
}
