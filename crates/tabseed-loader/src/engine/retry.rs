//! Throttling retry with exponential backoff
//!
//! Only [`StoreError::Throttled`] is retried. Every retry re-issues the whole
//! request; the caller sees the outcome of the final attempt.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::{StoreError, StoreResult};

/// Backoff schedule and retry ceiling for throttled requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry
    pub base_delay: Duration,
    /// Upper bound (exclusive) of the random delay added to each wait
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_jitter: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    /// Deterministic part of the wait before retry `retry` (0-based):
    /// `base_delay * 2^retry`, saturating.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Full wait before retry `retry`: backoff plus jitter in `[0, max_jitter)`
    pub fn delay_for(&self, retry: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..jitter_ms))
        };
        self.backoff(retry).saturating_add(jitter)
    }
}

/// Final result of an operation run under [`retry_throttled`]
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: StoreResult<T>,
    /// Throttling retries performed before `result` was produced
    pub retries: u32,
}

/// Run `op`, retrying while it is throttled and retries remain.
///
/// `op` is called at most `1 + policy.max_retries` times. Non-throttling
/// errors are returned immediately.
pub async fn retry_throttled<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Attempted<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut retries = 0;
    loop {
        match op().await {
            Err(err @ StoreError::Throttled { .. }) if retries < policy.max_retries => {
                let delay = policy.delay_for(retries);
                warn!(
                    target_op = label,
                    retry = retries + 1,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Throttled, backing off: {}",
                    err
                );
                tokio::time::sleep(delay).await;
                retries += 1;
            },
            result => return Attempted { result, retries },
        }
    }
}
