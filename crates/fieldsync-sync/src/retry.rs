//! # Retry
//!
//! Bounded retry around a fallible async operation.
//!
//! ```text
//!  attempt 1 ──fail(retryable)──► sleep(delay) ──► attempt 2 ──► ... ──► attempt N
//!      │                                                                   │
//!      └─ ok / non-retryable error: return immediately                    └─ last error
//! ```
//!
//! Delays come from a `backoff::ExponentialBackoff` with jitter disabled, so
//! `Fixed` is just the exponential schedule with a multiplier of 1.

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tracing::debug;

use crate::error::{SyncError, SyncResult};

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayKind {
    /// Same delay before every retry.
    Fixed,
    /// Delay doubles after every retry.
    Exponential,
}

/// Retry policy: attempt count and delay schedule.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub attempts: u32,
    pub base_delay: Duration,
    pub kind: DelayKind,
}

impl RetryPolicy {
    /// `attempts` tries separated by a constant `delay`.
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        RetryPolicy {
            attempts,
            base_delay: delay,
            kind: DelayKind::Fixed,
        }
    }

    /// `attempts` tries with a doubling delay starting at `base_delay`.
    pub fn exponential(attempts: u32, base_delay: Duration) -> Self {
        RetryPolicy {
            attempts,
            base_delay,
            kind: DelayKind::Exponential,
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        let multiplier = match self.kind {
            DelayKind::Fixed => 1.0,
            DelayKind::Exponential => 2.0,
        };

        ExponentialBackoff {
            current_interval: self.base_delay,
            initial_interval: self.base_delay,
            randomization_factor: 0.0,
            multiplier,
            max_interval: self.base_delay.saturating_mul(64),
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::fixed(3, Duration::from_secs(1))
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up.
///
/// ## Example
/// ```rust,ignore
/// let info = retry(RetryPolicy::fixed(3, Duration::from_secs(1)), || {
///     unit.get_device_info(&url)
/// })
/// .await?;
/// ```
pub async fn retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut backoff = policy.backoff();
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() || attempt >= attempts => return Err(e),
            Err(e) => {
                let delay = backoff.next_backoff().unwrap_or(policy.base_delay);
                debug!(?e, attempt, ?delay, "Retrying after transient failure");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Like [`retry`] but treats every error as retryable.
pub async fn retry_any<T, F, Fut>(policy: RetryPolicy, mut op: F) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut backoff = policy.backoff();
    let mut last_error = SyncError::Internal("retry ran zero attempts".into());

    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_error = e;
                if attempt < attempts {
                    let delay = backoff.next_backoff().unwrap_or(policy.base_delay);
                    debug!(error = %last_error, attempt, ?delay, "Retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = retry(RetryPolicy::fixed(3, Duration::from_secs(1)), || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(SyncError::ConnectionFailed("refused".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: SyncResult<()> = retry(RetryPolicy::fixed(3, Duration::from_millis(10)), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::Timeout(3))
            }
        })
        .await;

        assert!(matches!(result, Err(SyncError::Timeout(3))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: SyncResult<()> = retry(RetryPolicy::fixed(5, Duration::from_secs(1)), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::AuthFailed("expired".into()))
            }
        })
        .await;

        assert!(result.unwrap_err().is_access_error());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_delay_is_constant() {
        let start = tokio::time::Instant::now();

        let _: SyncResult<()> = retry(RetryPolicy::fixed(3, Duration::from_secs(1)), || async {
            Err(SyncError::Timeout(1))
        })
        .await;

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_delay_doubles() {
        let start = tokio::time::Instant::now();

        let _: SyncResult<()> =
            retry(RetryPolicy::exponential(3, Duration::from_secs(1)), || async {
                Err(SyncError::Timeout(1))
            })
            .await;

        // 1s + 2s
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_any_retries_everything() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: SyncResult<()> =
            retry_any(RetryPolicy::fixed(2, Duration::from_millis(5)), || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SyncError::InvalidResponse("garbage".into()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
