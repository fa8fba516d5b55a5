//! Bounded retry with exponential backoff.
//!
//! Retryable failures sleep `base_delay * 2^attempt` plus a small jitter;
//! terminal failures re-throw immediately. `DEADLINE_EXCEEDED` is granted a
//! single retry within the same budget.

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use tracing::debug;

use bayline_types::{FailureClass, SourceError};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    pub fn backoff(&self, attempt: u32, jitter_seed: &str) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        exp + jitter(self.base_delay, jitter_seed, attempt)
    }
}

/// Deterministic per-(name, attempt) jitter of at most a quarter of the base
/// delay; keeps concurrent retries from synchronizing.
fn jitter(base: Duration, seed: &str, attempt: u32) -> Duration {
    let cap_ms = (base.as_millis() as u64 / 4).max(1);
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    attempt.hash(&mut hasher);
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos()
        .hash(&mut hasher);
    Duration::from_millis(hasher.finish() % cap_ms)
}

/// Runs `op` until success, a terminal failure, or retry exhaustion. The
/// closure receives the zero-based attempt number.
pub async fn with_retry<T, F, Fut>(
    name: &str,
    policy: RetryPolicy,
    mut op: F,
) -> Result<T, SourceError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    let mut deadline_retried = false;
    let mut attempt = 0u32;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let exhausted = attempt >= policy.max_retries;
                match err.classify() {
                    FailureClass::Terminal => return Err(err),
                    FailureClass::RetryableOnce if deadline_retried => return Err(err),
                    FailureClass::RetryableOnce => deadline_retried = true,
                    FailureClass::Retryable if exhausted => return Err(err),
                    FailureClass::Retryable => {}
                }
                if exhausted {
                    return Err(err);
                }
                let delay = policy.backoff(attempt, name);
                debug!(
                    target: "bayline.retry",
                    op = name,
                    attempt,
                    code = err.code(),
                    delay_ms = delay.as_millis() as u64,
                    "retrying after failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn retryable_failures_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let out = with_retry("op", RetryPolicy::new(3, Duration::from_millis(10)), |_| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SourceError::Timeout)
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(out.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_failure_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let out: Result<(), _> =
            with_retry("op", RetryPolicy::new(5, Duration::from_millis(1)), |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SourceError::NotFound)
                }
            })
            .await;
        assert_eq!(out.unwrap_err(), SourceError::NotFound);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_rethrows_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let out: Result<(), _> =
            with_retry("op", RetryPolicy::new(2, Duration::from_millis(1)), |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SourceError::network("connection reset"))
                }
            })
            .await;
        assert_eq!(out.unwrap_err(), SourceError::network("connection reset"));
        // 1 initial call + max_retries retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_exceeded_retries_exactly_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let out: Result<(), _> =
            with_retry("op", RetryPolicy::new(5, Duration::from_millis(1)), |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SourceError::DeadlineExceeded)
                }
            })
            .await;
        assert_eq!(out.unwrap_err(), SourceError::DeadlineExceeded);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
