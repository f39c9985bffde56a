//! Bounded retry with exponential backoff for provider calls

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::blockchain_data::ProviderError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries, used where the caller has its own fallback
    pub fn no_retry() -> Self {
        Self { max_attempts: 1, ..Self::default() }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let ms = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }

    /// Run `op` until it succeeds, fails terminally, or the attempt budget
    /// is spent. Only [`ProviderError::is_retryable`] errors are retried.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "⚠️  {} failed (attempt {}/{}): {}; retrying in {}ms",
                        what,
                        attempt,
                        attempts,
                        e,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy { max_attempts: 4, initial_delay_ms: 1, max_delay_ms: 4, backoff_multiplier: 2.0 }
    }

    #[test]
    fn test_delay_growth_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(10), Duration::from_millis(5_000));
    }

    #[tokio::test]
    async fn test_retries_server_errors_until_success() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result = fast()
            .run("op", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::Server { status: 503, body: "busy".into() })
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejection_is_terminal() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<(), _> = fast()
            .run("op", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::Rejected { status: 400, reason: "bad-txns".into() })
            })
            .await;
        assert!(matches!(result, Err(ProviderError::Rejected { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<(), _> = fast()
            .run("op", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::Timeout(1))
            })
            .await;
        assert!(matches!(result, Err(ProviderError::Timeout(1))));
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }
}
