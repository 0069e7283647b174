//! Retry for single-row writes
//!
//! Writes are short, independently committed statements. A failed write is retried
//! with linear backoff (attempt N waits N × base) instead of rolling back a larger
//! transaction.

use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// At least one attempt is always made, even when `attempts` is 0
    pub fn new(attempts: u32, backoff_ms: u64) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff: Duration::from_millis(backoff_ms),
        }
    }

    /// Run `op` until it succeeds or the attempts are used up; returns the last error
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.attempts => {
                    tracing::warn!(
                        "🔁 Write '{}' failed (attempt {}/{}): {}",
                        label,
                        attempt,
                        self.attempts,
                        e
                    );
                    tokio::time::sleep(self.backoff * attempt).await;
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
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retries_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(5, 1);

        let result: Result<u32, String> = policy
            .run("flaky", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("fail {}", n))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(2, 1);

        let result: Result<(), String> = policy
            .run("broken", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("nope".to_string())
            })
            .await;

        assert_eq!(result, Err("nope".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
