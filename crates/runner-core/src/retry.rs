//! A small retry helper with configurable delay, backoff, and attempt cap.
//!
//! Mirrors `task_runner.utils.retries.retry`: fixed or exponentially growing
//! delay between attempts, an optional cap on the number of tries (`None`
//! means retry forever), and the last error propagated once the cap is hit.

use std::time::Duration;

/// Policy for [`retry`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub delay: Duration,
    pub backoff: f64,
    pub max_tries: Option<u32>,
}

impl RetryPolicy {
    pub const fn forever(delay: Duration) -> Self {
        Self {
            delay,
            backoff: 1.0,
            max_tries: None,
        }
    }

    pub const fn bounded(delay: Duration, max_tries: u32) -> Self {
        Self {
            delay,
            backoff: 1.0,
            max_tries: Some(max_tries),
        }
    }

    pub const fn with_backoff(mut self, backoff: f64) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Run `f` until it succeeds or the policy's attempt cap is exhausted,
/// sleeping between attempts per the policy. `on_retry` is called with the
/// attempt number (1-based) and the error, for logging.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, mut f: F, mut on_retry: impl FnMut(u32, &E)) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    let mut delay = policy.delay;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempt += 1;
                if let Some(max) = policy.max_tries {
                    if attempt >= max {
                        return Err(e);
                    }
                }
                on_retry(attempt, &e);
                tokio::time::sleep(delay).await;
                delay = delay.mul_f64(policy.backoff);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry(
            RetryPolicy::bounded(Duration::from_millis(1), 3),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(7) }
            },
            |_, _| {},
        )
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry(
            RetryPolicy::bounded(Duration::from_millis(1), 5),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("transient")
                    } else {
                        Ok(42)
                    }
                }
            },
            |_, _| {},
        )
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_max_tries() {
        let result: Result<u32, &str> = retry(
            RetryPolicy::bounded(Duration::from_millis(1), 2),
            || async { Err("always fails") },
            |_, _| {},
        )
        .await;
        assert_eq!(result, Err("always fails"));
    }
}
