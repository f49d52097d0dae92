use anyhow::Result;
use std::future::Future;
use std::time::Duration;

/// Fixed-delay retry with a hard attempt ceiling.
#[derive(Clone)]
pub struct RetryPolicy {
    pub name: &'static str,
    pub max_attempts: u32,
    pub delay: Duration,
    is_retryable: fn(&anyhow::Error) -> bool,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("name", &self.name)
            .field("max_attempts", &self.max_attempts)
            .field("delay", &self.delay)
            .finish()
    }
}

impl RetryPolicy {
    pub fn fixed(name: &'static str, max_attempts: u32, delay: Duration) -> Self {
        Self {
            name,
            max_attempts: max_attempts.max(1),
            delay,
            is_retryable: crate::error::is_retryable,
        }
    }

    pub fn with_classifier(mut self, is_retryable: fn(&anyhow::Error) -> bool) -> Self {
        self.is_retryable = is_retryable;
        self
    }

    pub fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }

    /// Runs `op` until it succeeds, returns a non-retryable error, or the
    /// attempt budget is spent. The last error is returned unchanged.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(err) => {
                    if attempt >= self.max_attempts || !(self.is_retryable)(&err) {
                        return Err(err);
                    }
                    tracing::warn!(
                        policy = self.name,
                        attempt,
                        max_attempts = self.max_attempts,
                        "attempt failed, retrying: {err:#}"
                    );
                    tokio::time::sleep(self.delay(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::fixed("test", 3, Duration::from_secs(2));
        let start = tokio::time::Instant::now();
        let c = calls.clone();
        let out = policy
            .run(|attempt| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 {
                        anyhow::bail!("flaky")
                    }
                    Ok(attempt)
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_at_ceiling() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::fixed("test", 3, Duration::from_millis(10));
        let c = calls.clone();
        let err = policy
            .run(|_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(anyhow::anyhow!("down"))
                }
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "down");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::fixed("test", 5, Duration::from_secs(1));
        let c = calls.clone();
        let _ = policy
            .run(|_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(PipelineError::Config("bad".into()).into())
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
