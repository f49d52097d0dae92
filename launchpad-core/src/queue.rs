use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Task scheduler bounded both in concurrency and in task starts per
/// rolling interval. Cloning shares the same limits.
#[derive(Clone)]
pub struct RateLimitedQueue {
    inner: Arc<Inner>,
}

struct Inner {
    name: &'static str,
    permits: Arc<Semaphore>,
    starts: AsyncMutex<VecDeque<Instant>>,
    interval: Duration,
    interval_cap: usize,
    pending: watch::Sender<usize>,
}

/// Resolves to the queued task's own result.
pub struct TaskHandle<T> {
    handle: JoinHandle<Result<T>>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(Ok(out)) => Poll::Ready(out),
            Poll::Ready(Err(join_err)) => Poll::Ready(Err(anyhow!("queued task aborted: {join_err}"))),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct PendingGuard(Arc<Inner>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.pending.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl RateLimitedQueue {
    pub fn new(name: &'static str, concurrency: usize, interval: Duration, interval_cap: usize) -> Self {
        let (pending, _) = watch::channel(0usize);
        Self {
            inner: Arc::new(Inner {
                name,
                permits: Arc::new(Semaphore::new(concurrency.max(1))),
                starts: AsyncMutex::new(VecDeque::new()),
                interval,
                interval_cap: interval_cap.max(1),
                pending,
            }),
        }
    }

    pub fn from_config(name: &'static str, cfg: &crate::config::QueueConfig) -> Self {
        Self::new(
            name,
            cfg.concurrency,
            Duration::from_millis(cfg.interval_ms),
            cfg.interval_cap,
        )
    }

    /// Sequential queue: one task at a time, no throughput cap beyond that.
    pub fn serial(name: &'static str) -> Self {
        Self::new(name, 1, Duration::from_millis(1), usize::MAX)
    }

    pub fn add<T, F>(&self, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        self.inner.pending.send_modify(|n| *n += 1);
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let _guard = PendingGuard(inner.clone());
            let _permit = inner
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| anyhow!("queue {} closed", inner.name))?;
            inner.wait_for_start_slot().await;
            task.await
        });
        TaskHandle { handle }
    }

    /// Completes once every task added so far has finished.
    pub async fn on_idle(&self) {
        let mut rx = self.inner.pending.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    pub fn pending(&self) -> usize {
        *self.inner.pending.borrow()
    }
}

impl Inner {
    async fn wait_for_start_slot(&self) {
        loop {
            let wait = {
                let mut starts = self.starts.lock().await;
                let now = Instant::now();
                while let Some(front) = starts.front() {
                    if now.duration_since(*front) >= self.interval {
                        starts.pop_front();
                    } else {
                        break;
                    }
                }
                if starts.len() < self.interval_cap {
                    starts.push_back(now);
                    return;
                }
                match starts.front() {
                    Some(front) => self.interval - now.duration_since(*front),
                    None => Duration::ZERO,
                }
            };
            tracing::trace!(queue = self.name, wait_ms = wait.as_millis() as u64, "throughput cap reached");
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap() {
        let q = RateLimitedQueue::new("test", 2, Duration::from_millis(1), 100);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            handles.push(q.add(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_cap_spreads_starts() {
        let q = RateLimitedQueue::new("test", 10, Duration::from_secs(1), 2);
        let start = Instant::now();
        let handles: Vec<_> = (0..6)
            .map(|i| q.add(async move { Ok::<_, anyhow::Error>((i, Instant::now())) }))
            .collect();
        let mut times = Vec::new();
        for h in handles {
            times.push(h.await.unwrap().1.duration_since(start));
        }
        times.sort();
        // Two starts per second: 0,0,1,1,2,2.
        assert!(times[1] < Duration::from_secs(1));
        assert!(times[2] >= Duration::from_secs(1));
        assert!(times[5] >= Duration::from_secs(2));
        assert!(times[5] < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let q = RateLimitedQueue::new("test", 2, Duration::from_millis(1), 100);
        let bad = q.add(async { Err::<u32, _>(anyhow!("boom")) });
        let good = q.add(async { Ok(7u32) });
        assert_eq!(bad.await.unwrap_err().to_string(), "boom");
        assert_eq!(good.await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_idle_waits_for_all() {
        let q = RateLimitedQueue::new("test", 1, Duration::from_millis(1), 100);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let done = done.clone();
            // Handles are dropped; tasks keep running.
            let _ = q.add(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        q.on_idle().await;
        assert_eq!(done.load(Ordering::SeqCst), 4);
        assert_eq!(q.pending(), 0);
    }

    #[tokio::test]
    async fn test_on_idle_when_empty_returns() {
        let q = RateLimitedQueue::serial("test");
        q.on_idle().await;
    }
}
