use anyhow::Result;
use lru::LruCache;
use std::future::Future;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CachedEntry<V> {
    value: V,
    inserted_at: Instant,
}

/// Capacity-bounded LRU with a per-entry time-to-live, for slow idempotent
/// lookups such as off-chain metadata.
pub struct MetadataCache<V> {
    entries: AsyncMutex<LruCache<String, CachedEntry<V>>>,
    ttl: Duration,
}

impl<V: Clone> MetadataCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: AsyncMutex::new(LruCache::new(cap)),
            ttl,
        }
    }

    pub fn from_config(cfg: &crate::config::CacheConfig) -> Self {
        Self::new(cfg.metadata_capacity, Duration::from_secs(cfg.metadata_ttl_secs))
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().await;
        let expired = match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() <= self.ttl => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        None
    }

    pub async fn insert(&self, key: impl Into<String>, value: V) {
        self.entries.lock().await.put(
            key.into(),
            CachedEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Returns the cached value or runs `fetch` and caches its success.
    /// Failures are not cached. The lock is not held across `fetch`.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(v) = self.get(key).await {
            tracing::trace!(key, "metadata cache hit");
            return Ok(v);
        }
        let value = fetch().await?;
        self.insert(key, value.clone()).await;
        Ok(value)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drops every entry; called on shutdown.
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_evicts_least_recently_used() {
        let cache = MetadataCache::new(2, Duration::from_secs(3600));
        cache.insert("a", 1).await;
        cache.insert("b", 2).await;
        assert_eq!(cache.get("a").await, Some(1));
        cache.insert("c", 3).await;
        assert_eq!(cache.get("b").await, None);
        assert_eq!(cache.get("a").await, Some(1));
        assert_eq!(cache.get("c").await, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = MetadataCache::new(10, Duration::from_secs(60));
        cache.insert("k", "v".to_string()).await;
        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get("k").await, None);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_get_or_fetch_caches_success_only() {
        let cache = MetadataCache::new(10, Duration::from_secs(60));
        let err = cache
            .get_or_fetch("k", || async { Err::<u32, _>(anyhow::anyhow!("offline")) })
            .await;
        assert!(err.is_err());
        assert_eq!(cache.len().await, 0);

        let v = cache.get_or_fetch("k", || async { Ok(5u32) }).await.unwrap();
        assert_eq!(v, 5);
        let v = cache
            .get_or_fetch("k", || async { panic!("should hit cache") })
            .await
            .unwrap();
        assert_eq!(v, 5);
    }
}
