//! Cache Module
//!
//! Three kinds of caching live here:
//! - `Cache`: the contract for the external fast key-value store with
//!   pub/sub (rate-limit counters, shared rule rows, real-time audit channels)
//! - `SharedRows`: rule rows kept in the external cache as JSON, shared by
//!   every instance and deleted on any mutation
//! - `ReadCache`: an explicitly-owned, TTL-bounded local cache each engine
//!   holds for its compiled rule sets, in front of `SharedRows`

pub mod memory;

pub use memory::MemoryCache;

use crate::error::Result;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock};
use tracing::warn;

/// Narrow contract for the key-value cache with pub/sub
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Increment a counter. The TTL window starts at the first increment.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<u64>;

    /// Publish a payload; returns the number of live subscribers reached
    async fn publish(&self, channel: &str, payload: String) -> Result<usize>;

    fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>>;
}

/// Rows stored in the external cache as JSON.
///
/// Every cache failure reads as a miss, so an unreachable cache only costs a
/// storage round trip.
pub struct SharedRows {
    cache: Arc<dyn Cache>,
    ttl: Duration,
}

impl SharedRows {
    pub fn new(cache: Arc<dyn Cache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.cache.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(rows) => Some(rows),
                Err(e) => {
                    warn!("Discarding unreadable cache entry '{}': {}", key, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Cache unavailable reading '{}': {}", key, e);
                None
            }
        }
    }

    pub async fn put<T: Serialize>(&self, key: &str, rows: &T) {
        let raw = match serde_json::to_string(rows) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to serialize cache entry '{}': {}", key, e);
                return;
            }
        };
        if let Err(e) = self.cache.set_with_ttl(key, raw, self.ttl).await {
            warn!("Cache unavailable writing '{}': {}", key, e);
        }
    }

    pub async fn invalidate(&self, keys: &[&str]) {
        for key in keys {
            if let Err(e) = self.cache.delete(key).await {
                warn!("Cache unavailable deleting '{}': {}", key, e);
            }
        }
    }
}

/// TTL-bounded read cache keyed by string.
///
/// Readers may observe a stale value for at most one TTL or until the next
/// `invalidate_all`.
pub struct ReadCache<V> {
    entries: RwLock<HashMap<String, (Arc<V>, Instant)>>,
    ttl: Duration,
}

impl<V> ReadCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn get(&self, key: &str) -> Option<Arc<V>> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|(_, stored_at)| stored_at.elapsed() < self.ttl)
            .map(|(value, _)| Arc::clone(value))
    }

    pub async fn insert(&self, key: impl Into<String>, value: V) -> Arc<V> {
        let value = Arc::new(value);
        let mut entries = self.entries.write().await;
        entries.insert(key.into(), (Arc::clone(&value), Instant::now()));
        value
    }

    pub async fn invalidate_all(&self) {
        self.entries.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_cache_invalidation() {
        let cache: ReadCache<Vec<u32>> = ReadCache::new(Duration::from_secs(60));
        cache.insert("input", vec![1, 2]).await;
        assert_eq!(cache.get("input").await.as_deref(), Some(&vec![1, 2]));

        cache.invalidate_all().await;
        assert!(cache.get("input").await.is_none());
    }

    #[tokio::test]
    async fn test_shared_rows_round_trip_and_invalidate() {
        let cache = Arc::new(MemoryCache::new());
        let rows = SharedRows::new(cache.clone(), Duration::from_secs(60));
        assert_eq!(rows.get::<Vec<String>>("rules:input").await, None);

        rows.put("rules:input", &vec!["a".to_string(), "b".to_string()]).await;
        assert_eq!(
            rows.get::<Vec<String>>("rules:input").await,
            Some(vec!["a".to_string(), "b".to_string()])
        );

        // A payload of the wrong shape reads as a miss
        assert_eq!(rows.get::<Vec<u32>>("rules:input").await, None);

        rows.invalidate(&["rules:input", "rules:output"]).await;
        assert_eq!(cache.get("rules:input").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_cache_expires() {
        let cache: ReadCache<u32> = ReadCache::new(Duration::from_millis(0));
        cache.insert("k", 7).await;
        assert!(cache.get("k").await.is_none());
    }
}
