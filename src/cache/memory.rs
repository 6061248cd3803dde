//! In-process cache
//!
//! Implements the key-value + pub/sub contract with TTL entries and
//! broadcast channels. Used by the `memory` backend and by tests.

use super::Cache;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

const CHANNEL_CAPACITY: usize = 1024;

struct Entry {
    value: String,
    expires_at: Instant,
}

/// Thread-safe in-memory cache
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
    channels: std::sync::Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            channels: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone()))
    }

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<u64> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: "0".to_string(),
            expires_at: now + ttl,
        });
        if entry.expires_at <= now {
            entry.value = "0".to_string();
            entry.expires_at = now + ttl;
        }

        let next = entry.value.parse::<u64>().unwrap_or(0) + 1;
        entry.value = next.to_string();
        Ok(next)
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<usize> {
        // A send error only means nobody is listening right now.
        let delivered = self.sender(channel).send(payload).unwrap_or(0);
        debug!("Published to '{}' ({} subscribers)", channel, delivered);
        Ok(delivered)
    }

    fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>> {
        Ok(self.sender(channel).subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = MemoryCache::new();
        cache
            .set_with_ttl("k", "v".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        cache.delete("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incr_resets_after_window() {
        let cache = MemoryCache::new();
        assert_eq!(cache.incr_with_ttl("rl", Duration::from_secs(60)).await.unwrap(), 1);
        assert_eq!(cache.incr_with_ttl("rl", Duration::from_secs(60)).await.unwrap(), 2);

        assert_eq!(cache.incr_with_ttl("short", Duration::from_millis(0)).await.unwrap(), 1);
        assert_eq!(cache.incr_with_ttl("short", Duration::from_millis(0)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let cache = MemoryCache::new();
        let mut rx = cache.subscribe("audit:severity:critical").unwrap();

        let delivered = cache
            .publish("audit:severity:critical", "payload".to_string())
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(rx.recv().await.unwrap(), "payload");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let cache = MemoryCache::new();
        assert_eq!(cache.publish("nobody", "x".to_string()).await.unwrap(), 0);
    }
}
