//! Process-local TTL cache for gateway access tokens

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache operation failed: {0}")]
    OperationFailed(String),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|d| Instant::now() + d),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .map(|expires_at| Instant::now() >= expires_at)
            .unwrap_or(false)
    }
}

#[async_trait::async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryCache {
    store: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CacheBackend for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        {
            let store = self.store.read().await;
            match store.get(key) {
                None => return Ok(None),
                Some(entry) if !entry.is_expired() => return Ok(Some(entry.value.clone())),
                Some(_) => {}
            }
        }
        let mut store = self.store.write().await;
        if store.get(key).map(CacheEntry::is_expired).unwrap_or(false) {
            store.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        if ttl == Some(Duration::ZERO) {
            return Err(CacheError::OperationFailed(format!(
                "refusing to cache {} with a zero TTL",
                key
            )));
        }
        self.store
            .write()
            .await
            .insert(key.to_string(), CacheEntry::new(value.to_string(), ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.store.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expired_entries_read_as_missing() {
        let cache = InMemoryCache::new();
        cache
            .set("token", "abc", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(cache.get("token").await.unwrap().as_deref(), Some("abc"));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("token").await.unwrap(), None);
        assert!(cache.store.read().await.is_empty());
    }

    #[tokio::test]
    async fn delete_drops_entry() {
        let cache = InMemoryCache::new();
        cache.set("paypal:access_token", "abc", None).await.unwrap();
        cache.delete("paypal:access_token").await.unwrap();
        assert_eq!(cache.get("paypal:access_token").await.unwrap(), None);
    }

    #[tokio::test]
    async fn zero_ttl_is_rejected() {
        let cache = InMemoryCache::new();
        assert!(cache.set("k", "v", Some(Duration::ZERO)).await.is_err());
    }
}
