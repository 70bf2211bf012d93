//! Cache service holding `hash -> canonical PLU` entries for order creation.
use async_trait::async_trait;
use moka::Expiry;
use moka::sync::Cache;
use std::time::{Duration, Instant};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait CacheService: Send + Sync {
    /// Stores `value` under `key` unless the key already exists. Returns
    /// whether the value was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// `Ok(None)` when the key is not cached.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Returns whether a value was removed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;
}

#[derive(Clone, Debug)]
struct CacheEntry {
    value: String,
    ttl: Duration,
}

struct EntryTtl;

impl Expiry<String, CacheEntry> for EntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process cache backed by moka, with a TTL per entry.
pub struct MokaCacheService {
    cache: Cache<String, CacheEntry>,
}

impl MokaCacheService {
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(EntryTtl)
            .build();

        MokaCacheService { cache }
    }
}

#[async_trait]
impl CacheService for MokaCacheService {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let entry = self.cache.entry(key.to_string()).or_insert_with(|| CacheEntry {
            value: value.to_string(),
            ttl,
        });
        Ok(entry.is_fresh())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.cache.contains_key(key))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.cache.get(key).map(|entry| entry.value))
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.cache.remove(key).is_some())
    }
}
