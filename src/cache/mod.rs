//! Cache-aside layer in front of persistence.
//!
//! [`CacheStore`] is the raw string key/value contract implemented by the
//! Redis and in-memory backends. [`CacheLayer`] is what the collector talks
//! to: it (de)serializes JSON, applies the default TTL and turns backend
//! outages into misses so collection keeps working without a cache.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::errors::CacheError;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;

/// Raw key/value operations shared by every backend.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// `Err(CacheError::Miss)` when absent or expired.
    async fn get(&self, key: &str) -> Result<String, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Store only if no live value exists. Returns whether it was stored.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, CacheError>;

    /// Delete every key matching a glob. Returns the number removed.
    async fn invalidate_pattern(&self, pattern: &str) -> Result<usize, CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Drop everything. Operational use only.
    async fn flush_all(&self) -> Result<(), CacheError>;
}

/// Key builders. Keys are namespaced by kind so one kind can be
/// invalidated by pattern.
pub mod keys {
    use ethers::types::Address;

    use crate::utils::addr_hex;

    pub fn price(pair: &Address) -> String {
        format!("price:{}", addr_hex(pair))
    }

    pub fn pairs(dex: &str) -> String {
        format!("pairs:{dex}")
    }

    pub fn token(token: &Address) -> String {
        format!("token:{}", addr_hex(token))
    }

    pub fn discovery_lock(dex: &str) -> String {
        format!("lock:discovery:{dex}")
    }
}

#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    degraded: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    /// Operations that failed against the backend and fell back.
    pub degraded: u64,
}

impl CacheStatsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct CacheLayer {
    store: Option<Arc<dyn CacheStore>>,
    default_ttl: Duration,
    stats: CacheStats,
}

impl CacheLayer {
    pub fn new(store: Arc<dyn CacheStore>, default_ttl: Duration) -> Self {
        Self {
            store: Some(store),
            default_ttl,
            stats: CacheStats::default(),
        }
    }

    pub fn memory(default_ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryCache::new()), default_ttl)
    }

    /// Every read misses and every write is dropped.
    pub fn disabled() -> Self {
        Self {
            store: None,
            default_ttl: Duration::ZERO,
            stats: CacheStats::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            degraded: self.stats.degraded.load(Ordering::Relaxed),
        }
    }

    fn degrade(&self, op: &str, key: &str, err: &CacheError) {
        self.stats.degraded.fetch_add(1, Ordering::Relaxed);
        warn!(op, key, error = %err, "[CACHE] backend unavailable, falling back");
    }

    /// Cached value for `key`, or `None` on miss, outage or a value that
    /// no longer deserializes.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let Some(store) = &self.store else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        match store.get(key).await {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(value) => {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    Some(value)
                }
                Err(e) => {
                    debug!(key, error = %e, "[CACHE] discarding undecodable entry");
                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    None
                }
            },
            Err(CacheError::Miss) => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                self.degrade("get", key, &e);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Write `value` with `ttl` (default TTL when `None`). Returns whether
    /// the write landed.
    pub async fn set_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key, error = %e, "[CACHE] value not serializable");
                return false;
            }
        };
        match store.set(key, &raw, ttl.unwrap_or(self.default_ttl)).await {
            Ok(()) => true,
            Err(e) => {
                self.degrade("set", key, &e);
                false
            }
        }
    }

    /// Take a best-effort distributed lock.
    ///
    /// Without a reachable backend this returns `true`: callers hold an
    /// in-process lock as well, so only cross-process exclusion is lost.
    pub async fn try_lock(&self, key: &str, ttl: Duration) -> bool {
        let Some(store) = &self.store else {
            return true;
        };
        match store.set_if_absent(key, "1", ttl).await {
            Ok(acquired) => acquired,
            Err(e) => {
                self.degrade("set_if_absent", key, &e);
                true
            }
        }
    }

    pub async fn release(&self, key: &str) {
        if let Some(store) = &self.store {
            if let Err(e) = store.delete(key).await {
                self.degrade("delete", key, &e);
            }
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        match store.exists(key).await {
            Ok(found) => found,
            Err(e) => {
                self.degrade("exists", key, &e);
                false
            }
        }
    }

    pub async fn invalidate_pattern(&self, pattern: &str) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        match store.invalidate_pattern(pattern).await {
            Ok(removed) => {
                debug!(pattern, removed, "[CACHE] invalidated");
                removed
            }
            Err(e) => {
                self.degrade("invalidate_pattern", pattern, &e);
                0
            }
        }
    }

    /// Full flush. Never called by the collection path.
    pub async fn flush_all(&self) -> Result<(), CacheError> {
        match &self.store {
            Some(store) => store.flush_all().await,
            None => Ok(()),
        }
    }
}
