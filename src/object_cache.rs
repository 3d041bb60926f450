//! Object cache tier
//!
//! Best-effort key/value cache keyed by `(group, key)`. Nothing stored here is
//! authoritative: every method degrades to a miss or a no-op on failure, and the
//! option store rebuilds any lost entry from the durable table.
//!
//! - [`NullCache`]: no cache tier at all
//! - [`MemoryCache`]: in-process Moka cache with per-entry expiry
//! - [`crate::RedisCache`]: shared Redis tier with an optional local tier

use async_trait::async_trait;
use moka::future::Cache;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::{CacheConfig, Clock, SystemClock};

/// Cache groups used by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheGroup {
    /// Individual option values plus the `alloptions` and `notoptions` records
    Options,
    /// Transient values, only used when the tier is persistent
    Transients,
}

impl CacheGroup {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheGroup::Options => "global-options",
            CacheGroup::Transients => "global-transient",
        }
    }
}

impl fmt::Display for CacheGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Best-effort cache keyed by group and key.
///
/// `ttl` of `None` means the entry lives until evicted.
#[async_trait]
pub trait ObjectCache: Send + Sync + 'static {
    async fn get(&self, group: CacheGroup, key: &str) -> Option<Value>;

    /// Store a value, replacing any existing entry.
    async fn set(&self, group: CacheGroup, key: &str, value: Value, ttl: Option<Duration>) -> bool;

    /// Store a value only when no live entry exists. Returns whether it was stored.
    async fn add(&self, group: CacheGroup, key: &str, value: Value, ttl: Option<Duration>) -> bool;

    async fn delete(&self, group: CacheGroup, key: &str) -> bool;

    /// Drop every entry this cache holds.
    async fn flush(&self);

    /// Whether entries outlive the current process and are shared between
    /// instances. Transients are delegated to persistent tiers only.
    fn is_persistent(&self) -> bool;
}

/// The absent cache tier
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCache;

#[async_trait]
impl ObjectCache for NullCache {
    async fn get(&self, _group: CacheGroup, _key: &str) -> Option<Value> {
        None
    }

    async fn set(
        &self,
        _group: CacheGroup,
        _key: &str,
        _value: Value,
        _ttl: Option<Duration>,
    ) -> bool {
        false
    }

    async fn add(
        &self,
        _group: CacheGroup,
        _key: &str,
        _value: Value,
        _ttl: Option<Duration>,
    ) -> bool {
        false
    }

    async fn delete(&self, _group: CacheGroup, _key: &str) -> bool {
        false
    }

    async fn flush(&self) {}

    fn is_persistent(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    /// Absolute expiry in clock seconds
    expires_at: Option<u64>,
}

/// In-process cache backed by Moka
///
/// Capacity comes from [`CacheConfig::l1_max_capacity`]. Expiry is checked
/// against the injected [`Clock`] on read, so a manual clock controls it.
pub struct MemoryCache {
    entries: Cache<String, Arc<Entry>>,
    clock: Arc<dyn Clock>,
    persistent: bool,
}

impl MemoryCache {
    /// Per-process runtime cache.
    pub fn new(config: &CacheConfig) -> Self {
        Self::build(config, Arc::new(SystemClock), false)
    }

    /// Per-process runtime cache using the given clock.
    pub fn with_clock(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self::build(config, clock, false)
    }

    /// A cache that callers share between store instances and treat as an
    /// external persistent tier.
    pub fn shared(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self::build(config, clock, true)
    }

    fn build(config: &CacheConfig, clock: Arc<dyn Clock>, persistent: bool) -> Self {
        let entries = Cache::builder()
            .max_capacity(config.l1_max_capacity)
            .build();
        Self {
            entries,
            clock,
            persistent,
        }
    }

    fn cache_key(group: CacheGroup, key: &str) -> String {
        format!("{}:{}", group.as_str(), key)
    }

    fn expires_at(&self, ttl: Option<Duration>) -> Option<u64> {
        ttl.filter(|d| !d.is_zero())
            .map(|d| self.clock.now().saturating_add(d.as_secs().max(1)))
    }

    async fn live(&self, cache_key: &str) -> Option<Arc<Entry>> {
        let entry = self.entries.get(cache_key).await?;
        match entry.expires_at {
            Some(at) if at <= self.clock.now() => {
                debug!("Memory cache entry expired: {}", cache_key);
                self.entries.invalidate(cache_key).await;
                None
            }
            _ => Some(entry),
        }
    }
}

#[async_trait]
impl ObjectCache for MemoryCache {
    async fn get(&self, group: CacheGroup, key: &str) -> Option<Value> {
        let cache_key = Self::cache_key(group, key);
        self.live(&cache_key).await.map(|e| e.value.clone())
    }

    async fn set(&self, group: CacheGroup, key: &str, value: Value, ttl: Option<Duration>) -> bool {
        let entry = Entry {
            value,
            expires_at: self.expires_at(ttl),
        };
        self.entries
            .insert(Self::cache_key(group, key), Arc::new(entry))
            .await;
        true
    }

    async fn add(&self, group: CacheGroup, key: &str, value: Value, ttl: Option<Duration>) -> bool {
        let cache_key = Self::cache_key(group, key);
        if self.live(&cache_key).await.is_some() {
            return false;
        }
        let entry = Entry {
            value,
            expires_at: self.expires_at(ttl),
        };
        self.entries.insert(cache_key, Arc::new(entry)).await;
        true
    }

    async fn delete(&self, group: CacheGroup, key: &str) -> bool {
        self.entries
            .remove(&Self::cache_key(group, key))
            .await
            .is_some()
    }

    async fn flush(&self) {
        self.entries.invalidate_all();
    }

    fn is_persistent(&self) -> bool {
        self.persistent
    }
}
