//! Store and cache configuration

use std::time::Duration;

/// Configuration for the cache tiers
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries in the in-process cache
    pub l1_max_capacity: u64,
    /// Time-to-live for entries held in the local tier in front of Redis
    pub l1_ttl: Duration,
    /// Prefix for every Redis key written by this store
    pub key_prefix: String,
    /// Enable Redis pub/sub for cross-instance invalidation of the local tier
    pub enable_pubsub: bool,
    /// Redis pub/sub channel carrying invalidated keys
    pub invalidation_channel: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_max_capacity: 10_000,
            l1_ttl: Duration::from_secs(60),
            key_prefix: "optstore:".to_owned(),
            enable_pubsub: true,
            invalidation_channel: "optstore:invalidate".to_owned(),
        }
    }
}

/// Configuration for the option and transient stores
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Names that can never be added, updated or deleted through the store API
    pub protected_names: Vec<String>,
    /// Prefix of the option record holding a transient value
    pub transient_prefix: String,
    /// Prefix of the option record holding a transient expiry instant
    pub transient_timeout_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            protected_names: vec!["alloptions".to_owned(), "notoptions".to_owned()],
            transient_prefix: "_transient_".to_owned(),
            transient_timeout_prefix: "_transient_timeout_".to_owned(),
        }
    }
}

impl StoreConfig {
    /// Whether `name` is reserved for internal records
    pub fn is_protected(&self, name: &str) -> bool {
        self.protected_names.iter().any(|p| p == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_protected_names() {
        let config = StoreConfig::default();
        assert!(config.is_protected("alloptions"));
        assert!(config.is_protected("notoptions"));
        assert!(!config.is_protected("blogname"));
    }
}
