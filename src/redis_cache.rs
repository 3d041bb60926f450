//! Shared Redis cache tier
//!
//! Values are stored as JSON under `{prefix}{group}:{key}`. An optional local
//! Moka tier sits in front of Redis; instances keep their local tiers coherent
//! by publishing every changed key on the invalidation channel. A background
//! thread per cache listens on that channel and evicts published keys, and
//! resubscribes with exponential backoff whenever the connection drops.
//!
//! Redis failures never surface: they are logged and read as misses.

use async_trait::async_trait;
use futures::StreamExt;
use moka::future::Cache;
use redis::AsyncCommands;
use serde_json::Value;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::runtime::Builder;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::{CacheConfig, CacheGroup, ObjectCache, OptionError};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);
const SCAN_BATCH: usize = 500;

/// Redis-backed [`ObjectCache`], shared between every instance using the same
/// key prefix.
pub struct RedisCache {
    redis: redis::aio::ConnectionManager,
    local: Option<Cache<String, Arc<Value>>>,
    config: CacheConfig,
    listener: Option<oneshot::Sender<()>>,
}

impl RedisCache {
    /// Connect to Redis. A local tier is created when
    /// `config.l1_max_capacity` is non-zero, and kept coherent over pub/sub
    /// when `config.enable_pubsub` is set.
    ///
    /// The listener runs on its own thread with a single-threaded runtime.
    pub async fn new(client: redis::Client, config: CacheConfig) -> Result<Self, OptionError> {
        let redis = redis::aio::ConnectionManager::new(client.clone()).await?;

        let local = (config.l1_max_capacity > 0).then(|| {
            Cache::builder()
                .max_capacity(config.l1_max_capacity)
                .time_to_live(config.l1_ttl)
                .build()
        });

        let listener = match &local {
            Some(local) if config.enable_pubsub => Some(spawn_listener(
                client,
                config.invalidation_channel.clone(),
                local.clone(),
            )),
            _ => None,
        };

        Ok(Self {
            redis,
            local,
            config,
            listener,
        })
    }

    /// Stop the invalidation listener. Local entries then only expire by TTL.
    pub fn shutdown(&mut self) {
        if let Some(stop) = self.listener.take() {
            let _ = stop.send(());
        }
    }

    fn redis_key(&self, group: CacheGroup, key: &str) -> String {
        redis_key(&self.config.key_prefix, group, key)
    }

    /// Only entries without their own TTL are kept in the local tier, so a
    /// local copy never outlives its Redis expiry.
    async fn remember_local(&self, redis_key: String, value: &Value, ttl: Option<Duration>) {
        if let Some(local) = &self.local {
            if ttl_secs(ttl).is_none() {
                local.insert(redis_key, Arc::new(value.clone())).await;
            } else {
                local.invalidate(&redis_key).await;
            }
        }
    }

    async fn publish(&self, redis_key: &str) {
        if self.local.is_none() || !self.config.enable_pubsub {
            return;
        }
        let channel = &self.config.invalidation_channel;
        let mut conn = self.redis.clone();
        if let Err(e) = conn.publish::<_, _, ()>(channel, redis_key).await {
            warn!(
                "Redis PUBLISH error on channel {} for key {}: {}. Continuing.",
                channel, redis_key, e
            );
        } else {
            debug!("Cache invalidation published on '{}': {}", channel, redis_key);
        }
    }
}

impl Drop for RedisCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub(crate) fn redis_key(prefix: &str, group: CacheGroup, key: &str) -> String {
    format!("{}{}:{}", prefix, group.as_str(), key)
}

/// Whole seconds for `SET ... EX`, rounding sub-second TTLs up. `None` for no
/// expiry.
pub(crate) fn ttl_secs(ttl: Option<Duration>) -> Option<u64> {
    ttl.filter(|d| !d.is_zero())
        .map(|d| d.as_secs() + u64::from(d.subsec_nanos() > 0))
}

fn set_command(redis_key: &str, json: &str, ttl: Option<Duration>, only_new: bool) -> redis::Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(redis_key).arg(json);
    if only_new {
        cmd.arg("NX");
    }
    if let Some(secs) = ttl_secs(ttl) {
        cmd.arg("EX").arg(secs);
    }
    cmd
}

#[async_trait]
impl ObjectCache for RedisCache {
    async fn get(&self, group: CacheGroup, key: &str) -> Option<Value> {
        let redis_key = self.redis_key(group, key);
        if let Some(local) = &self.local
            && let Some(value) = local.get(&redis_key).await
        {
            debug!("Cache hit local tier for key: {}", redis_key);
            return Some(value.as_ref().clone());
        }

        let mut conn = self.redis.clone();
        let json = match conn.get::<_, Option<String>>(&redis_key).await {
            Ok(Some(json)) => json,
            Ok(None) => {
                debug!("Cache miss Redis for key: {}", redis_key);
                return None;
            }
            Err(e) => {
                warn!("Redis GET error for key {}: {}. Treating as miss.", redis_key, e);
                return None;
            }
        };

        match decode_entry(&json) {
            Ok(value) => {
                debug!("Cache hit Redis for key: {}", redis_key);
                if let Some(local) = &self.local {
                    // Entries carrying a TTL stay out of the local tier
                    let persistent = matches!(conn.ttl::<_, i64>(&redis_key).await, Ok(-1));
                    if persistent {
                        local.insert(redis_key, Arc::new(value.clone())).await;
                    }
                }
                Some(value)
            }
            Err(e) => {
                warn!("{} for key {}. Deleting corrupt entry.", e, redis_key);
                if let Err(del_err) = conn.del::<_, ()>(&redis_key).await {
                    warn!("Failed to delete corrupt entry {}: {}", redis_key, del_err);
                }
                None
            }
        }
    }

    async fn set(&self, group: CacheGroup, key: &str, value: Value, ttl: Option<Duration>) -> bool {
        let redis_key = self.redis_key(group, key);
        let json = value.to_string();
        let mut conn = self.redis.clone();

        let stored = set_command(&redis_key, &json, ttl, false)
            .query_async::<()>(&mut conn)
            .await;
        if let Err(e) = stored {
            warn!("Redis SET error for key {}: {}. Continuing.", redis_key, e);
            if let Some(local) = &self.local {
                local.invalidate(&redis_key).await;
            }
            return false;
        }

        self.remember_local(redis_key.clone(), &value, ttl).await;
        self.publish(&redis_key).await;
        true
    }

    async fn add(&self, group: CacheGroup, key: &str, value: Value, ttl: Option<Duration>) -> bool {
        let redis_key = self.redis_key(group, key);
        let json = value.to_string();
        let mut conn = self.redis.clone();

        match set_command(&redis_key, &json, ttl, true)
            .query_async::<Option<String>>(&mut conn)
            .await
        {
            Ok(Some(_)) => {
                self.remember_local(redis_key.clone(), &value, ttl).await;
                self.publish(&redis_key).await;
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Redis SET NX error for key {}: {}. Continuing.", redis_key, e);
                false
            }
        }
    }

    async fn delete(&self, group: CacheGroup, key: &str) -> bool {
        let redis_key = self.redis_key(group, key);
        if let Some(local) = &self.local {
            local.invalidate(&redis_key).await;
        }

        let mut conn = self.redis.clone();
        let removed = match conn.del::<_, i64>(&redis_key).await {
            Ok(n) => n > 0,
            Err(e) => {
                warn!("Redis DEL error for key {}: {}. Continuing.", redis_key, e);
                false
            }
        };
        self.publish(&redis_key).await;
        removed
    }

    async fn flush(&self) {
        if let Some(local) = &self.local {
            local.invalidate_all();
        }

        let pattern = format!("{}*", self.config.key_prefix);
        let mut conn = self.redis.clone();
        let mut cursor = 0u64;
        loop {
            let batch = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async::<(u64, Vec<String>)>(&mut conn)
                .await;
            let (next, keys) = match batch {
                Ok(batch) => batch,
                Err(e) => {
                    warn!("Redis SCAN error while flushing {}: {}", pattern, e);
                    return;
                }
            };
            if !keys.is_empty() {
                if let Err(e) = conn.del::<_, ()>(&keys).await {
                    warn!("Redis DEL error while flushing {}: {}", pattern, e);
                }
                for key in &keys {
                    self.publish(key).await;
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        debug!("Flushed Redis keys matching {}", pattern);
    }

    fn is_persistent(&self) -> bool {
        true
    }
}

fn spawn_listener(
    client: redis::Client,
    channel: String,
    local: Cache<String, Arc<Value>>,
) -> oneshot::Sender<()> {
    let (stop, stopped) = oneshot::channel();
    thread::spawn(move || match Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt.block_on(async move {
            tokio::select! {
                _ = listen(client, channel, local) => {}
                _ = stopped => debug!("Invalidation listener stopped"),
            }
        }),
        Err(e) => error!("Failed to build runtime for invalidation listener: {}", e),
    });
    stop
}

/// Parse a stored Redis payload back into a value.
fn decode_entry(json: &str) -> Result<Value, OptionError> {
    Ok(serde_json::from_str(json)?)
}

/// Evict keys published on `channel` from `local`. Never returns.
async fn listen(client: redis::Client, channel: String, local: Cache<String, Arc<Value>>) {
    let mut delay = INITIAL_BACKOFF;
    loop {
        match subscribe(&client, &channel).await {
            Ok(mut pubsub) => {
                delay = INITIAL_BACKOFF;
                debug!("Subscribed to invalidation channel {}", channel);
                let mut messages = pubsub.on_message();
                while let Some(msg) = messages.next().await {
                    match msg.get_payload::<String>() {
                        Ok(key) => {
                            local.invalidate(&key).await;
                            debug!("Local tier invalidated for key: {}", key);
                        }
                        Err(e) => warn!("Failed to decode invalidation payload: {}", e),
                    }
                }
                warn!("Invalidation channel {} closed; resubscribing", channel);
                // Anything published while disconnected was missed
                local.invalidate_all();
            }
            Err(e) => {
                error!(
                    "Subscribe to {} failed: {}. Retrying in {:?}",
                    channel, e, delay
                );
            }
        }
        tokio::time::sleep(delay).await;
        delay = delay.saturating_mul(2).min(MAX_BACKOFF);
    }
}

async fn subscribe(client: &redis::Client, channel: &str) -> redis::RedisResult<redis::aio::PubSub> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    Ok(pubsub)
}
