//! Transients
//!
//! Named values with an optional lifetime. With a persistent cache tier the
//! value lives in the cache under [`CacheGroup::Transients`] and the tier's own
//! TTL handles expiry. Without one, each transient is a pair of options:
//!
//! - `_transient_{name}` holds the value
//! - `_transient_timeout_{name}` holds the absolute expiry (epoch seconds)
//!
//! A transient without expiry is autoloaded and has no timeout record. Expiry
//! is detected lazily: a read past the timeout deletes both records and reports
//! the transient absent. [`Transients::delete_expired`] sweeps the rest.

use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

use crate::codec::decode;
use crate::hooks::OptionEvent;
use crate::{Autoload, CacheGroup, OptionError, OptionStore, ScanFilter};

/// Transient operations borrowed from an [`OptionStore`]
pub struct Transients<'a> {
    store: &'a OptionStore,
}

impl<'a> Transients<'a> {
    pub(crate) fn new(store: &'a OptionStore) -> Self {
        Self { store }
    }

    fn value_key(&self, name: &str) -> String {
        format!("{}{}", self.store.config().transient_prefix, name)
    }

    fn timeout_key(&self, name: &str) -> String {
        format!("{}{}", self.store.config().transient_timeout_prefix, name)
    }

    fn persistent(&self) -> bool {
        self.store.cache().is_persistent()
    }

    /// Read a transient, `false` when absent or expired.
    pub async fn get(&self, name: &str) -> Result<Value, OptionError> {
        let hooks = self.store.hooks();
        if let Some(value) = hooks.pre_transient(name) {
            return Ok(value);
        }

        let value = if self.persistent() {
            self.store
                .cache()
                .get(CacheGroup::Transients, name)
                .await
                .unwrap_or(Value::Bool(false))
        } else {
            // The bulk map may be the all-rows fallback, so membership there
            // is no proof of autoload. Check the timeout record every time.
            let value_key = self.value_key(name);
            if self.expired(name).await? {
                debug!("Transient '{}' expired, deleting", name);
                self.store.delete(&value_key).await?;
                self.store.delete(&self.timeout_key(name)).await?;
                Value::Bool(false)
            } else {
                self.store.get(&value_key).await?
            }
        };

        Ok(hooks.transient(name, value))
    }

    async fn expired(&self, name: &str) -> Result<bool, OptionError> {
        let timeout = self.store.get(&self.timeout_key(name)).await?;
        Ok(timeout
            .as_u64()
            .is_some_and(|at| at < self.store.clock().now()))
    }

    /// Store a transient. `expiration` is a lifetime in seconds, `0` for none.
    pub async fn set(&self, name: &str, value: Value, expiration: u64) -> Result<bool, OptionError> {
        let hooks = self.store.hooks();
        let value = hooks.pre_set_transient(name, value, expiration);
        let expiration = hooks.expiration_of_transient(name, expiration, &value);

        let stored = if self.persistent() {
            let ttl = (expiration > 0).then(|| Duration::from_secs(expiration));
            self.store
                .cache()
                .set(CacheGroup::Transients, name, value.clone(), ttl)
                .await
        } else {
            self.set_records(name, value.clone(), expiration).await?
        };

        if stored {
            hooks.emit(&OptionEvent::TransientSet {
                name,
                value: &value,
                expiration,
            });
        }
        Ok(stored)
    }

    async fn set_records(
        &self,
        name: &str,
        value: Value,
        expiration: u64,
    ) -> Result<bool, OptionError> {
        let store = self.store;
        let value_key = self.value_key(name);
        let timeout_key = self.timeout_key(name);
        let expires_at = || Value::from(store.clock().now().saturating_add(expiration));

        if !store.holds_value(&value_key).await? {
            let autoload = if expiration > 0 {
                store.add(&timeout_key, expires_at(), Autoload::No).await?;
                Autoload::No
            } else {
                Autoload::Yes
            };
            return store.add(&value_key, value, autoload).await;
        }

        if expiration > 0 {
            if !store.holds_value(&timeout_key).await? {
                // The value row may be autoloaded; recreate it unautoloaded so
                // reads consult the new timeout record.
                store.delete(&value_key).await?;
                store.add(&timeout_key, expires_at(), Autoload::No).await?;
                return store.add(&value_key, value, Autoload::No).await;
            }
            store.update(&timeout_key, expires_at(), None).await?;
        }
        store.update(&value_key, value, None).await
    }

    /// Delete a transient and its timeout record.
    pub async fn delete(&self, name: &str) -> Result<bool, OptionError> {
        let hooks = self.store.hooks();
        hooks.emit(&OptionEvent::TransientDeleting { name });

        let deleted = if self.persistent() {
            self.store.cache().delete(CacheGroup::Transients, name).await
        } else {
            let deleted = self.store.delete(&self.value_key(name)).await?;
            if deleted {
                self.store.delete(&self.timeout_key(name)).await?;
            }
            deleted
        };

        if deleted {
            hooks.emit(&OptionEvent::TransientDeleted { name });
        }
        Ok(deleted)
    }

    /// Delete every transient whose timeout has passed. Returns how many
    /// transients were removed.
    ///
    /// Only the option-backed representation is swept; a persistent cache
    /// tier expires entries on its own.
    pub async fn delete_expired(&self) -> Result<usize, OptionError> {
        if self.persistent() {
            return Ok(0);
        }

        let prefix = &self.store.config().transient_timeout_prefix;
        let rows = self
            .store
            .table()
            .scan(&ScanFilter::matching(format!("{prefix}*")))
            .await?;
        let now = self.store.clock().now();

        let mut removed = 0;
        for row in rows {
            let Some(name) = row.name.strip_prefix(prefix.as_str()) else {
                continue;
            };
            if !decode(&row.value).as_u64().is_some_and(|at| at < now) {
                continue;
            }
            if self.store.delete(&self.value_key(name)).await? {
                removed += 1;
            }
            self.store.delete(&row.name).await?;
        }

        if removed > 0 {
            info!("Deleted {} expired transients", removed);
        }
        Ok(removed)
    }
}
