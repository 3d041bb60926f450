//! Option store
//!
//! CRUD over named values layered over the durable [`OptionTable`] and a
//! best-effort [`ObjectCache`]. Reads fall through, in order:
//!
//! 1. `pre_option` overrides
//! 2. the `notoptions` negative cache (name known to be absent)
//! 3. the `alloptions` bulk map of every autoloaded option
//! 4. the per-option cache entry
//! 5. the durable table, caching the row or recording its absence
//!
//! Every mutation writes the durable table first and then patches or
//! invalidates both cache tiers in the same call. The cache is never treated as
//! authoritative: a cold or absent cache only costs extra table reads.
//!
//! Mutators return a plain boolean (`false` is both "nothing to do"
//! and "failed"); the `*_outcome` variants return the precise [`WriteOutcome`].

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::codec::{self, decode, encode};
use crate::hooks::OptionEvent;
use crate::{
    Autoload, CacheGroup, Clock, Hooks, ObjectCache, OptionError, OptionTable, ScanFilter,
    SettingsErrors, SettingsRegistry, StoreConfig, SystemClock, TableUpdate, Transients,
    ValidationErrors,
};

/// Cache key of the bulk map of autoloaded options
pub const ALLOPTIONS_KEY: &str = "alloptions";
/// Cache key of the negative-existence map
pub const NOTOPTIONS_KEY: &str = "notoptions";

/// Precise result of a mutating operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    Updated,
    Deleted,
    /// The new value equals the stored one; nothing was written
    Unchanged,
    /// Invalid name, or the option already exists
    Rejected,
    NotFound,
    /// The durable store refused the write
    Failed,
}

impl WriteOutcome {
    /// Narrow to the boolean result of the public mutators.
    pub fn succeeded(self) -> bool {
        matches!(
            self,
            WriteOutcome::Created | WriteOutcome::Updated | WriteOutcome::Deleted
        )
    }
}

/// Trimmed, non-empty option name
fn normalize(name: &str) -> Option<&str> {
    let name = name.trim();
    (!name.is_empty()).then_some(name)
}

/// Shared option store
pub struct OptionStore {
    table: Arc<dyn OptionTable>,
    cache: Arc<dyn ObjectCache>,
    hooks: Arc<Hooks>,
    settings: SettingsRegistry,
    errors: SettingsErrors,
    config: StoreConfig,
    clock: Arc<dyn Clock>,
}

impl OptionStore {
    /// Create a store with default configuration, wall-clock time and an
    /// empty hook table and settings registry.
    pub fn new(table: Arc<dyn OptionTable>, cache: Arc<dyn ObjectCache>) -> Self {
        let hooks = Arc::new(Hooks::new());
        Self {
            table,
            cache,
            settings: SettingsRegistry::new(Arc::clone(&hooks)),
            hooks,
            errors: SettingsErrors::new(),
            config: StoreConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn hooks(&self) -> &Arc<Hooks> {
        &self.hooks
    }

    pub fn settings(&self) -> &SettingsRegistry {
        &self.settings
    }

    /// Out-of-band sink receiving validation failures
    pub fn settings_errors(&self) -> &SettingsErrors {
        &self.errors
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn table(&self) -> &Arc<dyn OptionTable> {
        &self.table
    }

    pub fn cache(&self) -> &Arc<dyn ObjectCache> {
        &self.cache
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Transient operations on top of this store
    pub fn transients(&self) -> Transients<'_> {
        Transients::new(self)
    }

    fn protect(&self, name: &str) -> Result<(), OptionError> {
        if self.config.is_protected(name) {
            return Err(OptionError::ProtectedName(name.to_owned()));
        }
        Ok(())
    }

    fn failed(&self, op: &str, name: &str, err: impl std::fmt::Display) -> WriteOutcome {
        warn!("{} of option '{}' failed: {}", op, name, err);
        WriteOutcome::Failed
    }

    // ============ Reads ============

    /// Read an option. Absent options resolve to the registered default, or
    /// `false` when none is registered. An invalid name reads as `false`.
    pub async fn get(&self, name: &str) -> Result<Value, OptionError> {
        self.read(name, None).await
    }

    /// Read an option, resolving absence to `default`. An explicit default
    /// takes precedence over a registered one.
    pub async fn get_or(&self, name: &str, default: Value) -> Result<Value, OptionError> {
        self.read(name, Some(default)).await
    }

    async fn read(&self, name: &str, default: Option<Value>) -> Result<Value, OptionError> {
        let Some(name) = normalize(name) else {
            return Ok(Value::Bool(false));
        };
        let passed_default = default.is_some();
        let default = default.unwrap_or(Value::Bool(false));

        if let Some(value) = self.hooks.pre_option(name, &default) {
            debug!("Option '{}' short-circuited by pre_option hook", name);
            return Ok(value);
        }

        if self.not_options().await.contains_key(name) {
            debug!("Option '{}' known absent (negative cache)", name);
            return Ok(self.hooks.default_option(name, default, passed_default));
        }

        let raw = match self.load_alloptions().await?.remove(name) {
            Some(Value::String(raw)) => {
                debug!("Option '{}' served from autoload map", name);
                raw
            }
            _ => match self.cache.get(CacheGroup::Options, name).await {
                Some(Value::String(raw)) => {
                    debug!("Cache hit for option '{}'", name);
                    raw
                }
                _ => {
                    debug!("Cache miss for option '{}', reading table", name);
                    match self.table.get_row(name).await? {
                        Some(row) => {
                            self.cache
                                .add(
                                    CacheGroup::Options,
                                    name,
                                    Value::String(row.value.clone()),
                                    None,
                                )
                                .await;
                            row.value
                        }
                        None => {
                            self.remember_not_option(name).await;
                            return Ok(self.hooks.default_option(name, default, passed_default));
                        }
                    }
                }
            },
        };

        Ok(self.hooks.option(name, decode(&raw)))
    }

    /// Decoded values of every autoloaded option, loading the bulk map on a
    /// cache miss.
    pub async fn autoloaded(&self) -> Result<HashMap<String, Value>, OptionError> {
        Ok(self
            .load_alloptions()
            .await?
            .into_iter()
            .filter_map(|(name, raw)| raw.as_str().map(|r| (name, decode(r))))
            .collect())
    }

    /// Warm the cache for `names` with one table read per uncached name,
    /// recording absent names in the negative cache.
    pub async fn prime(&self, names: &[&str]) -> Result<(), OptionError> {
        let alloptions = self.load_alloptions().await?;
        let mut missing = Vec::new();
        for name in names.iter().filter_map(|n| normalize(n)) {
            if alloptions.contains_key(name)
                || self.cache.get(CacheGroup::Options, name).await.is_some()
            {
                continue;
            }
            match self.table.get_row(name).await? {
                Some(row) => {
                    self.cache
                        .add(CacheGroup::Options, name, Value::String(row.value), None)
                        .await;
                }
                None => missing.push(name),
            }
        }
        if !missing.is_empty() {
            let mut notoptions = self.not_options().await;
            for name in missing {
                notoptions.insert(name.to_owned(), Value::Bool(true));
            }
            self.cache
                .set(CacheGroup::Options, NOTOPTIONS_KEY, Value::Object(notoptions), None)
                .await;
        }
        Ok(())
    }

    /// The bulk autoload map (name -> encoded payload), rebuilt from one table
    /// scan when the cache misses. When no option is autoloaded the scan falls
    /// back to every row.
    async fn load_alloptions(&self) -> Result<Map<String, Value>, OptionError> {
        if let Some(Value::Object(map)) = self.cache.get(CacheGroup::Options, ALLOPTIONS_KEY).await
        {
            return Ok(map);
        }

        let mut rows = self.table.scan(&ScanFilter::autoloaded()).await?;
        if rows.is_empty() {
            rows = self.table.scan(&ScanFilter::default()).await?;
        }
        debug!("Rebuilt autoload map from {} rows", rows.len());

        let map: Map<String, Value> = rows
            .into_iter()
            .map(|row| (row.name, Value::String(row.value)))
            .collect();
        self.cache
            .add(
                CacheGroup::Options,
                ALLOPTIONS_KEY,
                Value::Object(map.clone()),
                None,
            )
            .await;
        Ok(map)
    }

    /// Cached autoload map if present, never touching the table.
    async fn cached_alloptions(&self) -> Option<Map<String, Value>> {
        match self.cache.get(CacheGroup::Options, ALLOPTIONS_KEY).await {
            Some(Value::Object(map)) => Some(map),
            _ => None,
        }
    }

    /// Set (`Some`) or remove (`None`) one entry of the autoload map. If the
    /// map can't be loaded it is dropped so the next read rebuilds it.
    async fn patch_alloptions(&self, name: &str, encoded: Option<&str>) {
        match self.load_alloptions().await {
            Ok(mut map) => {
                match encoded {
                    Some(raw) => map.insert(name.to_owned(), Value::String(raw.to_owned())),
                    None => map.remove(name),
                };
                self.cache
                    .set(CacheGroup::Options, ALLOPTIONS_KEY, Value::Object(map), None)
                    .await;
            }
            Err(e) => {
                warn!(
                    "Could not load autoload map while patching '{}': {}. Dropping it.",
                    name, e
                );
                self.cache.delete(CacheGroup::Options, ALLOPTIONS_KEY).await;
            }
        }
    }

    async fn not_options(&self) -> Map<String, Value> {
        match self.cache.get(CacheGroup::Options, NOTOPTIONS_KEY).await {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    async fn remember_not_option(&self, name: &str) {
        let mut notoptions = self.not_options().await;
        notoptions.insert(name.to_owned(), Value::Bool(true));
        self.cache
            .set(CacheGroup::Options, NOTOPTIONS_KEY, Value::Object(notoptions), None)
            .await;
    }

    async fn forget_not_option(&self, name: &str) {
        let mut notoptions = self.not_options().await;
        if notoptions.remove(name).is_some() {
            self.cache
                .set(CacheGroup::Options, NOTOPTIONS_KEY, Value::Object(notoptions), None)
                .await;
        }
    }

    // ============ Pipeline ============

    /// Run the validate and sanitize steps registered for `name`.
    ///
    /// A value that fails validation is replaced by the currently stored value
    /// and the errors are sent to [`Self::settings_errors`]; the write goes on.
    pub async fn sanitize_option(&self, name: &str, value: Value) -> Result<Value, OptionError> {
        let original = value.clone();
        let mut errors = ValidationErrors::new();
        self.hooks.validate(name, &value, &mut errors);

        let survivor = if errors.is_empty() {
            value
        } else {
            self.errors.record(name, errors);
            self.get(name).await?
        };

        Ok(self.hooks.sanitize(name, survivor, &original))
    }

    // ============ Writes ============

    /// Add a new option. Fails when the name is invalid or the option exists.
    pub async fn add(&self, name: &str, value: Value, autoload: Autoload) -> Result<bool, OptionError> {
        self.add_outcome(name, value, autoload)
            .await
            .map(WriteOutcome::succeeded)
    }

    pub async fn add_outcome(
        &self,
        name: &str,
        value: Value,
        autoload: Autoload,
    ) -> Result<WriteOutcome, OptionError> {
        let Some(name) = normalize(name) else {
            return Ok(WriteOutcome::Rejected);
        };
        self.protect(name)?;

        let value = match self.sanitize_option(name, value).await {
            Ok(value) => value,
            Err(e) => return Ok(self.failed("add", name, e)),
        };
        self.insert(name, value, autoload).await
    }

    /// Existence check, persist and cache refresh for an already sanitized value
    async fn insert(
        &self,
        name: &str,
        value: Value,
        autoload: Autoload,
    ) -> Result<WriteOutcome, OptionError> {
        // Unless the negative cache vouches for absence, the option exists when
        // its current value differs from what an absent option reads as.
        if !self.not_options().await.contains_key(name) {
            let absent = self.hooks.default_option(name, Value::Bool(false), false);
            match self.get(name).await {
                Ok(current) if current != absent => {
                    debug!("Option '{}' already exists, not adding", name);
                    return Ok(WriteOutcome::Rejected);
                }
                Ok(_) => {}
                Err(e) => return Ok(self.failed("add", name, e)),
            }
        }

        let encoded = encode(&value);
        self.hooks.emit(&OptionEvent::Adding {
            name,
            value: &value,
        });

        if let Err(e) = self.table.upsert(name, &encoded, autoload).await {
            return Ok(self.failed("add", name, e));
        }

        match autoload {
            Autoload::Yes => self.patch_alloptions(name, Some(&encoded)).await,
            Autoload::No => {
                if self
                    .cached_alloptions()
                    .await
                    .is_some_and(|map| map.contains_key(name))
                {
                    self.patch_alloptions(name, None).await;
                }
                self.cache
                    .set(CacheGroup::Options, name, Value::String(encoded), None)
                    .await;
            }
        }
        self.forget_not_option(name).await;

        self.hooks.emit(&OptionEvent::Added {
            name,
            value: &value,
        });
        Ok(WriteOutcome::Created)
    }

    /// Update an option, adding it (autoload `no` unless given) when absent.
    ///
    /// Returns false both when the value is unchanged and when the write fails.
    pub async fn update(
        &self,
        name: &str,
        value: Value,
        autoload: Option<Autoload>,
    ) -> Result<bool, OptionError> {
        self.update_outcome(name, value, autoload)
            .await
            .map(WriteOutcome::succeeded)
    }

    pub async fn update_outcome(
        &self,
        name: &str,
        value: Value,
        autoload: Option<Autoload>,
    ) -> Result<WriteOutcome, OptionError> {
        let Some(name) = normalize(name) else {
            return Ok(WriteOutcome::Rejected);
        };
        self.protect(name)?;

        let value = match self.sanitize_option(name, value).await {
            Ok(value) => value,
            Err(e) => return Ok(self.failed("update", name, e)),
        };
        let old = match self.get(name).await {
            Ok(old) => old,
            Err(e) => return Ok(self.failed("update", name, e)),
        };
        let value = self.hooks.pre_update_option(name, value, &old);

        if autoload.is_none() && (value == old || encode(&value) == encode(&old)) {
            debug!("Option '{}' unchanged, skipping write", name);
            return Ok(WriteOutcome::Unchanged);
        }

        let absent = self.hooks.default_option(name, Value::Bool(false), false);
        if old == absent {
            return self
                .insert(name, value, autoload.unwrap_or(Autoload::No))
                .await;
        }

        let encoded = encode(&value);
        self.hooks.emit(&OptionEvent::Updating {
            name,
            old: &old,
            new: &value,
        });

        let update = TableUpdate {
            value: Some(encoded.clone()),
            autoload,
        };
        match self.table.update(name, update).await {
            Ok(true) => {}
            Ok(false) => return Ok(WriteOutcome::NotFound),
            Err(e) => return Ok(self.failed("update", name, e)),
        }

        self.forget_not_option(name).await;
        // A changed autoload flag does not move the option in or out of the
        // cached map; its value is patched wherever it currently lives.
        match self.load_alloptions().await {
            Ok(map) if map.contains_key(name) => {
                self.patch_alloptions(name, Some(&encoded)).await;
            }
            Ok(_) => {
                self.cache
                    .set(CacheGroup::Options, name, Value::String(encoded), None)
                    .await;
            }
            Err(e) => {
                warn!(
                    "Could not load autoload map after updating '{}': {}. Dropping caches.",
                    name, e
                );
                self.cache.delete(CacheGroup::Options, ALLOPTIONS_KEY).await;
                self.cache.delete(CacheGroup::Options, name).await;
            }
        }

        self.hooks.emit(&OptionEvent::Updated {
            name,
            old: &old,
            new: &value,
        });
        Ok(WriteOutcome::Updated)
    }

    /// Delete an option. Fails when no row exists.
    ///
    /// Absence is not written to the negative cache; the next read that misses
    /// records it.
    pub async fn delete(&self, name: &str) -> Result<bool, OptionError> {
        self.delete_outcome(name).await.map(WriteOutcome::succeeded)
    }

    pub async fn delete_outcome(&self, name: &str) -> Result<WriteOutcome, OptionError> {
        let Some(name) = normalize(name) else {
            return Ok(WriteOutcome::Rejected);
        };
        self.protect(name)?;

        let row = match self.table.get_row(name).await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(WriteOutcome::NotFound),
            Err(e) => return Ok(self.failed("delete", name, e)),
        };

        self.hooks.emit(&OptionEvent::Deleting { name });

        let deleted = match self.table.delete(name).await {
            Ok(deleted) => deleted,
            Err(e) => return Ok(self.failed("delete", name, e)),
        };

        let in_map = row.autoload == Autoload::Yes
            || self
                .cached_alloptions()
                .await
                .is_some_and(|map| map.contains_key(name));
        if in_map {
            self.patch_alloptions(name, None).await;
        }
        self.cache.delete(CacheGroup::Options, name).await;

        if !deleted {
            return Ok(WriteOutcome::NotFound);
        }
        self.hooks.emit(&OptionEvent::Deleted { name });
        Ok(WriteOutcome::Deleted)
    }

    /// Whether the option currently holds a value other than `false`.
    pub(crate) async fn holds_value(&self, name: &str) -> Result<bool, OptionError> {
        Ok(!codec::is_false(&self.get(name).await?))
    }
}
