//! optstore - Cached option store
//!
//! A durable store of named values (options) and short-lived named values
//! (transients), fronted by a best-effort cache:
//! - Durable tier: a pluggable [`OptionTable`] (in-memory, or SQLite with the
//!   `sqlite` feature)
//! - Cache tier: a pluggable [`ObjectCache`] (none, in-process Moka, or Redis
//!   with an optional local tier kept coherent over pub/sub)
//!
//! The store supports:
//! - Negative caching of absent options
//! - Bulk preloading of autoloaded options
//! - Typed hooks around reads and writes, with validation and sanitization
//! - Registered settings with defaults
//! - Transients with lazy expiry

mod clock;
pub mod codec;
mod config;
mod error;
mod hooks;
pub mod manage;
mod object_cache;
mod options;
mod redis_cache;
mod registry;
mod sanitize;
#[cfg(feature = "sqlite")]
mod sqlite;
mod table;
mod transient;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, StoreConfig};
pub use error::{BackendError, OptionError};
pub use hooks::{
    DefaultOptionFn, ExpirationFn, HookId, Hooks, ListenerFn, OptionEvent, PreOptionFn,
    PreSetTransientFn, PreTransientFn, PreUpdateFn, SanitizeFn, Scope, ValidateFn, ValueFilterFn,
};
pub use manage::{Manage, ManageError};
pub use object_cache::{CacheGroup, MemoryCache, NullCache, ObjectCache};
pub use options::{ALLOPTIONS_KEY, NOTOPTIONS_KEY, OptionStore, WriteOutcome};
pub use redis_cache::RedisCache;
pub use registry::{RegisteredSetting, SettingArgs, SettingType, SettingsRegistry};
pub use sanitize::{SettingError, SettingsErrors, ValidationErrors, absint, core_rules, is_email};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteTable;
pub use table::{Autoload, MemoryTable, OptionRow, OptionTable, ScanFilter, TableUpdate, wildcard_match};
pub use transient::Transients;

// Re-export async_trait for convenience
pub use async_trait::async_trait;
