//! Interception points around option and transient operations
//!
//! Hooks live in an explicit dispatch table keyed by kind and [`Scope`]. A scope
//! is either one option (or transient) name or every name. Registration returns
//! a [`HookId`] which removes exactly that handler again.
//!
//! Dispatch semantics:
//! - `pre_*` read overrides short-circuit: the first handler returning
//!   something other than `None` or `false` wins, name-scoped handlers before
//!   global ones.
//! - Filters (`default_option`, `option`, `pre_update_option`, `sanitize`,
//!   transient filters) fold the value through every handler in registration
//!   order, name-scoped handlers before global ones.
//! - Listeners observe [`OptionEvent`]s. "Before" events reach global listeners
//!   first, "after" events reach name-scoped listeners first.
//!
//! Handlers are cloned out of the table before they run, so a handler may
//! itself register or remove hooks.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::ValidationErrors;
use crate::codec;

/// Handle identifying one registered hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

/// Which names a hook applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Name(String),
}

impl Scope {
    pub fn name(name: impl Into<String>) -> Self {
        Scope::Name(name.into())
    }
}

/// `(name, default) -> Some(value)` to bypass the store entirely
pub type PreOptionFn = Arc<dyn Fn(&str, &Value) -> Option<Value> + Send + Sync>;
/// `(name, default, default_was_passed) -> default`
pub type DefaultOptionFn = Arc<dyn Fn(&str, Value, bool) -> Value + Send + Sync>;
/// `(name, value) -> value`
pub type ValueFilterFn = Arc<dyn Fn(&str, Value) -> Value + Send + Sync>;
/// `(name, new_value, old_value) -> new_value`
pub type PreUpdateFn = Arc<dyn Fn(&str, Value, &Value) -> Value + Send + Sync>;
/// `(name, candidate, errors)`
pub type ValidateFn = Arc<dyn Fn(&str, &Value, &mut ValidationErrors) + Send + Sync>;
/// `(name, value, original_value) -> value`
pub type SanitizeFn = Arc<dyn Fn(&str, Value, &Value) -> Value + Send + Sync>;
/// `name -> Some(value)` to bypass the transient store
pub type PreTransientFn = Arc<dyn Fn(&str) -> Option<Value> + Send + Sync>;
/// `(name, value, expiration_secs) -> value`
pub type PreSetTransientFn = Arc<dyn Fn(&str, Value, u64) -> Value + Send + Sync>;
/// `(name, expiration_secs, value) -> expiration_secs`
pub type ExpirationFn = Arc<dyn Fn(&str, u64, &Value) -> u64 + Send + Sync>;
pub type ListenerFn = Arc<dyn Fn(&OptionEvent<'_>) + Send + Sync>;

/// Notifications fired by mutating operations
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptionEvent<'a> {
    Adding {
        name: &'a str,
        value: &'a Value,
    },
    Added {
        name: &'a str,
        value: &'a Value,
    },
    Updating {
        name: &'a str,
        old: &'a Value,
        new: &'a Value,
    },
    Updated {
        name: &'a str,
        old: &'a Value,
        new: &'a Value,
    },
    Deleting {
        name: &'a str,
    },
    Deleted {
        name: &'a str,
    },
    TransientSet {
        name: &'a str,
        value: &'a Value,
        expiration: u64,
    },
    TransientDeleting {
        name: &'a str,
    },
    TransientDeleted {
        name: &'a str,
    },
}

impl OptionEvent<'_> {
    pub fn name(&self) -> &str {
        match self {
            OptionEvent::Adding { name, .. }
            | OptionEvent::Added { name, .. }
            | OptionEvent::Updating { name, .. }
            | OptionEvent::Updated { name, .. }
            | OptionEvent::Deleting { name }
            | OptionEvent::Deleted { name }
            | OptionEvent::TransientSet { name, .. }
            | OptionEvent::TransientDeleting { name }
            | OptionEvent::TransientDeleted { name } => name,
        }
    }

    /// Fired before the durable store is touched
    pub fn is_before(&self) -> bool {
        matches!(
            self,
            OptionEvent::Adding { .. }
                | OptionEvent::Updating { .. }
                | OptionEvent::Deleting { .. }
                | OptionEvent::TransientDeleting { .. }
        )
    }
}

struct HookTable<H> {
    entries: RwLock<HashMap<Scope, Vec<(HookId, H)>>>,
}

impl<H: Clone> HookTable<H> {
    fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn insert(&self, scope: Scope, id: HookId, handler: H) {
        self.entries
            .write()
            .entry(scope)
            .or_default()
            .push((id, handler));
    }

    fn remove(&self, id: HookId) -> bool {
        let mut entries = self.entries.write();
        let mut removed = false;
        entries.retain(|_, handlers| {
            let before = handlers.len();
            handlers.retain(|(hid, _)| *hid != id);
            removed |= handlers.len() != before;
            !handlers.is_empty()
        });
        removed
    }

    fn scoped(&self, scope: &Scope) -> Vec<H> {
        self.entries
            .read()
            .get(scope)
            .map(|handlers| handlers.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }

    /// Handlers for `name` first, then global ones.
    fn for_name(&self, name: &str) -> Vec<H> {
        let entries = self.entries.read();
        let named = entries.get(&Scope::Name(name.to_owned()));
        let global = entries.get(&Scope::Global);
        named
            .into_iter()
            .chain(global)
            .flat_map(|handlers| handlers.iter().map(|(_, h)| h.clone()))
            .collect()
    }

    fn has(&self, scope: &Scope) -> bool {
        self.entries.read().contains_key(scope)
    }
}

/// Dispatch table for every interception point
pub struct Hooks {
    next_id: AtomicU64,
    pre_option: HookTable<PreOptionFn>,
    default_option: HookTable<DefaultOptionFn>,
    option: HookTable<ValueFilterFn>,
    pre_update_option: HookTable<PreUpdateFn>,
    validate: HookTable<ValidateFn>,
    sanitize: HookTable<SanitizeFn>,
    listeners: HookTable<ListenerFn>,
    pre_transient: HookTable<PreTransientFn>,
    transient: HookTable<ValueFilterFn>,
    pre_set_transient: HookTable<PreSetTransientFn>,
    expiration_of_transient: HookTable<ExpirationFn>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pre_option: HookTable::new(),
            default_option: HookTable::new(),
            option: HookTable::new(),
            pre_update_option: HookTable::new(),
            validate: HookTable::new(),
            sanitize: HookTable::new(),
            listeners: HookTable::new(),
            pre_transient: HookTable::new(),
            transient: HookTable::new(),
            pre_set_transient: HookTable::new(),
            expiration_of_transient: HookTable::new(),
        }
    }

    fn next(&self) -> HookId {
        HookId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    // ============ Registration ============

    pub fn on_pre_option<F>(&self, scope: Scope, f: F) -> HookId
    where
        F: Fn(&str, &Value) -> Option<Value> + Send + Sync + 'static,
    {
        let id = self.next();
        self.pre_option.insert(scope, id, Arc::new(f));
        id
    }

    pub fn on_default_option<F>(&self, name: &str, f: F) -> HookId
    where
        F: Fn(&str, Value, bool) -> Value + Send + Sync + 'static,
    {
        let id = self.next();
        self.default_option.insert(Scope::name(name), id, Arc::new(f));
        id
    }

    pub fn on_option<F>(&self, scope: Scope, f: F) -> HookId
    where
        F: Fn(&str, Value) -> Value + Send + Sync + 'static,
    {
        let id = self.next();
        self.option.insert(scope, id, Arc::new(f));
        id
    }

    pub fn on_pre_update_option<F>(&self, scope: Scope, f: F) -> HookId
    where
        F: Fn(&str, Value, &Value) -> Value + Send + Sync + 'static,
    {
        let id = self.next();
        self.pre_update_option.insert(scope, id, Arc::new(f));
        id
    }

    pub fn on_validate<F>(&self, name: &str, f: F) -> HookId
    where
        F: Fn(&str, &Value, &mut ValidationErrors) + Send + Sync + 'static,
    {
        self.insert_validate(name, Arc::new(f))
    }

    pub fn on_sanitize<F>(&self, name: &str, f: F) -> HookId
    where
        F: Fn(&str, Value, &Value) -> Value + Send + Sync + 'static,
    {
        self.insert_sanitize(name, Arc::new(f))
    }

    pub(crate) fn insert_validate(&self, name: &str, f: ValidateFn) -> HookId {
        let id = self.next();
        self.validate.insert(Scope::name(name), id, f);
        id
    }

    pub(crate) fn insert_sanitize(&self, name: &str, f: SanitizeFn) -> HookId {
        let id = self.next();
        self.sanitize.insert(Scope::name(name), id, f);
        id
    }

    pub fn on_event<F>(&self, scope: Scope, f: F) -> HookId
    where
        F: Fn(&OptionEvent<'_>) + Send + Sync + 'static,
    {
        let id = self.next();
        self.listeners.insert(scope, id, Arc::new(f));
        id
    }

    pub fn on_pre_transient<F>(&self, scope: Scope, f: F) -> HookId
    where
        F: Fn(&str) -> Option<Value> + Send + Sync + 'static,
    {
        let id = self.next();
        self.pre_transient.insert(scope, id, Arc::new(f));
        id
    }

    pub fn on_transient<F>(&self, scope: Scope, f: F) -> HookId
    where
        F: Fn(&str, Value) -> Value + Send + Sync + 'static,
    {
        let id = self.next();
        self.transient.insert(scope, id, Arc::new(f));
        id
    }

    pub fn on_pre_set_transient<F>(&self, scope: Scope, f: F) -> HookId
    where
        F: Fn(&str, Value, u64) -> Value + Send + Sync + 'static,
    {
        let id = self.next();
        self.pre_set_transient.insert(scope, id, Arc::new(f));
        id
    }

    pub fn on_expiration_of_transient<F>(&self, scope: Scope, f: F) -> HookId
    where
        F: Fn(&str, u64, &Value) -> u64 + Send + Sync + 'static,
    {
        let id = self.next();
        self.expiration_of_transient.insert(scope, id, Arc::new(f));
        id
    }

    /// Remove a hook of any kind. Returns false when the id is unknown.
    pub fn remove(&self, id: HookId) -> bool {
        // Ids are unique across tables, so at most one of these matches
        self.pre_option.remove(id)
            || self.default_option.remove(id)
            || self.option.remove(id)
            || self.pre_update_option.remove(id)
            || self.validate.remove(id)
            || self.sanitize.remove(id)
            || self.listeners.remove(id)
            || self.pre_transient.remove(id)
            || self.transient.remove(id)
            || self.pre_set_transient.remove(id)
            || self.expiration_of_transient.remove(id)
    }

    /// Whether a default-value hook is installed for `name`
    pub fn has_default(&self, name: &str) -> bool {
        self.default_option.has(&Scope::name(name))
    }

    // ============ Dispatch ============

    pub fn pre_option(&self, name: &str, default: &Value) -> Option<Value> {
        self.pre_option
            .for_name(name)
            .into_iter()
            .find_map(|f| f(name, default).filter(|v| !codec::is_false(v)))
    }

    pub fn default_option(&self, name: &str, default: Value, passed_default: bool) -> Value {
        self.default_option
            .scoped(&Scope::name(name))
            .into_iter()
            .fold(default, |value, f| f(name, value, passed_default))
    }

    pub fn option(&self, name: &str, value: Value) -> Value {
        self.option
            .for_name(name)
            .into_iter()
            .fold(value, |value, f| f(name, value))
    }

    pub fn pre_update_option(&self, name: &str, value: Value, old: &Value) -> Value {
        self.pre_update_option
            .for_name(name)
            .into_iter()
            .fold(value, |value, f| f(name, value, old))
    }

    pub fn validate(&self, name: &str, value: &Value, errors: &mut ValidationErrors) {
        for f in self.validate.scoped(&Scope::name(name)) {
            f(name, value, errors);
        }
    }

    pub fn sanitize(&self, name: &str, value: Value, original: &Value) -> Value {
        self.sanitize
            .scoped(&Scope::name(name))
            .into_iter()
            .fold(value, |value, f| f(name, value, original))
    }

    pub fn emit(&self, event: &OptionEvent<'_>) {
        let named = self.listeners.scoped(&Scope::name(event.name()));
        let global = self.listeners.scoped(&Scope::Global);
        let ordered = if event.is_before() {
            global.into_iter().chain(named)
        } else {
            named.into_iter().chain(global)
        };
        for f in ordered {
            f(event);
        }
    }

    pub fn pre_transient(&self, name: &str) -> Option<Value> {
        self.pre_transient
            .for_name(name)
            .into_iter()
            .find_map(|f| f(name).filter(|v| !codec::is_false(v)))
    }

    pub fn transient(&self, name: &str, value: Value) -> Value {
        self.transient
            .for_name(name)
            .into_iter()
            .fold(value, |value, f| f(name, value))
    }

    pub fn pre_set_transient(&self, name: &str, value: Value, expiration: u64) -> Value {
        self.pre_set_transient
            .for_name(name)
            .into_iter()
            .fold(value, |value, f| f(name, value, expiration))
    }

    pub fn expiration_of_transient(&self, name: &str, expiration: u64, value: &Value) -> u64 {
        self.expiration_of_transient
            .for_name(name)
            .into_iter()
            .fold(expiration, |exp, f| f(name, exp, value))
    }
}
