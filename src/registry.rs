//! Registered settings
//!
//! A registration describes one option: its type, a description, an optional
//! default and optional validate/sanitize steps. Registering installs the
//! matching hooks, unregistering removes exactly those hooks again. At most one
//! registration exists per option name; the group is grouping metadata used to
//! list the options a settings page owns.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, info};

use crate::ValidationErrors;
use crate::hooks::{HookId, Hooks, SanitizeFn, ValidateFn};

/// Declared value type of a setting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingType {
    #[default]
    String,
    Boolean,
    Integer,
    Number,
    Array,
    Object,
}

/// Arguments for [`SettingsRegistry::register`]
///
/// Unset fields take the registry defaults: type `string`, empty description,
/// no default, no validate or sanitize step, hidden from REST.
pub struct SettingArgs {
    pub setting_type: SettingType,
    pub description: String,
    pub default: Option<Value>,
    pub validate: Option<ValidateFn>,
    pub sanitize: Option<SanitizeFn>,
    pub show_in_rest: bool,
}

impl Debug for SettingArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingArgs")
            .field("setting_type", &self.setting_type)
            .field("description", &self.description)
            .field("default", &self.default)
            .field("validate", &self.validate.is_some())
            .field("sanitize", &self.sanitize.is_some())
            .field("show_in_rest", &self.show_in_rest)
            .finish()
    }
}

impl Default for SettingArgs {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingArgs {
    pub fn new() -> Self {
        Self {
            setting_type: SettingType::String,
            description: String::new(),
            default: None,
            validate: None,
            sanitize: None,
            show_in_rest: false,
        }
    }

    pub fn setting_type(mut self, setting_type: SettingType) -> Self {
        self.setting_type = setting_type;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Value returned by reads of the option while it is absent
    pub fn default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn validate<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &Value, &mut ValidationErrors) + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(f));
        self
    }

    pub fn sanitize<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, Value, &Value) -> Value + Send + Sync + 'static,
    {
        self.sanitize = Some(Arc::new(f));
        self
    }

    pub fn show_in_rest(mut self, show: bool) -> Self {
        self.show_in_rest = show;
        self
    }
}

/// Snapshot of one registration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisteredSetting {
    pub group: String,
    pub name: String,
    #[serde(rename = "type")]
    pub setting_type: SettingType,
    pub description: String,
    pub default: Option<Value>,
    pub has_validate: bool,
    pub has_sanitize: bool,
    pub show_in_rest: bool,
}

struct Registration {
    setting: RegisteredSetting,
    hook_ids: Vec<HookId>,
}

#[derive(Default)]
struct RegistryState {
    settings: BTreeMap<String, Registration>,
    groups: BTreeMap<String, Vec<String>>,
}

/// Process-wide registry of settings, empty at startup
pub struct SettingsRegistry {
    hooks: Arc<Hooks>,
    state: RwLock<RegistryState>,
}

impl SettingsRegistry {
    pub fn new(hooks: Arc<Hooks>) -> Self {
        Self {
            hooks,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Register `name` under `group`, replacing any earlier registration of
    /// the same name.
    pub fn register(&self, group: &str, name: &str, args: SettingArgs) {
        let mut state = self.state.write();
        if let Some(previous) = Self::take(&mut state, name) {
            debug!(
                "Replacing registration of setting '{}' (was in group '{}')",
                name, previous.setting.group
            );
            self.teardown(previous);
        }

        let mut hook_ids = Vec::new();
        if let Some(sanitize) = &args.sanitize {
            hook_ids.push(self.hooks.insert_sanitize(name, Arc::clone(sanitize)));
        }
        if let Some(validate) = &args.validate {
            hook_ids.push(self.hooks.insert_validate(name, Arc::clone(validate)));
        }
        if let Some(default) = &args.default {
            let registered = default.clone();
            hook_ids.push(
                self.hooks
                    .on_default_option(name, move |_, default, passed_default| {
                        if passed_default {
                            default
                        } else {
                            registered.clone()
                        }
                    }),
            );
        }

        let setting = RegisteredSetting {
            group: group.to_owned(),
            name: name.to_owned(),
            setting_type: args.setting_type,
            description: args.description,
            default: args.default,
            has_validate: args.validate.is_some(),
            has_sanitize: args.sanitize.is_some(),
            show_in_rest: args.show_in_rest,
        };
        state
            .groups
            .entry(group.to_owned())
            .or_default()
            .push(name.to_owned());
        state
            .settings
            .insert(name.to_owned(), Registration { setting, hook_ids });

        info!("Registered setting '{}' in group '{}'", name, group);
    }

    /// Remove `name` from `group` and tear down the hooks its registration
    /// installed. Unregistering twice is a no-op. Returns whether anything
    /// was removed.
    pub fn unregister(&self, group: &str, name: &str) -> bool {
        let mut state = self.state.write();
        let mut removed = false;

        if let Some(members) = state.groups.get_mut(group) {
            let before = members.len();
            members.retain(|m| m != name);
            removed = members.len() != before;
            if members.is_empty() {
                state.groups.remove(group);
            }
        }

        if let Some(registration) = state.settings.remove(name) {
            self.teardown(registration);
            removed = true;
        }

        if removed {
            info!("Unregistered setting '{}' from group '{}'", name, group);
        }
        removed
    }

    fn take(state: &mut RegistryState, name: &str) -> Option<Registration> {
        let registration = state.settings.remove(name)?;
        let group = &registration.setting.group;
        if let Some(members) = state.groups.get_mut(group) {
            members.retain(|m| m != name);
            if members.is_empty() {
                state.groups.remove(group);
            }
        }
        Some(registration)
    }

    fn teardown(&self, registration: Registration) {
        for id in registration.hook_ids {
            self.hooks.remove(id);
        }
    }

    pub fn get(&self, name: &str) -> Option<RegisteredSetting> {
        self.state
            .read()
            .settings
            .get(name)
            .map(|r| r.setting.clone())
    }

    /// Every registration, ordered by option name
    pub fn list(&self) -> Vec<RegisteredSetting> {
        self.state
            .read()
            .settings
            .values()
            .map(|r| r.setting.clone())
            .collect()
    }

    /// Option names registered under `group`, in registration order
    pub fn group(&self, group: &str) -> Vec<String> {
        self.state
            .read()
            .groups
            .get(group)
            .cloned()
            .unwrap_or_default()
    }

    /// Registrations exposed through the REST surface
    pub fn rest_settings(&self) -> Vec<RegisteredSetting> {
        self.list().into_iter().filter(|s| s.show_in_rest).collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().settings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().settings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> (Arc<Hooks>, SettingsRegistry) {
        let hooks = Arc::new(Hooks::new());
        let registry = SettingsRegistry::new(Arc::clone(&hooks));
        (hooks, registry)
    }

    #[test]
    fn test_register_defaults() {
        let (_, registry) = registry();
        registry.register("general", "color", SettingArgs::new());
        let setting = registry.get("color").unwrap();
        assert_eq!(setting.setting_type, SettingType::String);
        assert_eq!(setting.description, "");
        assert_eq!(setting.default, None);
        assert!(!setting.show_in_rest);
        assert_eq!(registry.group("general"), vec!["color"]);
    }

    #[test]
    fn test_default_hook_respects_passed_default() {
        let (hooks, registry) = registry();
        registry.register("general", "color", SettingArgs::new().default(json!("blue")));

        assert_eq!(hooks.default_option("color", json!(false), false), json!("blue"));
        assert_eq!(hooks.default_option("color", json!("red"), true), json!("red"));
    }

    #[test]
    fn test_unregister_tears_down_hooks() {
        let (hooks, registry) = registry();
        registry.register(
            "general",
            "color",
            SettingArgs::new()
                .default(json!("blue"))
                .sanitize(|_, v, _| v)
                .validate(|_, _, _| {}),
        );
        assert!(hooks.has_default("color"));

        assert!(registry.unregister("general", "color"));
        assert!(!hooks.has_default("color"));
        assert!(registry.get("color").is_none());
        assert!(registry.group("general").is_empty());

        assert!(!registry.unregister("general", "color"));
    }

    #[test]
    fn test_reregister_replaces() {
        let (hooks, registry) = registry();
        registry.register("general", "color", SettingArgs::new().default(json!("blue")));
        registry.register("reading", "color", SettingArgs::new().default(json!("green")));

        assert_eq!(registry.len(), 1);
        assert!(registry.group("general").is_empty());
        assert_eq!(registry.group("reading"), vec!["color"]);
        assert_eq!(hooks.default_option("color", json!(false), false), json!("green"));
    }

    #[test]
    fn test_rest_settings() {
        let (_, registry) = registry();
        registry.register("general", "a", SettingArgs::new().show_in_rest(true));
        registry.register("general", "b", SettingArgs::new());
        let rest: Vec<String> = registry.rest_settings().into_iter().map(|s| s.name).collect();
        assert_eq!(rest, vec!["a"]);
        assert_eq!(registry.list().len(), 2);
    }
}
