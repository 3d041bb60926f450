//! Validation and sanitization pipeline
//!
//! Every write runs two stages before the value reaches the durable store:
//!
//! 1. Validate hooks collect errors into a [`ValidationErrors`]. If any error is
//!    raised the candidate is dropped and the currently stored value is kept.
//!    The errors go to the out-of-band [`SettingsErrors`] sink; the write itself
//!    carries on.
//! 2. Sanitize hooks transform whichever value survived, and see the original
//!    candidate for context. Their result is final.
//!
//! The stage sequencing lives in [`crate::OptionStore::sanitize_option`] because
//! reverting needs a read of the stored value.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use crate::{HookId, Hooks};

/// A single validation failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettingError {
    /// Option name the error belongs to
    pub setting: String,
    /// Machine-readable code, e.g. `invalid_admin_email`
    pub code: String,
    pub message: String,
}

/// Errors raised by validate hooks for one write
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    errors: Vec<(String, String)>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, code: impl Into<String>, message: impl Into<String>) {
        self.errors.push((code.into(), message.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.errors.iter().map(|(code, _)| code.as_str())
    }

    fn into_setting_errors(self, setting: &str) -> impl Iterator<Item = SettingError> + '_ {
        self.errors
            .into_iter()
            .map(move |(code, message)| SettingError {
                setting: setting.to_owned(),
                code,
                message,
            })
    }
}

/// Out-of-band collector for validation failures
///
/// Cheap to clone; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct SettingsErrors {
    inner: Arc<Mutex<Vec<SettingError>>>,
}

impl SettingsErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, setting: &str, errors: ValidationErrors) {
        let mut inner = self.inner.lock();
        for error in errors.into_setting_errors(setting) {
            warn!(
                "Validation failed for option '{}' ({}): {}",
                error.setting, error.code, error.message
            );
            inner.push(error);
        }
    }

    /// Errors recorded so far, optionally for one setting only
    pub fn get(&self, setting: Option<&str>) -> Vec<SettingError> {
        self.inner
            .lock()
            .iter()
            .filter(|e| setting.is_none_or(|s| e.setting == s))
            .cloned()
            .collect()
    }

    /// Take every recorded error, leaving the collector empty
    pub fn drain(&self) -> Vec<SettingError> {
        std::mem::take(&mut *self.inner.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

// ============ Built-in rules ============

const ABSINT_OPTIONS: &[&str] = &[
    "posts_per_page",
    "posts_per_rss",
    "default_category",
    "comments_per_page",
    "close_comments_days_old",
    "thread_comments_depth",
    "thumbnail_size_w",
    "thumbnail_size_h",
    "medium_size_w",
    "medium_size_h",
    "large_size_w",
    "large_size_h",
];

const EMAIL_OPTIONS: &[&str] = &["admin_email", "new_admin_email"];

const URL_OPTIONS: &[&str] = &["siteurl", "home"];

const TEXT_OPTIONS: &[&str] = &["blogname", "blogdescription"];

/// Non-negative integer from a loosely typed value. Strings contribute their
/// leading digits; anything unparseable becomes 0.
pub fn absint(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(|i| i.unsigned_abs())
            .or_else(|| n.as_u64())
            .or_else(|| n.as_f64().map(|f| f.abs().trunc() as u64))
            .unwrap_or(0),
        Value::String(s) => {
            let s = s.trim().trim_start_matches(['-', '+']);
            let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().unwrap_or(0)
        }
        Value::Bool(true) => 1,
        _ => 0,
    }
}

/// Loose syntactic e-mail check: `local@domain.tld` with no whitespace.
pub fn is_email(candidate: &str) -> bool {
    let Some((local, domain)) = candidate.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') || candidate.chars().any(char::is_whitespace) {
        return false;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    labels.len() >= 2 && labels.iter().all(|l| !l.is_empty())
}

fn trimmed(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.trim().to_owned()),
        other => other,
    }
}

/// Install sanitize and validate hooks for a handful of well-known options.
///
/// Returns the installed hook ids so the caller can remove them again.
pub fn core_rules(hooks: &Hooks) -> Vec<HookId> {
    let mut ids = Vec::new();

    for name in ABSINT_OPTIONS {
        ids.push(hooks.on_sanitize(name, |_, value, _| Value::from(absint(&value))));
    }

    for name in EMAIL_OPTIONS {
        ids.push(hooks.on_validate(name, |option, value, errors| {
            let valid = value.as_str().is_some_and(|s| is_email(s.trim()));
            if !valid {
                errors.add(
                    format!("invalid_{option}"),
                    "The email address entered did not appear to be a valid email address.",
                );
            }
        }));
        ids.push(hooks.on_sanitize(name, |_, value, _| trimmed(value)));
    }

    for name in URL_OPTIONS {
        ids.push(hooks.on_validate(name, |option, value, errors| {
            let url = value.as_str().map(str::trim).unwrap_or_default();
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                errors.add(
                    format!("invalid_{option}"),
                    "The URL you entered did not appear to be a valid URL.",
                );
            }
        }));
        ids.push(hooks.on_sanitize(name, |_, value, _| match trimmed(value) {
            Value::String(s) => Value::String(s.trim_end_matches('/').to_owned()),
            other => other,
        }));
    }

    for name in TEXT_OPTIONS {
        ids.push(hooks.on_sanitize(name, |_, value, _| trimmed(value)));
    }

    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_absint() {
        assert_eq!(absint(&json!(10)), 10);
        assert_eq!(absint(&json!(-10)), 10);
        assert_eq!(absint(&json!(" 25 posts")), 25);
        assert_eq!(absint(&json!("-3")), 3);
        assert_eq!(absint(&json!("abc")), 0);
        assert_eq!(absint(&json!(2.9)), 2);
        assert_eq!(absint(&json!(null)), 0);
    }

    #[test]
    fn test_is_email() {
        assert!(is_email("admin@example.com"));
        assert!(!is_email("admin@example"));
        assert!(!is_email("@example.com"));
        assert!(!is_email("admin@@example.com"));
        assert!(!is_email("ad min@example.com"));
        assert!(!is_email("admin@example..com"));
    }

    #[test]
    fn test_core_rules() {
        let hooks = Hooks::new();
        let ids = core_rules(&hooks);
        assert!(!ids.is_empty());

        assert_eq!(
            hooks.sanitize("posts_per_page", json!("-12"), &json!("-12")),
            json!(12)
        );
        assert_eq!(
            hooks.sanitize("siteurl", json!(" https://example.com/ "), &json!(null)),
            json!("https://example.com")
        );

        let mut errors = ValidationErrors::new();
        hooks.validate("admin_email", &json!("not-an-email"), &mut errors);
        assert_eq!(errors.codes().collect::<Vec<_>>(), vec!["invalid_admin_email"]);

        let mut errors = ValidationErrors::new();
        hooks.validate("admin_email", &json!("a@b.org"), &mut errors);
        assert!(errors.is_empty());

        for id in ids {
            assert!(hooks.remove(id));
        }
        assert_eq!(
            hooks.sanitize("posts_per_page", json!("-12"), &json!("-12")),
            json!("-12")
        );
    }

    #[test]
    fn test_settings_errors_sink() {
        let sink = SettingsErrors::new();
        let mut errors = ValidationErrors::new();
        errors.add("bad", "Bad value");
        sink.record("a", errors);

        let mut errors = ValidationErrors::new();
        errors.add("worse", "Worse value");
        sink.record("b", errors);

        assert_eq!(sink.get(Some("a")).len(), 1);
        assert_eq!(sink.get(None).len(), 2);
        let drained = sink.drain();
        assert_eq!(drained[1].code, "worse");
        assert!(sink.is_empty());
    }
}
