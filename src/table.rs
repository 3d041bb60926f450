//! Durable option table
//!
//! The durable store is the record of truth: a single table of uniquely named
//! rows holding an encoded value and an autoload flag. The store only ever
//! talks to it through [`OptionTable`], so the same engine runs over the
//! in-process [`MemoryTable`] or a real database.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use crate::BackendError;

/// Whether an option is part of the bulk-preloaded set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Autoload {
    Yes,
    No,
}

impl Autoload {
    pub fn as_str(self) -> &'static str {
        match self {
            Autoload::Yes => "yes",
            Autoload::No => "no",
        }
    }

    /// Parse a stored flag. Anything other than `"no"` counts as `yes`, which
    /// is the column default.
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "no" | "off" | "false" => Autoload::No,
            _ => Autoload::Yes,
        }
    }
}

impl From<bool> for Autoload {
    fn from(value: bool) -> Self {
        if value { Autoload::Yes } else { Autoload::No }
    }
}

impl fmt::Display for Autoload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of the durable option table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionRow {
    /// Auto-incrementing identity, used for ordering and display only
    pub id: i64,
    pub name: String,
    /// Encoded payload, see [`crate::codec`]
    pub value: String,
    pub autoload: Autoload,
}

impl OptionRow {
    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.value.len()
    }
}

/// Partial update applied to an existing row
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableUpdate {
    pub value: Option<String>,
    pub autoload: Option<Autoload>,
}

/// Predicate for [`OptionTable::scan`]
///
/// Patterns use `*` for any run of characters and `?` for a single character.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    pub include: Option<String>,
    pub exclude: Option<String>,
    pub autoload: Option<Autoload>,
}

impl ScanFilter {
    pub fn autoloaded() -> Self {
        Self {
            autoload: Some(Autoload::Yes),
            ..Self::default()
        }
    }

    pub fn matching(pattern: impl Into<String>) -> Self {
        Self {
            include: Some(pattern.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, row: &OptionRow) -> bool {
        if let Some(autoload) = self.autoload
            && row.autoload != autoload
        {
            return false;
        }
        if let Some(pattern) = &self.include
            && !wildcard_match(pattern, &row.name)
        {
            return false;
        }
        if let Some(pattern) = &self.exclude
            && wildcard_match(pattern, &row.name)
        {
            return false;
        }
        true
    }
}

/// Match `text` against a pattern where `*` is any run and `?` any single char.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Durable key/value table consumed by the option store.
///
/// Implementations must make `upsert` and `delete` atomic per name; those two
/// primitives are all the store relies on for cross-process correctness.
#[async_trait]
pub trait OptionTable: Send + Sync + 'static {
    /// Fetch a single row by name.
    async fn get_row(&self, name: &str) -> Result<Option<OptionRow>, BackendError>;

    /// Insert a row, or overwrite value and autoload when the name exists.
    async fn upsert(&self, name: &str, value: &str, autoload: Autoload)
    -> Result<(), BackendError>;

    /// Update an existing row. Returns false when no row matched.
    async fn update(&self, name: &str, update: TableUpdate) -> Result<bool, BackendError>;

    /// Delete a row. Returns false when no row matched.
    async fn delete(&self, name: &str) -> Result<bool, BackendError>;

    /// All rows matching `filter`, in insertion order.
    async fn scan(&self, filter: &ScanFilter) -> Result<Vec<OptionRow>, BackendError>;
}

#[derive(Debug, Default)]
struct TableState {
    rows: BTreeMap<String, OptionRow>,
    next_id: i64,
}

/// In-process option table
///
/// Writes can be made to fail on demand, which lets callers exercise the
/// store's durable-failure paths.
#[derive(Debug, Default)]
pub struct MemoryTable {
    state: RwLock<TableState>,
    fail_writes: AtomicBool,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.rows.is_empty()
    }

    fn check_writable(&self) -> Result<(), BackendError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err("option table is read-only".into());
        }
        Ok(())
    }
}

#[async_trait]
impl OptionTable for MemoryTable {
    async fn get_row(&self, name: &str) -> Result<Option<OptionRow>, BackendError> {
        Ok(self.state.read().await.rows.get(name).cloned())
    }

    async fn upsert(
        &self,
        name: &str,
        value: &str,
        autoload: Autoload,
    ) -> Result<(), BackendError> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        if let Some(row) = state.rows.get_mut(name) {
            row.value = value.to_owned();
            row.autoload = autoload;
            return Ok(());
        }
        state.next_id += 1;
        let id = state.next_id;
        state.rows.insert(
            name.to_owned(),
            OptionRow {
                id,
                name: name.to_owned(),
                value: value.to_owned(),
                autoload,
            },
        );
        Ok(())
    }

    async fn update(&self, name: &str, update: TableUpdate) -> Result<bool, BackendError> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        let Some(row) = state.rows.get_mut(name) else {
            return Ok(false);
        };
        if let Some(value) = update.value {
            row.value = value;
        }
        if let Some(autoload) = update.autoload {
            row.autoload = autoload;
        }
        Ok(true)
    }

    async fn delete(&self, name: &str) -> Result<bool, BackendError> {
        self.check_writable()?;
        Ok(self.state.write().await.rows.remove(name).is_some())
    }

    async fn scan(&self, filter: &ScanFilter) -> Result<Vec<OptionRow>, BackendError> {
        let state = self.state.read().await;
        let mut rows: Vec<OptionRow> = state
            .rows
            .values()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.id);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("_transient_*", "_transient_lock"));
        assert!(!wildcard_match("_transient_*", "blogname"));
        assert!(wildcard_match("blog?ame", "blogname"));
        assert!(wildcard_match("*name", "blogname"));
        assert!(wildcard_match("b*g*e", "blogname"));
        assert!(!wildcard_match("b*x", "blogname"));
        assert!(wildcard_match("", ""));
        assert!(!wildcard_match("", "a"));
    }

    #[test]
    fn test_autoload_parse() {
        assert_eq!(Autoload::parse("yes"), Autoload::Yes);
        assert_eq!(Autoload::parse("no"), Autoload::No);
        assert_eq!(Autoload::parse("on"), Autoload::Yes);
        assert_eq!(Autoload::parse("off"), Autoload::No);
        assert_eq!(Autoload::from(false), Autoload::No);
    }

    #[tokio::test]
    async fn test_upsert_keeps_identity() {
        let table = MemoryTable::new();
        table.upsert("a", "1", Autoload::Yes).await.unwrap();
        table.upsert("b", "2", Autoload::No).await.unwrap();
        table.upsert("a", "3", Autoload::No).await.unwrap();

        let a = table.get_row("a").await.unwrap().unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(a.value, "3");
        assert_eq!(a.autoload, Autoload::No);
        assert_eq!(table.len().await, 2);
    }

    #[tokio::test]
    async fn test_update_and_delete_report_matches() {
        let table = MemoryTable::new();
        assert!(
            !table
                .update("missing", TableUpdate::default())
                .await
                .unwrap()
        );
        table.upsert("a", "1", Autoload::Yes).await.unwrap();
        let update = TableUpdate {
            value: None,
            autoload: Some(Autoload::No),
        };
        assert!(table.update("a", update).await.unwrap());
        let row = table.get_row("a").await.unwrap().unwrap();
        assert_eq!(row.value, "1");
        assert_eq!(row.autoload, Autoload::No);

        assert!(table.delete("a").await.unwrap());
        assert!(!table.delete("a").await.unwrap());
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_scan_orders_by_insertion() {
        let table = MemoryTable::new();
        table.upsert("zeta", "1", Autoload::Yes).await.unwrap();
        table.upsert("alpha", "2", Autoload::No).await.unwrap();
        table.upsert("mid", "3", Autoload::Yes).await.unwrap();

        let names: Vec<String> = table
            .scan(&ScanFilter::default())
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);

        let autoloaded = table.scan(&ScanFilter::autoloaded()).await.unwrap();
        assert_eq!(autoloaded.len(), 2);

        let filter = ScanFilter {
            include: Some("*a*".to_owned()),
            exclude: Some("z*".to_owned()),
            autoload: None,
        };
        let rows = table.scan(&filter).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "alpha");
    }

    #[tokio::test]
    async fn test_failing_writes() {
        let table = MemoryTable::new();
        table.fail_writes(true);
        assert!(table.upsert("a", "1", Autoload::Yes).await.is_err());
        table.fail_writes(false);
        assert!(table.upsert("a", "1", Autoload::Yes).await.is_ok());
    }
}
