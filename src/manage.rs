//! Management surface
//!
//! Operator-facing wrappers over [`OptionStore`]. They call the store's
//! operations and nothing else, turning its terse outcomes into errors with a
//! readable message.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codec::{self, decode};
use crate::{Autoload, OptionError, OptionRow, OptionStore, ScanFilter, WriteOutcome};

/// Failures reported to an operator
#[derive(Debug, thiserror::Error)]
pub enum ManageError {
    #[error("Could not get '{0}' option. Does it exist?")]
    NotFound(String),

    #[error("Could not add option '{0}'. Does it already exist?")]
    AddFailed(String),

    #[error("Could not update option '{0}'.")]
    UpdateFailed(String),

    #[error("Could not delete '{0}' option. Does it exist?")]
    DeleteFailed(String),

    #[error("No data exists for key \"{0}\"")]
    MissingKey(String),

    #[error("Cannot create key \"{key}\" on data type {kind}")]
    NotAContainer { key: String, kind: &'static str },

    #[error("Please provide at least one key")]
    EmptyPath,

    #[error(transparent)]
    Option(#[from] OptionError),
}

/// Treatment of transient records in listings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransientFilter {
    #[default]
    Include,
    Only,
    Exclude,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListField {
    #[serde(rename = "option_id")]
    Id,
    #[serde(rename = "option_name")]
    Name,
    #[serde(rename = "option_value")]
    Value,
    #[serde(rename = "autoload")]
    Autoload,
    #[serde(rename = "size_bytes")]
    Size,
}

impl ListField {
    pub fn as_str(self) -> &'static str {
        match self {
            ListField::Id => "option_id",
            ListField::Name => "option_name",
            ListField::Value => "option_value",
            ListField::Autoload => "autoload",
            ListField::Size => "size_bytes",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderBy {
    #[default]
    Id,
    Name,
    Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Shape of a listing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListFormat {
    #[default]
    Rows,
    Count,
    TotalBytes,
}

/// Filters, projection and ordering for [`Manage::list`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListQuery {
    /// `*`/`?` name pattern to keep
    pub include: Option<String>,
    /// `*`/`?` name pattern to drop
    pub exclude: Option<String>,
    pub autoload: Option<Autoload>,
    pub transients: TransientFilter,
    pub fields: Vec<ListField>,
    pub orderby: OrderBy,
    pub order: SortOrder,
    pub format: ListFormat,
    /// Emit decoded values instead of stored payloads
    pub decode: bool,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            include: None,
            exclude: None,
            autoload: None,
            transients: TransientFilter::Include,
            fields: vec![ListField::Name, ListField::Value],
            orderby: OrderBy::Id,
            order: SortOrder::Asc,
            format: ListFormat::Rows,
            decode: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Listing {
    Rows(Vec<Map<String, Value>>),
    Count(usize),
    TotalBytes(usize),
}

/// Edit applied by [`Manage::patch`] at the end of a key path
#[derive(Debug, Clone, PartialEq)]
pub enum PatchAction {
    /// Create the key, or insert into an array at the index
    Insert(Value),
    /// Replace an existing key
    Update(Value),
    Delete,
}

/// Operator commands bound to one store
pub struct Manage<'a> {
    store: &'a OptionStore,
}

impl<'a> Manage<'a> {
    pub fn new(store: &'a OptionStore) -> Self {
        Self { store }
    }

    pub async fn get(&self, name: &str) -> Result<Value, ManageError> {
        let value = self.store.get(name).await?;
        if codec::is_false(&value) {
            return Err(ManageError::NotFound(name.to_owned()));
        }
        Ok(value)
    }

    pub async fn add(&self, name: &str, value: Value, autoload: Autoload) -> Result<(), ManageError> {
        if self.store.add(name, value, autoload).await? {
            Ok(())
        } else {
            Err(ManageError::AddFailed(name.to_owned()))
        }
    }

    /// Update an option, creating it when absent. `Ok(Unchanged)` reports an
    /// identical value.
    pub async fn update(
        &self,
        name: &str,
        value: Value,
        autoload: Option<Autoload>,
    ) -> Result<WriteOutcome, ManageError> {
        match self.store.update_outcome(name, value, autoload).await? {
            outcome @ (WriteOutcome::Created | WriteOutcome::Updated | WriteOutcome::Unchanged) => {
                Ok(outcome)
            }
            _ => Err(ManageError::UpdateFailed(name.to_owned())),
        }
    }

    pub async fn delete(&self, name: &str) -> Result<(), ManageError> {
        if self.store.delete(name).await? {
            Ok(())
        } else {
            Err(ManageError::DeleteFailed(name.to_owned()))
        }
    }

    pub async fn list(&self, query: &ListQuery) -> Result<Listing, ManageError> {
        let filter = ScanFilter {
            include: query.include.clone(),
            exclude: query.exclude.clone(),
            autoload: query.autoload,
        };
        let prefix = &self.store.config().transient_prefix;
        let mut rows: Vec<OptionRow> = self
            .store
            .table()
            .scan(&filter)
            .await
            .map_err(OptionError::Backend)?
            .into_iter()
            .filter(|row| {
                let transient = row.name.starts_with(prefix.as_str());
                match query.transients {
                    TransientFilter::Include => true,
                    TransientFilter::Only => transient,
                    TransientFilter::Exclude => !transient,
                }
            })
            .collect();

        match query.format {
            ListFormat::Count => return Ok(Listing::Count(rows.len())),
            ListFormat::TotalBytes => {
                return Ok(Listing::TotalBytes(rows.iter().map(OptionRow::size).sum()));
            }
            ListFormat::Rows => {}
        }

        rows.sort_by(|a, b| {
            let ordering = match query.orderby {
                OrderBy::Id => a.id.cmp(&b.id),
                OrderBy::Name => a.name.cmp(&b.name),
                OrderBy::Value => a.value.cmp(&b.value),
            };
            match query.order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let rows = rows
            .iter()
            .map(|row| project(row, &query.fields, query.decode))
            .collect();
        Ok(Listing::Rows(rows))
    }

    /// Value at `path` inside a structured option
    pub async fn pluck(&self, name: &str, path: &[&str]) -> Result<Value, ManageError> {
        let mut current = self.get(name).await?;
        for key in path {
            current = match current {
                Value::Object(mut map) => map.remove(*key),
                Value::Array(mut items) => index(key)
                    .filter(|&i| i < items.len())
                    .map(|i| items.swap_remove(i)),
                _ => None,
            }
            .ok_or_else(|| ManageError::MissingKey((*key).to_owned()))?;
        }
        Ok(current)
    }

    /// Apply `action` at `path` inside a structured option and store the
    /// result. `Ok(Unchanged)` when the edit leaves the value as it was.
    pub async fn patch(
        &self,
        name: &str,
        path: &[&str],
        action: PatchAction,
    ) -> Result<WriteOutcome, ManageError> {
        let Some((last, parents)) = path.split_last() else {
            return Err(ManageError::EmptyPath);
        };
        let old = self.get(name).await?;
        let mut patched = old.clone();

        let mut target = &mut patched;
        for key in parents {
            target = child(target, key).ok_or_else(|| ManageError::MissingKey((*key).to_owned()))?;
        }
        apply(target, last, action)?;

        if patched == old {
            return Ok(WriteOutcome::Unchanged);
        }
        self.update(name, patched, None).await
    }
}

fn index(key: &str) -> Option<usize> {
    key.parse().ok()
}

fn child<'v>(value: &'v mut Value, key: &str) -> Option<&'v mut Value> {
    match value {
        Value::Object(map) => map.get_mut(key),
        Value::Array(items) => index(key).and_then(|i| items.get_mut(i)),
        _ => None,
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn apply(target: &mut Value, key: &str, action: PatchAction) -> Result<(), ManageError> {
    let missing = || ManageError::MissingKey(key.to_owned());
    match (target, action) {
        (Value::Object(map), PatchAction::Insert(value)) => {
            map.insert(key.to_owned(), value);
        }
        (Value::Object(map), PatchAction::Update(value)) => {
            *map.get_mut(key).ok_or_else(missing)? = value;
        }
        (Value::Object(map), PatchAction::Delete) => {
            map.remove(key).ok_or_else(missing)?;
        }
        (Value::Array(items), PatchAction::Insert(value)) => {
            let i = index(key).filter(|&i| i <= items.len()).ok_or_else(missing)?;
            items.insert(i, value);
        }
        (Value::Array(items), PatchAction::Update(value)) => {
            let slot = index(key).and_then(|i| items.get_mut(i)).ok_or_else(missing)?;
            *slot = value;
        }
        (Value::Array(items), PatchAction::Delete) => {
            let i = index(key).filter(|&i| i < items.len()).ok_or_else(missing)?;
            items.remove(i);
        }
        (other, _) => {
            return Err(ManageError::NotAContainer {
                key: key.to_owned(),
                kind: kind(other),
            });
        }
    }
    Ok(())
}

fn project(row: &OptionRow, fields: &[ListField], decoded: bool) -> Map<String, Value> {
    fields
        .iter()
        .map(|field| {
            let value = match field {
                ListField::Id => Value::from(row.id),
                ListField::Name => Value::from(row.name.as_str()),
                ListField::Value if decoded => decode(&row.value),
                ListField::Value => Value::from(row.value.as_str()),
                ListField::Autoload => Value::from(row.autoload.as_str()),
                ListField::Size => Value::from(row.size()),
            };
            (field.as_str().to_owned(), value)
        })
        .collect()
}
