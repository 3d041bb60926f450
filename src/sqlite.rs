//! SQLite option table
//!
//! One `options` table keyed by a unique `option_name`. Name patterns are
//! passed to SQLite `GLOB`, which shares the `*`/`?` wildcard syntax and is
//! case-sensitive like [`crate::wildcard_match`].

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};

use crate::{Autoload, BackendError, OptionRow, OptionTable, ScanFilter, TableUpdate};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS options (
    option_id INTEGER PRIMARY KEY AUTOINCREMENT,
    option_name TEXT NOT NULL UNIQUE,
    option_value TEXT NOT NULL,
    autoload TEXT NOT NULL DEFAULT 'yes'
);
CREATE INDEX IF NOT EXISTS idx_options_autoload ON options (autoload);
"#;

/// [`OptionTable`] over a SQLite pool
#[derive(Debug, Clone)]
pub struct SqliteTable {
    pool: SqlitePool,
}

impl SqliteTable {
    /// Wrap `pool`, creating the `options` table when missing.
    pub async fn new(pool: SqlitePool) -> Result<Self, BackendError> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_from_sql(row: &SqliteRow) -> Result<OptionRow, sqlx::Error> {
    let autoload: String = row.try_get("autoload")?;
    Ok(OptionRow {
        id: row.try_get("option_id")?,
        name: row.try_get("option_name")?,
        value: row.try_get("option_value")?,
        autoload: Autoload::parse(&autoload),
    })
}

/// `[` is the only GLOB metacharacter `wildcard_match` treats literally.
fn glob_pattern(pattern: &str) -> String {
    pattern.replace('[', "[[]")
}

#[async_trait]
impl OptionTable for SqliteTable {
    async fn get_row(&self, name: &str) -> Result<Option<OptionRow>, BackendError> {
        let row = sqlx::query(
            "SELECT option_id, option_name, option_value, autoload FROM options WHERE option_name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_from_sql).transpose()?)
    }

    async fn upsert(
        &self,
        name: &str,
        value: &str,
        autoload: Autoload,
    ) -> Result<(), BackendError> {
        sqlx::query(
            "INSERT INTO options (option_name, option_value, autoload) VALUES (?, ?, ?)
             ON CONFLICT(option_name) DO UPDATE SET
                option_value = excluded.option_value,
                autoload = excluded.autoload",
        )
        .bind(name)
        .bind(value)
        .bind(autoload.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, name: &str, update: TableUpdate) -> Result<bool, BackendError> {
        let result = sqlx::query(
            "UPDATE options SET
                option_value = COALESCE(?, option_value),
                autoload = COALESCE(?, autoload)
             WHERE option_name = ?",
        )
        .bind(update.value)
        .bind(update.autoload.map(Autoload::as_str))
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, name: &str) -> Result<bool, BackendError> {
        let result = sqlx::query("DELETE FROM options WHERE option_name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn scan(&self, filter: &ScanFilter) -> Result<Vec<OptionRow>, BackendError> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT option_id, option_name, option_value, autoload FROM options WHERE 1 = 1",
        );
        if let Some(include) = &filter.include {
            query.push(" AND option_name GLOB ").push_bind(glob_pattern(include));
        }
        if let Some(exclude) = &filter.exclude {
            query
                .push(" AND option_name NOT GLOB ")
                .push_bind(glob_pattern(exclude));
        }
        if let Some(autoload) = filter.autoload {
            query.push(" AND autoload = ").push_bind(autoload.as_str());
        }
        query.push(" ORDER BY option_id");

        let rows = query.build().fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(row_from_sql)
            .collect::<Result<Vec<_>, _>>()?)
    }
}
