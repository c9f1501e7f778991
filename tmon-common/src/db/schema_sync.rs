//! Column map to database synchronisation
//!
//! Startup runs in two steps: every table in the map is created if absent, then each
//! existing table is compared with its definition. Columns the database lacks are appended
//! with `ALTER TABLE`; type or constraint differences are only logged, since SQLite cannot
//! change them in place.

use crate::db::column_map::TableDefinition;
use crate::Result;
use serde::Deserialize;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

/// One column as declared in the column map
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub sql_type: String,
    #[serde(default)]
    pub not_null: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub unique: bool,
    /// SQL expression, inserted verbatim after `DEFAULT`
    #[serde(default, rename = "default")]
    pub default_value: Option<String>,
    /// Target of a `REFERENCES` clause, e.g. `job_queue(job_id) ON DELETE CASCADE`
    #[serde(default)]
    pub references: Option<String>,
    /// Filled by the database (rowid alias); never supplied by records
    #[serde(default)]
    pub generated: bool,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
            not_null: false,
            primary_key: false,
            unique: false,
            default_value: None,
            references: None,
            generated: false,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn default(mut self, value: impl Into<String>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn generated(mut self) -> Self {
        self.generated = true;
        self
    }

    /// Column clause for CREATE TABLE
    pub fn create_clause(&self) -> String {
        let mut clause = format!("{} {}", self.name, self.sql_type);
        if self.primary_key {
            clause.push_str(" PRIMARY KEY");
        }
        if self.not_null {
            clause.push_str(" NOT NULL");
        }
        if self.unique {
            clause.push_str(" UNIQUE");
        }
        if let Some(default) = &self.default_value {
            clause.push_str(&format!(" DEFAULT {}", default));
        }
        if let Some(references) = &self.references {
            clause.push_str(&format!(" REFERENCES {}", references));
        }
        clause
    }

    /// Statement appending this column to an existing table
    ///
    /// SQLite cannot add key or unique columns, nor NOT NULL without a default; those
    /// constraints are dropped with a warning.
    pub fn add_column_sql(&self, table: &str) -> String {
        let mut sql = format!("ALTER TABLE {} ADD COLUMN {} {}", table, self.name, self.sql_type);

        if self.primary_key || self.unique {
            warn!(table, column = %self.name, "Key constraints cannot be added to an existing table");
        }

        match (&self.default_value, self.not_null) {
            (Some(default), true) => sql.push_str(&format!(" NOT NULL DEFAULT {}", default)),
            (Some(default), false) => sql.push_str(&format!(" DEFAULT {}", default)),
            (None, true) => {
                warn!(table, column = %self.name, "NOT NULL column without default added as nullable")
            }
            (None, false) => {}
        }
        sql
    }
}

/// A column as reported by `PRAGMA table_info`
#[derive(Debug, Clone)]
pub struct LiveColumn {
    pub cid: i32,
    pub name: String,
    pub type_name: String,
    pub not_null: bool,
    pub default_value: Option<String>,
    pub pk: bool,
}

/// How a live table differs from its definition
#[derive(Debug, Clone)]
pub enum ColumnDrift {
    /// Not in the database yet; repaired by appending it
    Missing(ColumnDefinition),
    Retyped {
        column: String,
        wanted: String,
        found: String,
    },
    LostConstraint {
        column: String,
        constraint: &'static str,
    },
}

/// SQLite type affinity of a declared column type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Affinity {
    Integer,
    Text,
    Blob,
    Real,
    Numeric,
}

impl Affinity {
    /// Affinity rules of the SQLite type system, applied in their documented order
    fn of(declared: &str) -> Self {
        let t = declared.to_uppercase();
        if t.contains("INT") {
            Affinity::Integer
        } else if t.contains("CHAR") || t.contains("CLOB") || t.contains("TEXT") {
            Affinity::Text
        } else if t.is_empty() || t.contains("BLOB") {
            Affinity::Blob
        } else if t.contains("REAL") || t.contains("FLOA") || t.contains("DOUB") {
            Affinity::Real
        } else {
            Affinity::Numeric
        }
    }
}

pub fn same_affinity(a: &str, b: &str) -> bool {
    Affinity::of(a) == Affinity::of(b)
}

/// Differences between `expected` and the live columns, in definition order
pub fn detect_drift(expected: &[ColumnDefinition], live: &[LiveColumn]) -> Vec<ColumnDrift> {
    let mut drift = Vec::new();

    for column in expected {
        let Some(found) = live.iter().find(|c| c.name == column.name) else {
            drift.push(ColumnDrift::Missing(column.clone()));
            continue;
        };

        if !same_affinity(&column.sql_type, &found.type_name) {
            drift.push(ColumnDrift::Retyped {
                column: column.name.clone(),
                wanted: column.sql_type.clone(),
                found: found.type_name.clone(),
            });
        }
        // INTEGER PRIMARY KEY is reported nullable
        if column.not_null && !column.primary_key && !found.not_null {
            drift.push(ColumnDrift::LostConstraint {
                column: column.name.clone(),
                constraint: "NOT NULL",
            });
        }
        if column.primary_key && !found.pk {
            drift.push(ColumnDrift::LostConstraint {
                column: column.name.clone(),
                constraint: "PRIMARY KEY",
            });
        }
    }

    drift
}

/// Reads table structure from the database catalogue
pub struct SchemaIntrospector;

impl SchemaIntrospector {
    /// Columns of `table_name` in declaration order; empty if the table does not exist
    pub async fn live_columns(pool: &SqlitePool, table_name: &str) -> Result<Vec<LiveColumn>> {
        let rows = sqlx::query(&format!("PRAGMA table_info({})", table_name))
            .fetch_all(pool)
            .await?;

        let mut columns = rows
            .iter()
            .map(|row| -> Result<LiveColumn> {
                Ok(LiveColumn {
                    cid: row.try_get("cid")?,
                    name: row.try_get("name")?,
                    type_name: row.try_get("type")?,
                    not_null: row.try_get::<i32, _>("notnull")? != 0,
                    default_value: row.try_get("dflt_value")?,
                    pk: row.try_get::<i32, _>("pk")? != 0,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        columns.sort_by_key(|c| c.cid);
        Ok(columns)
    }

    pub async fn table_exists(pool: &SqlitePool, table_name: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
        )
        .bind(table_name)
        .fetch_one(pool)
        .await?;
        Ok(exists)
    }
}

/// Applies table definitions to the database
pub struct SchemaSync;

impl SchemaSync {
    pub async fn create_table(pool: &SqlitePool, table: &TableDefinition) -> Result<()> {
        let sql = table.create_sql();
        debug!(table = %table.name, "{}", sql);
        sqlx::query(&sql).execute(pool).await?;
        Ok(())
    }

    /// Append missing columns and log what cannot be repaired
    pub async fn sync_table(pool: &SqlitePool, table: &TableDefinition) -> Result<()> {
        let name = table.name.as_str();
        if !SchemaIntrospector::table_exists(pool, name).await? {
            warn!(table = name, "Table missing during sync; it is created before syncing");
            return Ok(());
        }

        let live = SchemaIntrospector::live_columns(pool, name).await?;
        let drift = detect_drift(&table.columns, &live);
        if drift.is_empty() {
            debug!(table = name, "Schema up to date");
            return Ok(());
        }

        for change in drift {
            match change {
                ColumnDrift::Missing(column) => Self::add_column(pool, name, &column).await?,
                ColumnDrift::Retyped { column, wanted, found } => warn!(
                    table = name,
                    column = %column,
                    "Column declared {} but stored as {}; migrate by hand",
                    wanted,
                    found
                ),
                ColumnDrift::LostConstraint { column, constraint } => warn!(
                    table = name,
                    column = %column,
                    "Column lacks {}; migrate by hand",
                    constraint
                ),
            }
        }
        Ok(())
    }

    async fn add_column(pool: &SqlitePool, table: &str, column: &ColumnDefinition) -> Result<()> {
        info!(table, column = %column.name, sql_type = %column.sql_type, "Adding column");

        match sqlx::query(&column.add_column_sql(table)).execute(pool).await {
            Ok(_) => Ok(()),
            // Another process won the race
            Err(sqlx::Error::Database(e)) if e.message().contains("duplicate column") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
