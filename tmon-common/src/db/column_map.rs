//! Declarative column map
//!
//! Describes every table the monitor uses. The built-in map is compiled in from
//! `schema/columns.toml`; deployments can point `schema_path` at their own copy.

use crate::db::schema_sync::ColumnDefinition;
use crate::{Error, Result};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::path::Path;

const BUILTIN_COLUMNS: &str = include_str!("../../schema/columns.toml");

static BUILTIN: OnceCell<ColumnMap> = OnceCell::new();

/// One table of the column map
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
    /// Table-level UNIQUE constraints
    #[serde(default)]
    pub unique: Vec<Vec<String>>,
}

impl TableDefinition {
    /// CREATE TABLE IF NOT EXISTS statement for this table
    pub fn create_sql(&self) -> String {
        let mut clauses: Vec<String> = self.columns.iter().map(|c| c.create_clause()).collect();
        for group in &self.unique {
            clauses.push(format!("UNIQUE({})", group.join(", ")));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.name,
            clauses.join(", ")
        )
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Columns a record must supply on insert
    pub fn insertable_columns(&self) -> impl Iterator<Item = &ColumnDefinition> {
        self.columns.iter().filter(|c| !c.generated)
    }
}

/// All tables, in creation order
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ColumnMap {
    pub tables: Vec<TableDefinition>,
}

impl ColumnMap {
    /// The compiled-in map
    pub fn builtin() -> Result<&'static ColumnMap> {
        BUILTIN.get_or_try_init(|| Self::parse(BUILTIN_COLUMNS))
    }

    /// Load a map from a TOML file
    pub fn load(path: &Path) -> Result<ColumnMap> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Schema(format!("Failed to read column map {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Use `path` if given, otherwise the compiled-in map
    pub fn resolve(path: Option<&Path>) -> Result<ColumnMap> {
        match path {
            Some(path) => Self::load(path),
            None => Self::builtin().cloned(),
        }
    }

    pub fn parse(content: &str) -> Result<ColumnMap> {
        let map: ColumnMap = toml::from_str(content)
            .map_err(|e| Error::Schema(format!("Invalid column map: {}", e)))?;
        map.validate()?;
        Ok(map)
    }

    pub fn table(&self, name: &str) -> Result<&TableDefinition> {
        self.tables
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| Error::Schema(format!("Column map has no table '{}'", name)))
    }

    fn validate(&self) -> Result<()> {
        for table in &self.tables {
            if table.columns.is_empty() {
                return Err(Error::Schema(format!("Table '{}' has no columns", table.name)));
            }
            for group in &table.unique {
                if let Some(missing) = group.iter().find(|c| table.column(c).is_none()) {
                    return Err(Error::Schema(format!(
                        "UNIQUE constraint on '{}' names unknown column '{}'",
                        table.name, missing
                    )));
                }
            }
        }
        Ok(())
    }
}
