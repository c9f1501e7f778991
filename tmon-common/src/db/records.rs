//! Schema-driven record writing
//!
//! Record types name their fields once; the matching INSERT statement is built from the
//! column map when a [`RecordLayout`] is derived, so call sites never spell out columns.

use crate::db::column_map::ColumnMap;
use crate::{Error, Result};
use sqlx::SqliteConnection;
use std::fmt;
use std::marker::PhantomData;

/// A single bindable column value
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Integer(i64),
    Real(f64),
    Text(String),
    Null,
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Integer(i64::from(v))
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// An immutable row type stored in one table of the column map
pub trait TableRecord {
    /// Table the record is written to
    const TABLE: &'static str;
    /// Field names, each matching a non-generated column
    const FIELDS: &'static [&'static str];

    /// Value of a named field, `None` if the record has no such field
    fn field_value(&self, field: &str) -> Option<SqlValue>;
}

/// Validated field order and INSERT statement for one record type
pub struct RecordLayout<R> {
    columns: Vec<String>,
    insert_sql: String,
    _record: PhantomData<fn(&R)>,
}

// Written out so neither impl requires anything of `R`
impl<R> Clone for RecordLayout<R> {
    fn clone(&self) -> Self {
        Self {
            columns: self.columns.clone(),
            insert_sql: self.insert_sql.clone(),
            _record: PhantomData,
        }
    }
}

impl<R> fmt::Debug for RecordLayout<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordLayout")
            .field("columns", &self.columns)
            .field("insert_sql", &self.insert_sql)
            .finish()
    }
}

impl<R: TableRecord> RecordLayout<R> {
    /// Check `R` against the column map and build its INSERT statement
    ///
    /// Fails when a field has no column, names a generated column, or when a required
    /// column (NOT NULL without a default) has no field.
    pub fn derive(map: &ColumnMap) -> Result<Self> {
        let table = map.table(R::TABLE)?;

        for field in R::FIELDS {
            match table.column(field) {
                None => {
                    return Err(Error::Schema(format!(
                        "Field '{}' has no column in table '{}'",
                        field,
                        R::TABLE
                    )))
                }
                Some(column) if column.generated => {
                    return Err(Error::Schema(format!(
                        "Field '{}' maps to generated column {}.{}",
                        field,
                        R::TABLE,
                        field
                    )))
                }
                Some(_) => {}
            }
        }

        // Keep column-map order so the statement reads like the table
        let columns: Vec<String> = table
            .insertable_columns()
            .filter(|c| R::FIELDS.contains(&c.name.as_str()))
            .map(|c| c.name.clone())
            .collect();

        if let Some(required) = table.insertable_columns().find(|c| {
            c.not_null
                && !c.primary_key
                && c.default_value.is_none()
                && !R::FIELDS.contains(&c.name.as_str())
        }) {
            return Err(Error::Schema(format!(
                "Required column {}.{} has no record field",
                R::TABLE,
                required.name
            )));
        }

        let placeholders = vec!["?"; columns.len()].join(", ");
        let insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            R::TABLE,
            columns.join(", "),
            placeholders
        );

        Ok(Self {
            columns,
            insert_sql,
            _record: PhantomData,
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn insert_sql(&self) -> &str {
        &self.insert_sql
    }

    /// Insert one record on the given connection (usually inside a transaction)
    pub async fn insert(&self, conn: &mut SqliteConnection, record: &R) -> Result<i64> {
        let mut query = sqlx::query(&self.insert_sql);

        for column in &self.columns {
            let value = record.field_value(column).ok_or_else(|| {
                Error::Schema(format!("Record for {} is missing field '{}'", R::TABLE, column))
            })?;
            query = match value {
                SqlValue::Integer(v) => query.bind(v),
                SqlValue::Real(v) => query.bind(v),
                SqlValue::Text(v) => query.bind(v),
                SqlValue::Null => query.bind(Option::<i64>::None),
            };
        }

        let result = query.execute(&mut *conn).await?;
        Ok(result.last_insert_rowid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init::create_schema;
    use sqlx::sqlite::SqlitePoolOptions;

    struct Lookup {
        ref_image_id: i64,
        filename: String,
    }

    impl TableRecord for Lookup {
        const TABLE: &'static str = "reference_image_lookup";
        const FIELDS: &'static [&'static str] = &["ref_image_id", "filename"];

        fn field_value(&self, field: &str) -> Option<SqlValue> {
            match field {
                "ref_image_id" => Some(self.ref_image_id.into()),
                "filename" => Some(self.filename.clone().into()),
                _ => None,
            }
        }
    }

    struct Stray;

    impl TableRecord for Stray {
        const TABLE: &'static str = "reference_image_lookup";
        const FIELDS: &'static [&'static str] = &["ref_image_id", "filename", "colour"];

        fn field_value(&self, _field: &str) -> Option<SqlValue> {
            None
        }
    }

    struct Incomplete;

    impl TableRecord for Incomplete {
        const TABLE: &'static str = "reference_image_lookup";
        const FIELDS: &'static [&'static str] = &["ref_image_id"];

        fn field_value(&self, _field: &str) -> Option<SqlValue> {
            Some(SqlValue::Integer(1))
        }
    }

    #[test]
    fn layout_builds_insert_sql() {
        let layout = RecordLayout::<Lookup>::derive(ColumnMap::builtin().unwrap()).unwrap();
        assert_eq!(
            layout.insert_sql(),
            "INSERT INTO reference_image_lookup (ref_image_id, filename) VALUES (?, ?)"
        );
    }

    #[test]
    fn unknown_field_rejected() {
        let err = RecordLayout::<Stray>::derive(ColumnMap::builtin().unwrap()).unwrap_err();
        assert!(err.to_string().contains("colour"));
    }

    #[test]
    fn missing_required_column_rejected() {
        let err = RecordLayout::<Incomplete>::derive(ColumnMap::builtin().unwrap()).unwrap_err();
        assert!(err.to_string().contains("filename"));
    }

    #[test]
    fn layout_is_debug_and_clone_for_any_record() {
        // Lookup implements neither Debug nor Clone
        let layout = RecordLayout::<Lookup>::derive(ColumnMap::builtin().unwrap()).unwrap();
        let copy = layout.clone();
        let rendered = format!("{:?}", copy);
        assert!(rendered.contains("reference_image_lookup"));
        assert!(rendered.contains("filename"));
    }

    #[test]
    fn option_maps_to_null() {
        assert_eq!(SqlValue::from(None::<f64>), SqlValue::Null);
        assert_eq!(SqlValue::from(Some(2.5)), SqlValue::Real(2.5));
        assert_eq!(SqlValue::from(true), SqlValue::Integer(1));
    }

    #[tokio::test]
    async fn insert_writes_row() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let map = ColumnMap::builtin().unwrap();
        create_schema(&pool, map).await.unwrap();

        let layout = RecordLayout::<Lookup>::derive(map).unwrap();
        let mut conn = pool.acquire().await.unwrap();
        layout
            .insert(
                &mut conn,
                &Lookup {
                    ref_image_id: 42,
                    filename: "/data/ref.fits".to_string(),
                },
            )
            .await
            .unwrap();
        drop(conn);

        let filename: String =
            sqlx::query_scalar("SELECT filename FROM reference_image_lookup WHERE ref_image_id = 42")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(filename, "/data/ref.fits");
    }
}
