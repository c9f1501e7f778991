//! Database initialization
//!
//! Opens (or creates) the SQLite database and brings every table in the column map up to
//! date. Safe to call on every startup.

use crate::db::column_map::ColumnMap;
use crate::db::schema_sync::SchemaSync;
use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Busy timeout applied to every connection
pub const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Open the database at `db_path`, creating file and tables if needed
pub async fn init_database(db_path: &Path, columns: &ColumnMap) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // Pragmas set here apply to every pooled connection, not only the first
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema(&pool, columns).await?;

    Ok(pool)
}

/// Create missing tables, then add any columns missing from existing ones
pub async fn create_schema(pool: &SqlitePool, columns: &ColumnMap) -> Result<()> {
    for table in &columns.tables {
        SchemaSync::create_table(pool, table).await?;
    }

    for table in &columns.tables {
        SchemaSync::sync_table(pool, table).await?;
    }

    if columns.table("job_queue").is_ok() && columns.table("job_args").is_ok() {
        create_queue_indexes(pool).await?;
    }

    Ok(())
}

async fn create_queue_indexes(pool: &SqlitePool) -> Result<()> {
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_queue_type ON job_queue(job_type, submitted)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_args_job ON job_args(job_id)")
        .execute(pool)
        .await?;

    Ok(())
}
