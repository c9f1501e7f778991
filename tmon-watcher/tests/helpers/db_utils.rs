//! Database test utilities

use anyhow::Result;
use sqlx::SqlitePool;
use tempfile::TempDir;
use tmon_common::db::{init_database, ColumnMap};

/// Temporary database with the full schema
///
/// Returns (TempDir, SqlitePool); keep the TempDir alive for the duration of the test.
pub async fn create_test_db() -> Result<(TempDir, SqlitePool)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test_tmon.db");
    let pool = init_database(&db_path, ColumnMap::builtin()?).await?;
    Ok((temp_dir, pool))
}

pub async fn count_rows(pool: &SqlitePool, table: &str) -> i64 {
    let query = format!("SELECT COUNT(*) FROM {}", table);
    sqlx::query_scalar(&query).fetch_one(pool).await.unwrap()
}

pub async fn job_exists(pool: &SqlitePool, job_id: i64) -> bool {
    sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM job_queue WHERE job_id = ?)")
        .bind(job_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

pub async fn job_claimed_by(pool: &SqlitePool, job_id: i64) -> Option<String> {
    sqlx::query_scalar("SELECT claimed_by FROM job_queue WHERE job_id = ?")
        .bind(job_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

pub async fn logged_image_ids(pool: &SqlitePool) -> Vec<i64> {
    sqlx::query_scalar("SELECT image_id FROM transmission_log ORDER BY id")
        .fetch_all(pool)
        .await
        .unwrap()
}

pub async fn catalogue_size(pool: &SqlitePool, ref_image_id: i64) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM reference_catalogue WHERE ref_image_id = ?")
        .bind(ref_image_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

pub async fn register_reference(pool: &SqlitePool, ref_image_id: i64, filename: &str) {
    sqlx::query("INSERT INTO reference_image_lookup (ref_image_id, filename) VALUES (?, ?)")
        .bind(ref_image_id)
        .bind(filename)
        .execute(pool)
        .await
        .unwrap();
}
