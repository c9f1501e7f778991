//! Job queue access with leasing
//!
//! A fetch claims up to `batch_size` unexpired jobs for one watcher instance. A claim is
//! valid until `lease_expires`; an instance that dies leaves its jobs claimable again once
//! the lease lapses.

use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::Result;

/// Argument key carrying the frame path
pub const FILE_ARG: &str = "file";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub job_id: i64,
    /// Frame path from the `file` argument, if the job has one
    pub filename: Option<String>,
}

/// Claim and return this instance's jobs, newest submission first
///
/// Runs in its own short transaction so no lock is held while jobs are processed.
pub async fn lease_jobs(
    pool: &SqlitePool,
    job_type: &str,
    instance_id: &str,
    batch_size: u32,
    lease_secs: u64,
) -> Result<Vec<Job>> {
    let mut tx = pool.begin().await?;
    let lease = format!("+{} seconds", lease_secs);

    let claimed = sqlx::query(
        r#"
        UPDATE job_queue
        SET claimed_by = ?, lease_expires = datetime('now', ?)
        WHERE job_id IN (
            SELECT job_id FROM job_queue
            WHERE job_type = ?
              AND expires > datetime('now')
              AND (claimed_by IS NULL
                   OR claimed_by = ?
                   OR lease_expires IS NULL
                   OR lease_expires <= datetime('now'))
            ORDER BY submitted DESC, job_id DESC
            LIMIT ?
        )
        "#,
    )
    .bind(instance_id)
    .bind(&lease)
    .bind(job_type)
    .bind(instance_id)
    .bind(i64::from(batch_size))
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let rows = sqlx::query(
        r#"
        SELECT q.job_id, MIN(a.arg_value) AS filename
        FROM job_queue q
        LEFT JOIN job_args a ON a.job_id = q.job_id AND a.arg_key = ?
        WHERE q.claimed_by = ? AND q.job_type = ? AND q.expires > datetime('now')
        GROUP BY q.job_id
        ORDER BY q.submitted DESC, q.job_id DESC
        LIMIT ?
        "#,
    )
    .bind(FILE_ARG)
    .bind(instance_id)
    .bind(job_type)
    .bind(i64::from(batch_size))
    .fetch_all(&mut *tx)
    .await?;

    tx.commit().await?;

    let jobs = rows
        .iter()
        .map(|row| -> Result<Job> {
            Ok(Job {
                job_id: row.try_get("job_id")?,
                filename: row.try_get("filename")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    debug!(claimed, fetched = jobs.len(), "Leased jobs");
    Ok(jobs)
}

/// Give a job back so any instance can retry it on the next poll
pub async fn release_lease(pool: &SqlitePool, job_id: i64, instance_id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE job_queue SET claimed_by = NULL, lease_expires = NULL WHERE job_id = ? AND claimed_by = ?",
    )
    .bind(job_id)
    .bind(instance_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Remove a finished job and its arguments
pub async fn delete_job(conn: &mut SqliteConnection, job_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM job_args WHERE job_id = ?")
        .bind(job_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM job_queue WHERE job_id = ?")
        .bind(job_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Queue a job for `filename`, valid for `lifetime_secs`
pub async fn enqueue_job(
    pool: &SqlitePool,
    job_type: &str,
    filename: &str,
    lifetime_secs: u64,
) -> Result<i64> {
    let mut tx = pool.begin().await?;

    let job_id: i64 = sqlx::query_scalar(
        "INSERT INTO job_queue (job_type, expires) VALUES (?, datetime('now', ?)) RETURNING job_id",
    )
    .bind(job_type)
    .bind(format!("+{} seconds", lifetime_secs))
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query("INSERT INTO job_args (job_id, arg_key, arg_value) VALUES (?, ?, ?)")
        .bind(job_id)
        .bind(FILE_ARG)
        .bind(filename)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    debug!(job_id, filename, "Queued job");
    Ok(job_id)
}
