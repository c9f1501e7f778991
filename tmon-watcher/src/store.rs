//! Catalogue and transmission-log persistence
//!
//! All functions take a connection so callers decide the transaction scope.

use sqlx::{Row, SqliteConnection};
use tmon_common::db::RecordLayout;
use tracing::debug;

use crate::catalogue::CatalogueEntry;
use crate::error::{Result, WatcherError};
use crate::photometry::{PhotometrySample, TransmissionLogEntry};

pub async fn reference_catalogue_exists(conn: &mut SqliteConnection, ref_image_id: i64) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM reference_catalogue WHERE ref_image_id = ?)",
    )
    .bind(ref_image_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(exists)
}

/// Load the catalogue in insertion order
///
/// The aperture radius is shared by every row of a catalogue; the first row's value is used.
pub async fn load_reference_catalogue(
    conn: &mut SqliteConnection,
    ref_image_id: i64,
) -> Result<PhotometrySample> {
    let rows = sqlx::query(
        r#"
        SELECT x_coordinate, y_coordinate, aperture_radius, flux_adu
        FROM reference_catalogue
        WHERE ref_image_id = ?
        ORDER BY id
        "#,
    )
    .bind(ref_image_id)
    .fetch_all(&mut *conn)
    .await?;

    let Some(first) = rows.first() else {
        return Err(WatcherError::EmptyCatalogue(ref_image_id));
    };
    let aperture_radius: f64 = first.try_get("aperture_radius")?;

    let mut sample = PhotometrySample {
        x: Vec::with_capacity(rows.len()),
        y: Vec::with_capacity(rows.len()),
        aperture_radius,
        flux: Vec::with_capacity(rows.len()),
    };
    for row in &rows {
        sample.x.push(row.try_get("x_coordinate")?);
        sample.y.push(row.try_get("y_coordinate")?);
        sample.flux.push(row.try_get("flux_adu")?);
    }

    debug!(ref_image_id, sources = sample.len(), "Loaded reference catalogue");
    Ok(sample)
}

pub async fn insert_catalogue(
    conn: &mut SqliteConnection,
    layout: &RecordLayout<CatalogueEntry>,
    entries: &[CatalogueEntry],
) -> Result<()> {
    for entry in entries {
        layout.insert(conn, entry).await?;
    }
    debug!(rows = entries.len(), "Inserted catalogue rows");
    Ok(())
}

pub async fn insert_transmission(
    conn: &mut SqliteConnection,
    layout: &RecordLayout<TransmissionLogEntry>,
    entry: &TransmissionLogEntry,
) -> Result<()> {
    layout.insert(conn, entry).await?;
    debug!(image_id = entry.image_id, "Inserted transmission log entry");
    Ok(())
}

/// Path of the reference frame for `ref_image_id`
pub async fn reference_image_path(conn: &mut SqliteConnection, ref_image_id: i64) -> Result<String> {
    let filename: Option<String> =
        sqlx::query_scalar("SELECT filename FROM reference_image_lookup WHERE ref_image_id = ?")
            .bind(ref_image_id)
            .fetch_optional(&mut *conn)
            .await?;

    filename.ok_or(WatcherError::CatalogueLookupMissing(ref_image_id))
}

/// Register the file of a reference frame
pub async fn register_reference_image(
    conn: &mut SqliteConnection,
    ref_image_id: i64,
    filename: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO reference_image_lookup (ref_image_id, filename) VALUES (?, ?)
        ON CONFLICT(ref_image_id) DO UPDATE SET filename = excluded.filename
        "#,
    )
    .bind(ref_image_id)
    .bind(filename)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
