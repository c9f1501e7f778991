//! Catalogue building outside the queue

mod helpers;

use helpers::db_utils::*;
use helpers::fakes::*;
use tmon_common::db::ColumnMap;
use tmon_watcher::catalogue::ArtifactPaths;
use tmon_watcher::detector::DetectedSource;
use tmon_watcher::region::REGION_HEADER;
use tmon_watcher::{Orchestrator, WatcherConfig};

const REF_IMAGE_ID: i64 = 80_520;

fn detections() -> Vec<DetectedSource> {
    vec![
        DetectedSource::new(600.0, 700.0, 10_000.0),
        DetectedSource::new(800.0, 900.0, 20_000.0),
        // crowded pair
        DetectedSource::new(700.0, 1200.0, 12_000.0),
        DetectedSource::new(703.0, 1200.0, 12_000.0),
        // inside the edge margin
        DetectedSource::new(100.0, 100.0, 12_000.0),
        // too faint
        DetectedSource::new(1000.0, 1000.0, 500.0),
    ]
}

#[tokio::test]
async fn test_build_catalogue_file_stores_and_registers() {
    let (dir, pool) = create_test_db().await.unwrap();
    let reader = MemoryFrameReader::default();
    let detector = FakeDetector::returning(detections());

    let reference = dir.path().join("REF.fits");
    touch(&reference);
    reader.insert(&reference, frame(REF_IMAGE_ID, Some(REF_IMAGE_ID), star_field((2048, 2088), &[])));
    let region = dir.path().join("refcat.reg");

    let orchestrator = Orchestrator::new(
        pool.clone(),
        WatcherConfig::default(),
        ColumnMap::builtin().unwrap(),
        &detector,
        &reader,
    )
    .unwrap();
    let entries = orchestrator
        .build_catalogue_file(
            &reference,
            ArtifactPaths {
                region: Some(&region),
                fits: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.inc_prescan));
    assert!(entries.iter().all(|e| e.aperture_radius == 3.0));
    assert_eq!(catalogue_size(&pool, REF_IMAGE_ID).await, 2);

    let filename: String =
        sqlx::query_scalar("SELECT filename FROM reference_image_lookup WHERE ref_image_id = ?")
            .bind(REF_IMAGE_ID)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(filename, reference.display().to_string());

    let overlay = std::fs::read_to_string(&region).unwrap();
    assert!(overlay.starts_with(REGION_HEADER));
    let circles: Vec<&str> = overlay.lines().filter(|l| l.starts_with("circle(")).collect();
    assert_eq!(circles.len(), 2 + detections().len());
    assert!(circles[..2].iter().all(|l| l.ends_with("# color=green")));
    assert!(circles[2..].iter().all(|l| l.ends_with("# color=red")));
}

#[tokio::test]
async fn test_rebuilding_same_catalogue_is_rejected() {
    let (dir, pool) = create_test_db().await.unwrap();
    let reader = MemoryFrameReader::default();
    let detector = FakeDetector::returning(detections());

    let reference = dir.path().join("REF.fits");
    touch(&reference);
    reader.insert(&reference, frame(REF_IMAGE_ID, None, star_field((64, 64), &[])));

    let orchestrator = Orchestrator::new(
        pool.clone(),
        WatcherConfig::default(),
        ColumnMap::builtin().unwrap(),
        &detector,
        &reader,
    )
    .unwrap();
    orchestrator
        .build_catalogue_file(&reference, ArtifactPaths::default())
        .await
        .unwrap();
    let second = orchestrator
        .build_catalogue_file(&reference, ArtifactPaths::default())
        .await;

    assert!(second.is_err(), "duplicate catalogue rows must violate uniqueness");
    assert_eq!(catalogue_size(&pool, REF_IMAGE_ID).await, 2);
}

#[tokio::test]
async fn test_small_frame_has_no_prescan() {
    let (dir, pool) = create_test_db().await.unwrap();
    let reader = MemoryFrameReader::default();
    let detector = FakeDetector::returning(detections());

    let reference = dir.path().join("REF.fits");
    touch(&reference);
    reader.insert(&reference, frame(REF_IMAGE_ID, None, star_field((2048, 2048), &[])));

    let orchestrator = Orchestrator::new(
        pool,
        WatcherConfig::default(),
        ColumnMap::builtin().unwrap(),
        &detector,
        &reader,
    )
    .unwrap();
    let entries = orchestrator
        .build_catalogue_file(&reference, ArtifactPaths::default())
        .await
        .unwrap();

    assert!(entries.iter().all(|e| !e.inc_prescan));
}
