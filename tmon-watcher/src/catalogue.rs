//! Reference catalogue construction
//!
//! Detect sources on the reference frame, keep the isolated well-exposed ones, write the
//! optional QA artifacts and persist the rows. Nothing is persisted if detection fails.

use fitsio::tables::{ColumnDataType, ColumnDescription};
use fitsio::FitsFile;
use sqlx::SqliteConnection;
use std::path::Path;
use tmon_common::db::{RecordLayout, SqlValue, TableRecord};
use tracing::{debug, info};

use crate::config::{DetectionConfig, FilterConfig};
use crate::detector::{DetectedSource, Detector};
use crate::error::Result;
use crate::frame::{FrameError, LoadedFrame, IMAGE_ID_KEY};
use crate::region::write_region_file;
use crate::source_filter;
use crate::store;

/// Extension name of the archived catalogue table
pub const FITS_TABLE_NAME: &str = "TRANSMISSION_CATALOGUE";

/// One reference star. Identity is (ref_image_id, x, y).
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogueEntry {
    pub ref_image_id: i64,
    pub x_coordinate: f64,
    pub y_coordinate: f64,
    pub aperture_radius: f64,
    pub inc_prescan: bool,
    pub flux_adu: f64,
}

impl TableRecord for CatalogueEntry {
    const TABLE: &'static str = "reference_catalogue";
    const FIELDS: &'static [&'static str] = &[
        "ref_image_id",
        "x_coordinate",
        "y_coordinate",
        "aperture_radius",
        "inc_prescan",
        "flux_adu",
    ];

    fn field_value(&self, field: &str) -> Option<SqlValue> {
        Some(match field {
            "ref_image_id" => self.ref_image_id.into(),
            "x_coordinate" => self.x_coordinate.into(),
            "y_coordinate" => self.y_coordinate.into(),
            "aperture_radius" => self.aperture_radius.into(),
            "inc_prescan" => self.inc_prescan.into(),
            "flux_adu" => self.flux_adu.into(),
            _ => return None,
        })
    }
}

/// Where to put the optional QA artifacts of one build
#[derive(Debug, Clone, Copy, Default)]
pub struct ArtifactPaths<'a> {
    pub region: Option<&'a Path>,
    pub fits: Option<&'a Path>,
}

pub struct CatalogueBuilder<'a, D: ?Sized> {
    detector: &'a D,
    detection: &'a DetectionConfig,
    filter: &'a FilterConfig,
}

impl<'a, D: Detector + ?Sized> CatalogueBuilder<'a, D> {
    pub fn new(detector: &'a D, detection: &'a DetectionConfig, filter: &'a FilterConfig) -> Self {
        Self {
            detector,
            detection,
            filter,
        }
    }

    /// Detect and filter, returning the entries to persist
    ///
    /// The catalogue is keyed by the reference frame's own image id.
    pub fn extract(
        &self,
        reference: &LoadedFrame,
        region: Option<&Path>,
    ) -> Result<Vec<CatalogueEntry>> {
        let ref_image_id = reference.frame.image_id;
        info!(ref_image_id, path = %reference.readable_path().display(), "Extracting catalogue");

        let raw = self
            .detector
            .detect_source(
                reference.readable_path(),
                reference.source_path(),
                &self.detection.params(),
            )?;
        let kept = source_filter::filter(&raw, self.filter, self.detection.isolation_radius);
        info!(ref_image_id, found = raw.len(), kept = kept.len(), "Catalogue sources selected");

        if let Some(path) = region {
            write_region_file(path, self.detection.aperture_radius, &kept, &raw)?;
            debug!(path = %path.display(), "Wrote region file");
        }

        let inc_prescan = reference.frame.has_prescan();
        debug!(inc_prescan, "Image has prescan");

        Ok(kept
            .iter()
            .map(|source| self.entry(ref_image_id, inc_prescan, source))
            .collect())
    }

    fn entry(&self, ref_image_id: i64, inc_prescan: bool, source: &DetectedSource) -> CatalogueEntry {
        CatalogueEntry {
            ref_image_id,
            x_coordinate: source.x,
            y_coordinate: source.y,
            aperture_radius: self.detection.aperture_radius,
            inc_prescan,
            flux_adu: source.flux,
        }
    }

    /// Extract, persist on `conn` and render the optional artifacts
    ///
    /// Run inside the caller's transaction so a failure leaves no rows behind.
    pub async fn build(
        &self,
        conn: &mut SqliteConnection,
        layout: &RecordLayout<CatalogueEntry>,
        reference: &LoadedFrame,
        artifacts: ArtifactPaths<'_>,
    ) -> Result<Vec<CatalogueEntry>> {
        let entries = self.extract(reference, artifacts.region)?;
        store::insert_catalogue(conn, layout, &entries).await?;

        if let Some(path) = artifacts.fits {
            render_fits_catalogue(&entries, reference.frame.image_id, path)?;
        }

        Ok(entries)
    }
}

/// Archive the catalogue as a FITS binary table tagged with the reference image id
pub fn render_fits_catalogue(
    entries: &[CatalogueEntry],
    ref_image_id: i64,
    path: &Path,
) -> std::result::Result<(), FrameError> {
    info!(path = %path.display(), rows = entries.len(), "Rendering catalogue table");

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let fits = FrameError::fits;
    let mut fptr = FitsFile::create(path).overwrite().open().map_err(fits(path))?;
    let primary = fptr.primary_hdu().map_err(fits(path))?;
    primary
        .write_key(&mut fptr, IMAGE_ID_KEY, ref_image_id)
        .map_err(fits(path))?;

    let column = |name: &str, data_type: ColumnDataType| {
        ColumnDescription::new(name)
            .with_type(data_type)
            .create()
            .map_err(fits(path))
    };
    let descriptions = [
        column("ref_image_id", ColumnDataType::Long)?,
        column("x_coordinate", ColumnDataType::Double)?,
        column("y_coordinate", ColumnDataType::Double)?,
        column("aperture_radius", ColumnDataType::Double)?,
        column("inc_prescan", ColumnDataType::Int)?,
        column("flux_adu", ColumnDataType::Double)?,
    ];
    let table = fptr
        .create_table(FITS_TABLE_NAME.to_string(), &descriptions)
        .map_err(fits(path))?;

    let ids: Vec<i64> = entries.iter().map(|e| e.ref_image_id).collect();
    let xs: Vec<f64> = entries.iter().map(|e| e.x_coordinate).collect();
    let ys: Vec<f64> = entries.iter().map(|e| e.y_coordinate).collect();
    let radii: Vec<f64> = entries.iter().map(|e| e.aperture_radius).collect();
    let prescan: Vec<i32> = entries.iter().map(|e| i32::from(e.inc_prescan)).collect();
    let fluxes: Vec<f64> = entries.iter().map(|e| e.flux_adu).collect();

    table.write_col(&mut fptr, "ref_image_id", &ids).map_err(fits(path))?;
    table.write_col(&mut fptr, "x_coordinate", &xs).map_err(fits(path))?;
    table.write_col(&mut fptr, "y_coordinate", &ys).map_err(fits(path))?;
    table.write_col(&mut fptr, "aperture_radius", &radii).map_err(fits(path))?;
    table.write_col(&mut fptr, "inc_prescan", &prescan).map_err(fits(path))?;
    table.write_col(&mut fptr, "flux_adu", &fluxes).map_err(fits(path))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{DetectionParams, DetectorError};
    use crate::frame::Frame;
    use ndarray::Array2;
    use tempfile::TempDir;
    use tmon_common::db::ColumnMap;

    struct FixedDetector(Vec<DetectedSource>);

    impl Detector for FixedDetector {
        fn detect(
            &self,
            _frame_path: &Path,
            _params: &DetectionParams,
        ) -> std::result::Result<Vec<DetectedSource>, DetectorError> {
            Ok(self.0.clone())
        }
    }

    fn reference(shape: (usize, usize)) -> LoadedFrame {
        LoadedFrame::new(
            Frame {
                image_id: 555,
                ref_image_id: Some(555),
                data: Array2::zeros(shape),
            },
            "/data/ref.fits",
        )
    }

    fn detections() -> Vec<DetectedSource> {
        vec![
            DetectedSource::new(1000.0, 1000.0, 10_000.0),
            DetectedSource::new(1002.0, 1000.0, 10_000.0),
            DetectedSource::new(800.0, 900.0, 20_000.0),
            DetectedSource::new(100.0, 100.0, 20_000.0),
        ]
    }

    #[test]
    fn layout_matches_column_map() {
        let layout = RecordLayout::<CatalogueEntry>::derive(ColumnMap::builtin().unwrap()).unwrap();
        assert_eq!(layout.columns().len(), CatalogueEntry::FIELDS.len());
    }

    #[test]
    fn extract_keeps_isolated_central_sources() {
        let detector = FixedDetector(detections());
        let detection = DetectionConfig::default();
        let filter = FilterConfig::default();
        let builder = CatalogueBuilder::new(&detector, &detection, &filter);

        let entries = builder.extract(&reference((2048, 2088)), None).unwrap();

        assert_eq!(
            entries,
            vec![CatalogueEntry {
                ref_image_id: 555,
                x_coordinate: 800.0,
                y_coordinate: 900.0,
                aperture_radius: 3.0,
                inc_prescan: true,
                flux_adu: 20_000.0,
            }]
        );
    }

    #[test]
    fn region_file_has_filtered_and_raw_circles() {
        let dir = TempDir::new().unwrap();
        let region = dir.path().join("qa").join("ref.reg");
        let detector = FixedDetector(detections());
        let detection = DetectionConfig::default();
        let filter = FilterConfig::default();
        let builder = CatalogueBuilder::new(&detector, &detection, &filter);

        let entries = builder.extract(&reference((2048, 2048)), Some(&region)).unwrap();
        assert!(!entries[0].inc_prescan);

        let text = std::fs::read_to_string(&region).unwrap();
        let circles = text.lines().filter(|l| l.starts_with("circle(")).count();
        assert_eq!(circles, entries.len() + detections().len());
    }

    #[test]
    fn fits_catalogue_written_with_image_id() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("refcat.fits");
        let entries = vec![CatalogueEntry {
            ref_image_id: 555,
            x_coordinate: 800.0,
            y_coordinate: 900.0,
            aperture_radius: 3.0,
            inc_prescan: false,
            flux_adu: 20_000.0,
        }];

        render_fits_catalogue(&entries, 555, &path).unwrap();

        let mut fptr = FitsFile::open(&path).unwrap();
        let primary = fptr.primary_hdu().unwrap();
        let image_id: i64 = primary.read_key(&mut fptr, IMAGE_ID_KEY).unwrap();
        assert_eq!(image_id, 555);

        let table = fptr.hdu(FITS_TABLE_NAME).unwrap();
        let xs: Vec<f64> = table.read_col(&mut fptr, "x_coordinate").unwrap();
        assert_eq!(xs, vec![800.0]);
    }
}
