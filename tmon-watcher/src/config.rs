//! Watcher configuration
//!
//! Extends the shared bootstrap settings with detection, filtering, photometry, queue,
//! artifact and supervisor sections. Every key has a compiled default.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tmon_common::config::TomlConfig;

use crate::detector::DetectionParams;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    #[serde(flatten)]
    pub base: TomlConfig,
    pub detection: DetectionConfig,
    pub filter: FilterConfig,
    pub photometry: PhotometryConfig,
    pub queue: QueueConfig,
    pub artifacts: ArtifactsConfig,
    pub supervisor: SupervisorConfig,
}

/// Source detection on reference frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Minimum connected pixels for a detection
    pub n_pixels: u32,
    /// Detection threshold in sigma above background
    pub threshold: f64,
    /// FWHM of the smoothing filter
    pub fwhm_filter: f64,
    /// Aperture radius used by the detector and stored with the catalogue
    pub aperture_radius: f64,
    /// Sources with any neighbour closer than this are dropped
    pub isolation_radius: f64,
    /// Detector executable, looked up in PATH when not absolute
    pub detector_binary: String,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            n_pixels: 2,
            threshold: 3.0,
            fwhm_filter: 1.5,
            aperture_radius: 3.0,
            isolation_radius: 6.0,
            detector_binary: "imcore".to_string(),
        }
    }
}

impl DetectionConfig {
    pub fn params(&self) -> DetectionParams {
        DetectionParams {
            n_pixels: self.n_pixels,
            threshold: self.threshold,
            fwhm_filter: self.fwhm_filter,
            aperture_radius: self.aperture_radius,
        }
    }
}

/// Geometric and flux limits for catalogue stars
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub overscan_width: f64,
    pub edge_margin: f64,
    pub image_size: f64,
    /// Pixels a stellar profile is assumed to spread over
    pub psf_size: f64,
    pub flux_low_per_pixel: f64,
    pub flux_high_per_pixel: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            overscan_width: 20.0,
            edge_margin: 512.0,
            image_size: 2048.0,
            psf_size: 2.0,
            flux_low_per_pixel: 1.0e3,
            flux_high_per_pixel: 45.0e3,
        }
    }
}

impl FilterConfig {
    /// Inclusive flux range
    pub fn flux_limits(&self) -> (f64, f64) {
        (
            self.flux_low_per_pixel * self.psf_size,
            self.flux_high_per_pixel * self.psf_size,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhotometryConfig {
    pub sky_radius_inner: f64,
    pub sky_radius_outer: f64,
    /// Absolute tolerance when matching reference and current positions
    pub coordinate_tolerance: f64,
    /// Flux ratios above this are reported as outliers
    pub outlier_ratio: f64,
}

impl Default for PhotometryConfig {
    fn default() -> Self {
        Self {
            sky_radius_inner: 4.0,
            sky_radius_outer: 8.0,
            coordinate_tolerance: 1.0e-8,
            outlier_ratio: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub job_type: String,
    pub batch_size: u32,
    pub poll_interval_secs: u64,
    /// How long a claimed job is reserved for this instance
    pub lease_secs: u64,
    /// Lifetime given to jobs created with `submit`
    pub job_lifetime_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            job_type: "transmission".to_string(),
            batch_size: 20,
            poll_interval_secs: 2,
            lease_secs: 300,
            job_lifetime_secs: 86_400,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// Optional QA artifacts written when a reference catalogue is built
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactsConfig {
    pub region_dir: Option<PathBuf>,
    pub catalogue_dir: Option<PathBuf>,
}

impl ArtifactsConfig {
    pub fn region_path(&self, ref_image_id: i64) -> Option<PathBuf> {
        self.region_dir
            .as_ref()
            .map(|dir| dir.join(format!("refcat_{}.reg", ref_image_id)))
    }

    pub fn catalogue_path(&self, ref_image_id: i64) -> Option<PathBuf> {
        self.catalogue_dir
            .as_ref()
            .map(|dir| dir.join(format!("refcat_{}.fits", ref_image_id)))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorKind {
    #[default]
    None,
    File,
    Http,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub kind: SupervisorKind,
    /// Heartbeat file for `kind = "file"`
    pub path: Option<PathBuf>,
    /// Endpoint for `kind = "http"`
    pub url: Option<String>,
    pub heartbeat_interval_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            kind: SupervisorKind::None,
            path: None,
            url: None,
            heartbeat_interval_secs: 30,
        }
    }
}

impl SupervisorConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}
