//! Point-source detection
//!
//! Detection is delegated to the external `imcore` tool. [`CachedDetector`] memoises
//! results by frame content and parameters, with explicit invalidation.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

/// Detector column names in the output table
const X_COLUMN: &str = "X_coordinate";
const Y_COLUMN: &str = "Y_coordinate";
const FLUX_COLUMN: &str = "Aper_flux_3";

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("Detector binary not found: {0}")]
    BinaryNotFound(String),

    #[error("Failed to execute detector: {0}")]
    ExecutionError(String),

    #[error("Detector exited with status {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("Failed to read detector output: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// One detection: centroid and aperture flux
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectedSource {
    pub x: f64,
    pub y: f64,
    pub flux: f64,
}

impl DetectedSource {
    pub fn new(x: f64, y: f64, flux: f64) -> Self {
        Self { x, y, flux }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionParams {
    pub n_pixels: u32,
    pub threshold: f64,
    pub fwhm_filter: f64,
    pub aperture_radius: f64,
}

impl DetectionParams {
    /// Stable textual form used in cache keys
    fn cache_fragment(&self) -> String {
        format!(
            "npix={};thresh={};fwhm={};rcore={}",
            self.n_pixels, self.threshold, self.fwhm_filter, self.aperture_radius
        )
    }
}

/// Synchronous source detector
pub trait Detector {
    fn detect(&self, frame_path: &Path, params: &DetectionParams)
        -> Result<Vec<DetectedSource>, DetectorError>;

    /// Detect on `frame_path`, a readable copy of the frame stored at `source`
    ///
    /// `source` differs from `frame_path` when the frame was decompressed to a scratch file.
    fn detect_source(
        &self,
        frame_path: &Path,
        _source: &Path,
        params: &DetectionParams,
    ) -> Result<Vec<DetectedSource>, DetectorError> {
        self.detect(frame_path, params)
    }

    /// Results for `source` are persisted and will not be asked for again
    fn release(&self, _source: &Path) {}
}

impl<D: Detector + ?Sized> Detector for &D {
    fn detect(
        &self,
        frame_path: &Path,
        params: &DetectionParams,
    ) -> Result<Vec<DetectedSource>, DetectorError> {
        (**self).detect(frame_path, params)
    }

    fn detect_source(
        &self,
        frame_path: &Path,
        source: &Path,
        params: &DetectionParams,
    ) -> Result<Vec<DetectedSource>, DetectorError> {
        (**self).detect_source(frame_path, source, params)
    }

    fn release(&self, source: &Path) {
        (**self).release(source)
    }
}

/// Runs `imcore <frame> noconf <out.fits> <npix> <threshold> --noell --filtfwhm <f> --rcore <r>`
pub struct ImcoreDetector {
    binary: String,
}

impl ImcoreDetector {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command_args(frame_path: &Path, output: &Path, params: &DetectionParams) -> Vec<String> {
        vec![
            frame_path.display().to_string(),
            "noconf".to_string(),
            output.display().to_string(),
            params.n_pixels.to_string(),
            params.threshold.to_string(),
            "--noell".to_string(),
            "--filtfwhm".to_string(),
            params.fwhm_filter.to_string(),
            "--rcore".to_string(),
            params.aperture_radius.to_string(),
        ]
    }

    fn read_output(path: &Path) -> Result<Vec<DetectedSource>, DetectorError> {
        let parse = |e: fitsio::errors::Error| DetectorError::ParseError(e.to_string());

        let mut fptr = fitsio::FitsFile::open(path).map_err(parse)?;
        let hdu = fptr.hdu(1).map_err(parse)?;
        let x: Vec<f64> = hdu.read_col(&mut fptr, X_COLUMN).map_err(parse)?;
        let y: Vec<f64> = hdu.read_col(&mut fptr, Y_COLUMN).map_err(parse)?;
        let flux: Vec<f64> = hdu.read_col(&mut fptr, FLUX_COLUMN).map_err(parse)?;

        if x.len() != y.len() || x.len() != flux.len() {
            return Err(DetectorError::ParseError(format!(
                "column lengths differ: {} / {} / {}",
                x.len(),
                y.len(),
                flux.len()
            )));
        }

        Ok(x.into_iter()
            .zip(y)
            .zip(flux)
            .map(|((x, y), flux)| DetectedSource { x, y, flux })
            .collect())
    }
}

impl Detector for ImcoreDetector {
    fn detect(
        &self,
        frame_path: &Path,
        params: &DetectionParams,
    ) -> Result<Vec<DetectedSource>, DetectorError> {
        let output = tempfile::Builder::new()
            .prefix("tmon_detect_")
            .suffix(".fits")
            .tempfile()?;
        let args = Self::command_args(frame_path, output.path(), params);

        info!(
            frame = %frame_path.display(),
            n_pixels = params.n_pixels,
            threshold = params.threshold,
            "Running source detection"
        );
        debug!("Running command [{} {}]", self.binary, args.join(" "));

        let result = Command::new(&self.binary).args(&args).output();
        let result = match result {
            Ok(result) => result,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DetectorError::BinaryNotFound(self.binary.clone()))
            }
            Err(e) => return Err(DetectorError::ExecutionError(e.to_string())),
        };

        if !result.status.success() {
            return Err(DetectorError::Failed {
                status: result.status.to_string(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }

        let sources = Self::read_output(output.path())?;
        info!(frame = %frame_path.display(), count = sources.len(), "Found sources");
        Ok(sources)
    }
}

/// Content-addressed detection cache
///
/// Key: SHA-256 over the frame bytes and the detection parameters. A changed file
/// produces a new key. Entries are recorded against the frame's on-disk path, so
/// `invalidate` and `release` take that path even when detection ran on a scratch copy.
/// An entry is only needed until its catalogue commits; `release` then drops it.
pub struct CachedDetector<D> {
    inner: D,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

struct CacheEntry {
    path: PathBuf,
    sources: Vec<DetectedSource>,
}

impl<D: Detector> CachedDetector<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    /// Drop cached detections for `path`, returning how many entries were removed
    pub fn invalidate(&self, path: &Path) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.path != path);
        before - entries.len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        // A panic while holding the lock leaves a usable map
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cache_key(path: &Path, params: &DetectionParams) -> Result<String, DetectorError> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 8192];
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        hasher.update(params.cache_fragment().as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }
}

impl<D: Detector> Detector for CachedDetector<D> {
    fn detect(
        &self,
        frame_path: &Path,
        params: &DetectionParams,
    ) -> Result<Vec<DetectedSource>, DetectorError> {
        self.detect_source(frame_path, frame_path, params)
    }

    fn detect_source(
        &self,
        frame_path: &Path,
        source: &Path,
        params: &DetectionParams,
    ) -> Result<Vec<DetectedSource>, DetectorError> {
        let key = Self::cache_key(frame_path, params)?;

        if let Some(entry) = self.lock().get(&key) {
            debug!(frame = %source.display(), "Detection cache hit");
            return Ok(entry.sources.clone());
        }

        let sources = self.inner.detect_source(frame_path, source, params)?;
        self.lock().insert(
            key,
            CacheEntry {
                path: source.to_path_buf(),
                sources: sources.clone(),
            },
        );
        Ok(sources)
    }

    fn release(&self, source: &Path) {
        let removed = self.invalidate(source);
        debug!(frame = %source.display(), removed, "Released cached detections");
        self.inner.release(source);
    }
}
