//! Frame access
//!
//! Frames are FITS images, optionally bzip2-compressed on disk. A compressed frame is
//! expanded into a scratch file that lives exactly as long as the [`LoadedFrame`].

use fitsio::hdu::HduInfo;
use fitsio::FitsFile;
use ndarray::Array2;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

use crate::error::WatcherError;

/// Header key holding the unique frame id
pub const IMAGE_ID_KEY: &str = "IMAGE_ID";
/// Header key naming the autoguider reference image
pub const REFERENCE_IMAGE_KEY: &str = "AGREFIMG";
/// (rows, columns) of a readout that includes the prescan strips
pub const PRESCAN_SHAPE: (usize, usize) = (2048, 2088);

const COMPRESSED_SUFFIX: &str = ".bz2";
/// cfitsio status for a keyword absent from the header
const KEY_NO_EXIST: i32 = 202;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("FITS error in {path}: {source}")]
    Fits {
        path: String,
        #[source]
        source: fitsio::errors::Error,
    },

    #[error("Header key {key} missing from {path}")]
    MissingHeader { key: &'static str, path: String },

    /// Key present but its value cannot be read as the expected type
    #[error("Header key {key} in {path} is unreadable: {source}")]
    InvalidHeader {
        key: &'static str,
        path: String,
        #[source]
        source: fitsio::errors::Error,
    },

    #[error("Unsupported image layout in {path}: {detail}")]
    Layout { path: String, detail: String },

    #[error("Failed to decompress {path}: {source}")]
    Decompress {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    pub(crate) fn fits(path: &Path) -> impl FnOnce(fitsio::errors::Error) -> FrameError + '_ {
        move |source| FrameError::Fits {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Pixel data plus the header fields the monitor uses
#[derive(Debug, Clone)]
pub struct Frame {
    pub image_id: i64,
    /// Autoguider reference image id, absent for frames not taken under autoguiding
    pub ref_image_id: Option<i64>,
    /// Indexed `[[row, column]]`, i.e. `[[y, x]]`
    pub data: Array2<f64>,
}

impl Frame {
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn has_prescan(&self) -> bool {
        self.shape() == PRESCAN_SHAPE
    }

    /// Reference image id, or `NotAutoguided`
    pub fn require_reference(&self) -> Result<i64, WatcherError> {
        self.ref_image_id.ok_or(WatcherError::NotAutoguided {
            image_id: self.image_id,
        })
    }
}

/// A frame together with a readable uncompressed path for external tools
#[derive(Debug)]
pub struct LoadedFrame {
    pub frame: Frame,
    path: PathBuf,
    source: PathBuf,
    _scratch: Option<NamedTempFile>,
}

impl LoadedFrame {
    /// A frame read directly from `path`
    pub fn new(frame: Frame, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            frame,
            source: path.clone(),
            path,
            _scratch: None,
        }
    }

    /// Path of an uncompressed copy of the frame
    pub fn readable_path(&self) -> &Path {
        &self.path
    }

    /// Path the frame was loaded from, compressed or not
    pub fn source_path(&self) -> &Path {
        &self.source
    }
}

pub trait FrameReader {
    fn load(&self, path: &Path) -> Result<LoadedFrame, FrameError>;
}

impl<R: FrameReader + ?Sized> FrameReader for &R {
    fn load(&self, path: &Path) -> Result<LoadedFrame, FrameError> {
        (**self).load(path)
    }
}

/// Locate a frame on disk: the literal path, then its `.bz2` variant
pub fn resolve_frame_path(path: &Path) -> Result<PathBuf, WatcherError> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }

    let compressed = compressed_variant(path);
    if compressed.exists() {
        return Ok(compressed);
    }

    Err(WatcherError::FileResolution {
        candidates: vec![
            path.display().to_string(),
            compressed.display().to_string(),
        ],
    })
}

fn compressed_variant(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(COMPRESSED_SUFFIX);
    PathBuf::from(name)
}

fn is_compressed(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "bz2")
}

/// Reads FITS frames with cfitsio
#[derive(Debug, Default, Clone, Copy)]
pub struct FitsFrameReader;

impl FitsFrameReader {
    fn decompress(path: &Path) -> Result<NamedTempFile, FrameError> {
        let decompress_err = |source| FrameError::Decompress {
            path: path.display().to_string(),
            source,
        };

        let input = File::open(path)?;
        let mut decoder = bzip2::read::BzDecoder::new(BufReader::new(input));
        let mut scratch = tempfile::Builder::new()
            .prefix("tmon_frame_")
            .suffix(".fits")
            .tempfile()?;
        std::io::copy(&mut decoder, scratch.as_file_mut()).map_err(decompress_err)?;

        debug!(from = %path.display(), to = %scratch.path().display(), "Decompressed frame");
        Ok(scratch)
    }

    fn read_fits(path: &Path) -> Result<Frame, FrameError> {
        let mut fptr = FitsFile::open(path).map_err(FrameError::fits(path))?;
        let hdu = fptr.primary_hdu().map_err(FrameError::fits(path))?;

        let shape = match &hdu.info {
            HduInfo::ImageInfo { shape, .. } => shape.clone(),
            _ => {
                return Err(FrameError::Layout {
                    path: path.display().to_string(),
                    detail: "primary HDU is not an image".to_string(),
                })
            }
        };
        // cfitsio reports the slowest axis first: [rows, columns]
        let (rows, cols) = match shape.as_slice() {
            [rows, cols] => (*rows, *cols),
            other => {
                return Err(FrameError::Layout {
                    path: path.display().to_string(),
                    detail: format!("expected 2 axes, found {}", other.len()),
                })
            }
        };

        let image_id: i64 = hdu
            .read_key(&mut fptr, IMAGE_ID_KEY)
            .map_err(|_| FrameError::MissingHeader {
                key: IMAGE_ID_KEY,
                path: path.display().to_string(),
            })?;
        // Only a missing tag means "not autoguided"; a garbled one must fail the job
        let ref_image_id: Option<i64> = match hdu.read_key(&mut fptr, REFERENCE_IMAGE_KEY) {
            Ok(id) => Some(id),
            Err(fitsio::errors::Error::Fits(e)) if e.status == KEY_NO_EXIST => None,
            Err(source) => {
                return Err(FrameError::InvalidHeader {
                    key: REFERENCE_IMAGE_KEY,
                    path: path.display().to_string(),
                    source,
                })
            }
        };

        let pixels: Vec<f64> = hdu.read_image(&mut fptr).map_err(FrameError::fits(path))?;
        let data = Array2::from_shape_vec((rows, cols), pixels).map_err(|e| FrameError::Layout {
            path: path.display().to_string(),
            detail: e.to_string(),
        })?;

        Ok(Frame {
            image_id,
            ref_image_id,
            data,
        })
    }
}

impl FrameReader for FitsFrameReader {
    fn load(&self, path: &Path) -> Result<LoadedFrame, FrameError> {
        if is_compressed(path) {
            let scratch = Self::decompress(path)?;
            let frame = Self::read_fits(scratch.path())?;
            Ok(LoadedFrame {
                frame,
                path: scratch.path().to_path_buf(),
                source: path.to_path_buf(),
                _scratch: Some(scratch),
            })
        } else {
            let frame = Self::read_fits(path)?;
            Ok(LoadedFrame::new(frame, path))
        }
    }
}

/// Write a frame as a FITS image (used for fixtures and QA tooling)
pub fn write_fits_frame(path: &Path, frame: &Frame) -> Result<(), FrameError> {
    use fitsio::images::{ImageDescription, ImageType};

    let (rows, cols) = frame.shape();
    let description = ImageDescription {
        data_type: ImageType::Double,
        dimensions: &[rows, cols],
    };
    let mut fptr = FitsFile::create(path)
        .with_custom_primary(&description)
        .overwrite()
        .open()
        .map_err(FrameError::fits(path))?;
    let hdu = fptr.primary_hdu().map_err(FrameError::fits(path))?;

    hdu.write_key(&mut fptr, IMAGE_ID_KEY, frame.image_id)
        .map_err(FrameError::fits(path))?;
    if let Some(ref_image_id) = frame.ref_image_id {
        hdu.write_key(&mut fptr, REFERENCE_IMAGE_KEY, ref_image_id)
            .map_err(FrameError::fits(path))?;
    }

    let pixels: Vec<f64> = frame.data.iter().copied().collect();
    hdu.write_image(&mut fptr, &pixels)
        .map_err(FrameError::fits(path))?;
    Ok(())
}
