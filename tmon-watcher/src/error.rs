//! Watcher error taxonomy
//!
//! Everything except supervisory communication is scoped to a single job: the job is left
//! queued and retried on a later iteration.

use crate::detector::DetectorError;
use crate::frame::FrameError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WatcherError>;

#[derive(Error, Debug)]
pub enum WatcherError {
    /// Frame carries no reference-image tag; not eligible for monitoring
    #[error("Image {image_id} is not autoguided, no reference image tag")]
    NotAutoguided { image_id: i64 },

    #[error("Cannot find filename for image {0}")]
    CatalogueLookupMissing(i64),

    #[error("Cannot find any of the files: {}", .candidates.join(", "))]
    FileResolution { candidates: Vec<String> },

    #[error("Coordinate mismatch between reference and current photometry: {0}")]
    CoordinateMismatch(String),

    #[error("Reference catalogue for image {0} has no sources")]
    EmptyCatalogue(i64),

    #[error("Source detection failed: {0}")]
    DetectorInvocation(#[from] DetectorError),

    #[error("Supervisor communication failed: {0}")]
    SupervisoryCommunication(String),

    #[error("Job {job_id} has no '{key}' argument")]
    MissingArgument { job_id: i64, key: String },

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Common(#[from] tmon_common::Error),
}

impl WatcherError {
    /// True when the failure only affects the job being processed
    pub fn is_job_scoped(&self) -> bool {
        !matches!(self, WatcherError::SupervisoryCommunication(_))
    }
}
