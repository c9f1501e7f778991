//! Stand-ins for the external detector, the frame store and the supervisor

use async_trait::async_trait;
use ndarray::Array2;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tmon_watcher::detector::{DetectedSource, DetectionParams, Detector, DetectorError};
use tmon_watcher::frame::{Frame, FrameError, FrameReader, LoadedFrame};
use tmon_watcher::supervisor::Supervisor;
use tmon_watcher::WatcherError;

/// Sky level of synthetic frames
pub const SKY: f64 = 50.0;

/// Detector returning a fixed table, or failing like a non-zero exit
pub struct FakeDetector {
    sources: Vec<DetectedSource>,
    fail: bool,
    calls: AtomicUsize,
}

impl FakeDetector {
    pub fn returning(sources: Vec<DetectedSource>) -> Self {
        Self {
            sources,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            sources: Vec::new(),
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Detector for FakeDetector {
    fn detect(
        &self,
        _frame_path: &Path,
        _params: &DetectionParams,
    ) -> Result<Vec<DetectedSource>, DetectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(DetectorError::Failed {
                status: "exit status: 1".to_string(),
                stderr: "imcore: cannot open image".to_string(),
            });
        }
        Ok(self.sources.clone())
    }
}

/// Frames served from memory, keyed by the path the watcher resolved on disk
#[derive(Default)]
pub struct MemoryFrameReader {
    frames: Mutex<HashMap<PathBuf, Frame>>,
    loads: AtomicUsize,
}

impl MemoryFrameReader {
    pub fn insert(&self, path: impl Into<PathBuf>, frame: Frame) {
        self.frames.lock().unwrap().insert(path.into(), frame);
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl FrameReader for MemoryFrameReader {
    fn load(&self, path: &Path) -> Result<LoadedFrame, FrameError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let frame = self.frames.lock().unwrap().get(path).cloned().ok_or_else(|| {
            FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no frame registered for {}", path.display()),
            ))
        })?;
        Ok(LoadedFrame::new(frame, path))
    }
}

/// Supervisor whose registration or heartbeat can be made to fail
pub struct FlakySupervisor {
    pub fail_register: bool,
    pub fail_heartbeat: bool,
}

#[async_trait]
impl Supervisor for FlakySupervisor {
    async fn register(&self) -> tmon_watcher::Result<()> {
        if self.fail_register {
            return Err(WatcherError::SupervisoryCommunication("registration refused".into()));
        }
        Ok(())
    }

    async fn heartbeat(&self) -> tmon_watcher::Result<()> {
        if self.fail_heartbeat {
            return Err(WatcherError::SupervisoryCommunication("supervisor gone".into()));
        }
        Ok(())
    }
}

/// Uniform sky plus point sources of the given flux at integer pixels
pub fn star_field(shape: (usize, usize), stars: &[(f64, f64, f64)]) -> Array2<f64> {
    let mut data = Array2::from_elem(shape, SKY);
    for &(x, y, flux) in stars {
        data[[y as usize, x as usize]] += flux;
    }
    data
}

pub fn frame(image_id: i64, ref_image_id: Option<i64>, data: Array2<f64>) -> Frame {
    Frame {
        image_id,
        ref_image_id,
        data,
    }
}

/// Create an empty file so path resolution finds it
pub fn touch(path: &Path) {
    std::fs::write(path, b"").unwrap();
}
