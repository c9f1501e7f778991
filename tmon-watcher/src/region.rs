//! DS9 region overlays for catalogue QA
//!
//! Kept sources are drawn first in green, then every raw detection in red.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::debug;

use crate::detector::DetectedSource;

pub const REGION_HEADER: &str = "# Region file format: DS9 version 4.1\n\
global color=green dashlist=8 3 width=1 font=\"helvetica 10 normal roman\" select=1 highlite=1 dash=0 fixed=0 edit=1 move=1 delete=1 include=1 source=1\n\
image\n";

pub const FILTERED_COLOUR: &str = "green";
pub const RAW_COLOUR: &str = "red";

pub struct RegionWriter<W: Write> {
    out: W,
    radius: f64,
}

impl RegionWriter<BufWriter<File>> {
    pub fn create(path: &Path, radius: f64) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::new(BufWriter::new(File::create(path)?), radius)
    }
}

impl<W: Write> RegionWriter<W> {
    /// Start a region file; the header is written immediately
    pub fn new(mut out: W, radius: f64) -> std::io::Result<Self> {
        out.write_all(REGION_HEADER.as_bytes())?;
        Ok(Self { out, radius })
    }

    pub fn circle(&mut self, x: f64, y: f64, colour: &str) -> std::io::Result<()> {
        writeln!(self.out, "circle({},{},{}) # color={}", x, y, self.radius, colour)
    }

    pub fn add_regions(&mut self, sources: &[DetectedSource], colour: &str) -> std::io::Result<()> {
        debug!(count = sources.len(), colour, "Adding regions");
        for source in sources {
            self.circle(source.x, source.y, colour)?;
        }
        Ok(())
    }

    pub fn finish(mut self) -> std::io::Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Write the overlay for one catalogue build
pub fn write_region_file(
    path: &Path,
    radius: f64,
    filtered: &[DetectedSource],
    raw: &[DetectedSource],
) -> std::io::Result<()> {
    let mut writer = RegionWriter::create(path, radius)?;
    writer.add_regions(filtered, FILTERED_COLOUR)?;
    writer.add_regions(raw, RAW_COLOUR)?;
    writer.finish()?;
    Ok(())
}
