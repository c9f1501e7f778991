//! # tmon-watcher
//!
//! Atmospheric transparency monitoring for a wide-field survey camera.
//!
//! A reference catalogue of isolated, well-exposed stars is extracted once per reference
//! frame; every later science frame is measured at the same positions and the flux ratios
//! against the reference give the relative atmospheric transmission. Work arrives through a
//! job queue polled by the [`orchestrator`].

pub mod catalogue;
pub mod config;
pub mod detector;
pub mod error;
pub mod frame;
pub mod orchestrator;
pub mod photometry;
pub mod queue;
pub mod region;
pub mod source_filter;
pub mod spatial;
pub mod store;
pub mod supervisor;

pub use config::WatcherConfig;
pub use error::{Result, WatcherError};
pub use orchestrator::{JobOutcome, Orchestrator};
