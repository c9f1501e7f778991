//! # Transparency Monitor Common Library
//!
//! Shared code for the transparency monitoring tools including:
//! - Error type
//! - Bootstrap configuration loading and path resolution
//! - Tracing initialisation
//! - Database initialisation, declarative column map and schema-driven records

pub mod config;
pub mod db;
pub mod error;
pub mod logging;

pub use error::{Error, Result};
