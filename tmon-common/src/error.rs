//! Errors shared by the tmon crates

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file unreadable or malformed, or logging could not start
    #[error("Configuration error: {0}")]
    Config(String),

    /// Column map does not describe a table or a record field
    #[error("Schema error: {0}")]
    Schema(String),
}
