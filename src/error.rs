//! Error types for Kern.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Store has not been set up")]
    NotSetUp,

    #[error("Context busy: {0}")]
    ContextBusy(String),

    #[error("Not found: {0}")]
    NotFound(String),
}
