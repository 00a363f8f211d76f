//! Error types for `turncode` core library.

use thiserror::Error;

/// Result type alias using `turncode` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `turncode` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Output could not be parsed into JSON at all
    #[error(transparent)]
    Parse(#[from] crate::output::ParseError),

    /// Output ended before the final result record
    #[error("Incomplete output: {0}")]
    Incomplete(String),

    /// Parsed output did not have the shape of a Claude result record
    #[error("Protocol mismatch: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
