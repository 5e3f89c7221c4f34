//! CLI error type.

use shapesync_client::{ShapeError, TransportError};
use thiserror::Error;

/// Errors reported by CLI commands.
#[derive(Error, Debug)]
pub enum CliError {
    /// A `name=value` argument had no `=`.
    #[error("invalid {kind} {raw:?}: expected name=value")]
    InvalidPair {
        /// Which argument was malformed.
        kind: &'static str,
        /// The argument as given.
        raw: String,
    },

    /// The stream rejected its options or failed.
    #[error(transparent)]
    Stream(#[from] ShapeError),

    /// The HTTP client could not be built.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Writing output failed.
    #[error("output error: {0}")]
    Io(#[from] std::io::Error),

    /// Serializing output failed.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;
