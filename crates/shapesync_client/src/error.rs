//! Error types for the shape stream client.

use shapesync_protocol::{DecodeError, Offset, ParseError};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Result type for shape stream operations.
pub type ShapeResult<T> = Result<T, ShapeError>;

/// Broad category of a [`ShapeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected at construction; never retried.
    Configuration,
    /// Network or HTTP failure that outlived the backoff policy.
    Transport,
    /// The server broke the protocol contract.
    Protocol,
    /// A value did not match the column schema.
    Data,
    /// The stream was cancelled.
    Cancelled,
}

/// Errors surfaced by the shape stream.
#[derive(Error, Debug, Clone)]
pub enum ShapeError {
    /// The shape definition or connection options are malformed.
    #[error("invalid shape options: {0}")]
    InvalidShapeOptions(String),

    /// The supplied cancellation token cannot drive a stream.
    #[error("invalid signal: the cancellation token was already cancelled")]
    InvalidSignal,

    /// Custom params use names owned by the protocol.
    #[error("cannot use reserved parameter names in custom params: {}", .0.join(", "))]
    ReservedParam(Vec<String>),

    /// A request past the initial offset has no shape handle.
    #[error("shape handle is required if this isn't an initial fetch (offset > -1)")]
    MissingShapeHandle,

    /// The server answered with a non-retryable status.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// The network failed and retries were exhausted or not allowed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The fetch was cancelled before it completed.
    #[error("fetch with backoff aborted")]
    FetchBackoffAbort,

    /// The response could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A value could not be parsed; includes null values in `NOT NULL` columns.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The server moved the log position backwards.
    #[error("offset went backwards from {current} to {received}")]
    OffsetRegression {
        /// Offset held by the stream.
        current: Offset,
        /// Offset in the response.
        received: Offset,
    },

    /// The stream was started outside a Tokio runtime.
    #[error("shape stream must be started inside a Tokio runtime")]
    NoRuntime,

    /// The fetch loop is already running.
    #[error("shape stream is already running")]
    AlreadyRunning,

    /// The stream was stopped and cannot run again.
    #[error("shape stream has been stopped")]
    Stopped,
}

impl ShapeError {
    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShapeError::InvalidShapeOptions(_)
            | ShapeError::InvalidSignal
            | ShapeError::ReservedParam(_)
            | ShapeError::AlreadyRunning
            | ShapeError::NoRuntime => ErrorKind::Configuration,
            ShapeError::Http(_) | ShapeError::Transport(_) => ErrorKind::Transport,
            ShapeError::MissingShapeHandle
            | ShapeError::Decode(_)
            | ShapeError::OffsetRegression { .. } => ErrorKind::Protocol,
            ShapeError::Parse(_) => ErrorKind::Data,
            ShapeError::FetchBackoffAbort | ShapeError::Stopped => ErrorKind::Cancelled,
        }
    }

    /// Returns true if restarting the stream may succeed without any change
    /// on the consumer's side.
    pub fn is_retryable(&self) -> bool {
        match self {
            ShapeError::Http(e) => e.is_retryable_status(),
            ShapeError::Transport(e) => e.retryable,
            _ => false,
        }
    }

    /// Returns the HTTP status, for errors that carry one.
    pub fn status(&self) -> Option<u16> {
        match self {
            ShapeError::Http(e) => Some(e.status),
            _ => None,
        }
    }
}

/// Network-level failure reported by a transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("transport error: {message}")]
pub struct TransportError {
    /// Error message.
    pub message: String,
    /// Whether the request can be retried.
    pub retryable: bool,
}

impl TransportError {
    /// Creates a retryable transport error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Body of a failed HTTP response.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorBody {
    /// Parsed because the response declared `application/json`.
    Json(serde_json::Value),
    /// Anything else, kept as text.
    Text(String),
}

impl fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorBody::Json(json) => write!(f, "{json}"),
            ErrorBody::Text(text) => f.write_str(text),
        }
    }
}

/// A non-success HTTP response.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("HTTP error {status} at {url}: {body}")]
pub struct HttpError {
    /// Status code.
    pub status: u16,
    /// Response headers, lower-cased.
    pub headers: BTreeMap<String, String>,
    /// Response body.
    pub body: ErrorBody,
    /// Request URL.
    pub url: String,
}

impl HttpError {
    /// Returns true for statuses the backoff policy retries (5xx and 429).
    pub fn is_retryable_status(&self) -> bool {
        self.status >= 500 || self.status == 429
    }

    /// Returns true when the server invalidated the shape (409 Conflict).
    pub fn is_must_refetch(&self) -> bool {
        self.status == 409
    }
}

/// Outcome of a failed backoff fetch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    /// Non-retryable status, or the last retryable status once retries ran out.
    #[error(transparent)]
    Http(HttpError),

    /// Network failure that was not retryable or outlived the retries.
    #[error(transparent)]
    Transport(TransportError),

    /// Cancelled before a response arrived.
    #[error("fetch with backoff aborted")]
    Aborted,
}

impl From<FetchError> for ShapeError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Http(e) => ShapeError::Http(e),
            FetchError::Transport(e) => ShapeError::Transport(e),
            FetchError::Aborted => ShapeError::FetchBackoffAbort,
        }
    }
}
