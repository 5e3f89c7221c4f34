//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for value parsing.
pub type ParseResult<T> = Result<T, ParseError>;

/// Errors raised while decoding a response into protocol messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The body is not valid JSON.
    #[error("invalid JSON body: {0}")]
    InvalidJson(String),

    /// The body is valid JSON but not an array of messages.
    #[error("expected a JSON array of messages, found {0}")]
    NotAnArray(&'static str),

    /// A message is not a JSON object.
    #[error("message {index} is not an object")]
    NotAnObject {
        /// Position of the message in the body.
        index: usize,
    },

    /// A message lacks a required field.
    #[error("message {index} is missing field `{field}`")]
    MissingField {
        /// Position of the message in the body.
        index: usize,
        /// Name of the missing field.
        field: &'static str,
    },

    /// A change message carries an operation this client does not know.
    #[error("message {index} has unknown operation {operation:?}")]
    UnknownOperation {
        /// Position of the message in the body.
        index: usize,
        /// The operation header value.
        operation: String,
    },

    /// A control message carries a control this client does not know.
    #[error("message {index} has unknown control {control:?}")]
    UnknownControl {
        /// Position of the message in the body.
        index: usize,
        /// The control header value.
        control: String,
    },

    /// A message is neither a change nor a control message.
    #[error("message {index} has neither an operation nor a control header")]
    UnknownMessage {
        /// Position of the message in the body.
        index: usize,
    },

    /// An offset literal could not be parsed.
    #[error("invalid offset {0:?}")]
    InvalidOffset(String),

    /// A shape handle was empty.
    #[error("shape handle must not be empty")]
    InvalidHandle,

    /// The schema header could not be parsed.
    #[error("invalid schema header: {0}")]
    InvalidSchema(String),
}

/// Errors raised while parsing a wire value into a typed [`Value`](crate::Value).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A null arrived for a column declared `NOT NULL`.
    ///
    /// This indicates a schema mismatch between client and server and is
    /// never coerced into a default value.
    #[error("column {column} does not allow NULL values")]
    NullValue {
        /// The offending column.
        column: String,
    },

    /// The raw text is not a valid literal for the column type.
    #[error("column {column}: invalid {type_name} value {value:?}")]
    InvalidValue {
        /// The offending column.
        column: String,
        /// The declared type name.
        type_name: String,
        /// The raw wire text.
        value: String,
    },

    /// An array literal is malformed.
    #[error("column {column}: malformed array literal: {reason}")]
    MalformedArray {
        /// The offending column.
        column: String,
        /// What went wrong.
        reason: String,
    },
}

impl ParseError {
    /// Returns the column the error refers to.
    pub fn column(&self) -> &str {
        match self {
            ParseError::NullValue { column }
            | ParseError::InvalidValue { column, .. }
            | ParseError::MalformedArray { column, .. } => column,
        }
    }
}
