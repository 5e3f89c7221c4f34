//! # shapesync protocol
//!
//! Wire types and pure codecs for the shape log protocol.
//!
//! This crate provides:
//! - [`Offset`] and [`ShapeHandle`], the resumption coordinates of a shape log
//! - The versioned reserved query parameter sets
//! - Column schemas and the typed [`Value`] parser
//! - The response [message decoder](decode_response)
//!
//! This is a pure protocol crate with no I/O operations. Every function is a
//! pure function of its inputs and safe to call from any thread.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod message;
mod offset;
mod params;
mod parser;
mod schema;
mod value;

pub use error::{DecodeError, ParseError, ParseResult};
pub use message::{
    decode_messages, decode_response, ChangeMessage, ControlMessage, DecodedResponse, Message,
    Operation, OperationKind,
};
pub use offset::{Offset, ShapeHandle};
pub use params::{
    is_reserved, reserved_collisions, CURSOR_HEADER, DEFINITION_PARAMS_V1, HANDLE_HEADER,
    OFFSET_HEADER, PARAMS_VERSION, PROTOCOL_PARAMS_V1, SCHEMA_HEADER, UP_TO_DATE_HEADER,
};
pub use parser::{parse_array_literal, parse_row, parse_value, ArrayElement};
pub use schema::{ColumnInfo, ColumnType, Schema};
pub use value::{Row, Value};
