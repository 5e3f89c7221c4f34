//! CLI command implementations.

pub mod tail;
