//! # shapesync client
//!
//! Resumable client for shape logs served over HTTP long-polling.
//!
//! This crate provides:
//! - The [`ShapeStream`] state machine (initial → catching up → live)
//! - Fetching with exponential backoff and cancellation
//! - Subscriber fan-out of typed row operations
//! - A pluggable [`ShapeTransport`], with a reqwest implementation and a
//!   scripted mock for tests
//! - An in-memory [`Shape`] that materializes the rows
//!
//! ## Key Invariants
//!
//! - Every request echoes the offset and handle the server last returned
//! - Operations reach subscribers in non-decreasing offset order
//! - An up-to-date event follows every operation it covers
//! - A response that fails to decode or parse delivers nothing
//! - A new shape handle always resets the stream to the initial offset
//! - After `stop()` returns, the only event delivered is `Stopped`

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backoff;
mod config;
mod error;
mod feed;
mod http;
mod shape;
mod stream;
mod transport;

pub use backoff::BackoffFetch;
pub use config::{BackoffConfig, Replica, ShapeDefinition, ShapeStreamOptions};
pub use error::{
    ErrorBody, ErrorKind, FetchError, HttpError, ShapeError, ShapeResult, TransportError,
};
pub use feed::{ShapeEvent, SubscriberId};
pub use http::ReqwestTransport;
pub use shape::Shape;
pub use stream::{ShapeStream, ShapeStreamStats, StreamState};
pub use transport::{HttpResponse, MockTransport, ShapeRequest, ShapeTransport};

pub use tokio_util::sync::CancellationToken;
