//! Transport layer abstraction for shape requests.

use crate::error::TransportError;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Url;
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::Notify;

/// One shape request, before it is put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeRequest {
    /// Shape endpoint. Its own query string may carry custom parameters.
    pub url: String,
    /// Query parameters in the order they are sent.
    pub params: Vec<(String, String)>,
    /// Request headers.
    pub headers: BTreeMap<String, String>,
}

impl ShapeRequest {
    /// Creates a request without parameters.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            params: Vec::new(),
            headers: BTreeMap::new(),
        }
    }

    /// Appends a query parameter.
    pub fn push_param(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.params.push((name.into(), value.into()));
    }

    /// Returns the first value of a query parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// The full URL including the encoded query string.
    ///
    /// Fails with a fatal transport error if the endpoint is not a valid URL.
    pub fn full_url(&self) -> Result<String, TransportError> {
        Url::parse_with_params(&self.url, &self.params)
            .map(String::from)
            .map_err(|e| TransportError::fatal(format!("invalid url {:?}: {e}", self.url)))
    }
}

/// A raw HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Headers with lower-cased names.
    pub headers: BTreeMap<String, String>,
    /// Response body.
    pub body: String,
    /// URL that produced the response.
    pub url: String,
}

impl HttpResponse {
    /// Creates a response with the given status and body.
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
            url: String::new(),
        }
    }

    /// Creates a `200 OK` response.
    pub fn ok(body: impl Into<String>) -> Self {
        Self::new(200, body)
    }

    /// Adds a header; the name is lower-cased.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Looks up a header by name, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Sends shape requests over some network.
///
/// Implementations must be safe to share between streams. Cancellation is
/// handled by the caller dropping the returned future, so implementations
/// need no cancellation logic of their own.
#[async_trait]
pub trait ShapeTransport: Send + Sync {
    /// Sends one request and returns the response, whatever its status.
    async fn send(&self, request: &ShapeRequest) -> Result<HttpResponse, TransportError>;
}

/// A scripted transport for tests.
///
/// Replies are returned in the order they were queued. Once the script runs
/// out, requests hang like a long poll with no new data until the caller
/// gives up.
#[derive(Debug, Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    requests: Mutex<Vec<ShapeRequest>>,
    request_seen: Notify,
}

impl MockTransport {
    /// Creates an empty mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response.
    pub fn push_response(&self, response: HttpResponse) {
        self.script.lock().push_back(Ok(response));
    }

    /// Queues a transport failure.
    pub fn push_error(&self, error: TransportError) {
        self.script.lock().push_back(Err(error));
    }

    /// Returns every request sent so far.
    pub fn requests(&self) -> Vec<ShapeRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests sent so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Number of queued replies not yet consumed.
    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }

    /// Waits until at least `count` requests have been sent.
    pub async fn wait_for_requests(&self, count: usize) {
        loop {
            let seen = self.request_seen.notified();
            if self.request_count() >= count {
                return;
            }
            seen.await;
        }
    }
}

#[async_trait]
impl ShapeTransport for MockTransport {
    async fn send(&self, request: &ShapeRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().push(request.clone());
        self.request_seen.notify_waiters();

        let reply = self.script.lock().pop_front();
        match reply {
            Some(Ok(mut response)) => {
                response.url = request.full_url()?;
                Ok(response)
            }
            Some(Err(error)) => Err(error),
            None => std::future::pending().await,
        }
    }
}
