//! HTTP transport backed by reqwest.

use crate::error::TransportError;
use crate::transport::{HttpResponse, ShapeRequest, ShapeTransport};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::trace;

/// Production transport on a pooled `reqwest::Client`.
///
/// The client is cheap to clone and safe to share, so one transport can
/// serve any number of streams.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Creates a transport whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::fatal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ShapeTransport for ReqwestTransport {
    async fn send(&self, request: &ShapeRequest) -> Result<HttpResponse, TransportError> {
        let url = request.full_url()?;
        let mut builder = self.client.get(&url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(map_error)?;
        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
            })
            .collect();
        let body = response.text().await.map_err(map_error)?;
        trace!(status, bytes = body.len(), "shape response received");

        Ok(HttpResponse {
            status,
            headers,
            body,
            url,
        })
    }
}

/// Builder errors are bugs in the request and never heal on retry; every
/// other failure (connect, timeout, reading the body) may.
fn map_error(error: reqwest::Error) -> TransportError {
    if error.is_builder() {
        TransportError::fatal(error.to_string())
    } else {
        TransportError::retryable(error.to_string())
    }
}
