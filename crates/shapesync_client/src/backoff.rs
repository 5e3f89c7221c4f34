//! Fetching with retry and exponential backoff.

use crate::config::BackoffConfig;
use crate::error::{ErrorBody, FetchError, HttpError};
use crate::transport::{HttpResponse, ShapeRequest, ShapeTransport};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Executes shape requests, retrying transient failures.
///
/// Transport errors flagged retryable, 5xx and 429 are retried under the
/// configured [`BackoffConfig`]. Every other non-2xx status is returned at
/// once. Cancellation is raced against both the request and the sleep
/// between attempts, so a fired token aborts within one backoff tick.
pub struct BackoffFetch<T: ShapeTransport> {
    transport: Arc<T>,
    config: BackoffConfig,
    attempts: AtomicU64,
    retries: AtomicU64,
}

impl<T: ShapeTransport> BackoffFetch<T> {
    /// Creates a fetcher over the given transport.
    pub fn new(transport: Arc<T>, config: BackoffConfig) -> Self {
        Self {
            transport,
            config,
            attempts: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    /// The retry policy.
    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Requests put on the wire so far, retries included.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Retries performed so far.
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Sends `request` until it succeeds, fails for good, or `cancel` fires.
    pub async fn fetch(
        &self,
        request: &ShapeRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, FetchError> {
        let mut retry: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Aborted);
            }

            self.attempts.fetch_add(1, Ordering::Relaxed);
            debug!(
                url = %request.url,
                offset = request.param("offset").unwrap_or("-1"),
                attempt = retry + 1,
                "sending shape request"
            );

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Aborted),
                outcome = self.transport.send(request) => outcome,
            };

            let error = match outcome {
                Ok(response) if response.is_success() => return Ok(response),
                Ok(response) => {
                    let error = http_error(response);
                    if !error.is_retryable_status() {
                        return Err(FetchError::Http(error));
                    }
                    FetchError::Http(error)
                }
                Err(error) if error.retryable => FetchError::Transport(error),
                Err(error) => return Err(FetchError::Transport(error)),
            };

            retry = retry.saturating_add(1);
            if !self.config.allows_retry(retry) {
                return Err(error);
            }

            let delay = self.config.delay_for_retry(retry);
            warn!(
                attempt = retry,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "shape request failed, backing off"
            );
            self.retries.fetch_add(1, Ordering::Relaxed);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Aborted),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Converts a failed response, parsing the body when it is declared JSON.
fn http_error(response: HttpResponse) -> HttpError {
    let is_json = response
        .header("content-type")
        .is_some_and(|value| value.to_ascii_lowercase().contains("application/json"));

    let body = if is_json {
        serde_json::from_str(&response.body)
            .map(ErrorBody::Json)
            .unwrap_or(ErrorBody::Text(response.body))
    } else {
        ErrorBody::Text(response.body)
    };

    HttpError {
        status: response.status,
        headers: response.headers,
        body,
        url: response.url,
    }
}
