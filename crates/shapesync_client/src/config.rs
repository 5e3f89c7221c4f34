//! Configuration for shape streams.

use crate::error::{ShapeError, ShapeResult};
use reqwest::header::HeaderName;
use reqwest::Url;
use shapesync_protocol::{reserved_collisions, Offset, ShapeHandle};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Which columns the server sends for updates and deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Replica {
    /// Changed columns plus the primary key.
    #[default]
    Default,
    /// Every column of the row.
    Full,
}

impl Replica {
    /// Wire value of the `replica` parameter.
    pub fn as_str(&self) -> &'static str {
        match self {
            Replica::Default => "default",
            Replica::Full => "full",
        }
    }
}

/// The table, filter and column selection a stream follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeDefinition {
    /// Table name, optionally schema-qualified.
    pub table: String,
    /// SQL filter forwarded verbatim to the server.
    pub where_clause: Option<String>,
    /// Column selection; `None` selects every column.
    pub columns: Option<Vec<String>>,
    /// Replica mode.
    pub replica: Replica,
}

impl ShapeDefinition {
    /// Creates a definition for a whole table.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            where_clause: None,
            columns: None,
            replica: Replica::Default,
        }
    }

    /// Sets the row filter.
    pub fn with_where(mut self, where_clause: impl Into<String>) -> Self {
        self.where_clause = Some(where_clause.into());
        self
    }

    /// Sets the column selection.
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the replica mode.
    pub fn with_replica(mut self, replica: Replica) -> Self {
        self.replica = replica;
        self
    }

    /// Checks the definition without touching the network.
    pub fn validate(&self) -> ShapeResult<()> {
        let table = self.table.trim();
        if table.is_empty() {
            return Err(ShapeError::InvalidShapeOptions(
                "a table name is required".into(),
            ));
        }
        if table.chars().any(char::is_control) {
            return Err(ShapeError::InvalidShapeOptions(format!(
                "table name {:?} contains control characters",
                self.table
            )));
        }
        if let Some(where_clause) = &self.where_clause {
            if where_clause.trim().is_empty() {
                return Err(ShapeError::InvalidShapeOptions(
                    "where clause must not be blank".into(),
                ));
            }
        }
        if let Some(columns) = &self.columns {
            if columns.is_empty() {
                return Err(ShapeError::InvalidShapeOptions(
                    "column selection must not be empty".into(),
                ));
            }
            let mut seen = BTreeSet::new();
            for column in columns {
                if column.trim().is_empty() {
                    return Err(ShapeError::InvalidShapeOptions(
                        "column names must not be blank".into(),
                    ));
                }
                if !seen.insert(column.as_str()) {
                    return Err(ShapeError::InvalidShapeOptions(format!(
                        "column {column:?} is selected twice"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Query parameters describing the shape.
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![("table".to_string(), self.table.clone())];
        if let Some(where_clause) = &self.where_clause {
            params.push(("where".into(), where_clause.clone()));
        }
        if let Some(columns) = &self.columns {
            params.push(("columns".into(), columns.join(",")));
        }
        if self.replica != Replica::Default {
            params.push(("replica".into(), self.replica.as_str().into()));
        }
        params
    }
}

/// Retry policy for a single logical request.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay, jitter included.
    pub max_delay: Duration,
    /// Growth factor between consecutive retries.
    pub multiplier: f64,
    /// Maximum number of retries; `None` retries until cancelled.
    pub max_retries: Option<u32>,
    /// Whether to add up to 25% random jitter.
    pub jitter: bool,
}

impl BackoffConfig {
    /// Creates the default policy: 100ms growing by 1.3x up to 10s, unbounded.
    pub fn new() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 1.3,
            max_retries: None,
            jitter: true,
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: Some(0),
            ..Self::new()
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Bounds the number of retries.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Returns true if retry number `retry` (1-based) is allowed.
    pub fn allows_retry(&self, retry: u32) -> bool {
        self.max_retries.map_or(true, |max| retry <= max)
    }

    /// Delay before retry number `retry` (1-based). Zero for `retry == 0`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let max = self.max_delay.as_secs_f64();
        let base = (self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent)).min(max);

        let delay = if self.jitter {
            base + base * 0.25 * rand::random::<f64>()
        } else {
            base
        };
        Duration::from_secs_f64(delay.min(max))
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything needed to construct a [`ShapeStream`](crate::ShapeStream).
#[derive(Debug, Clone)]
pub struct ShapeStreamOptions {
    /// Shape endpoint, e.g. `http://localhost:3000/v1/shape`.
    pub url: String,
    /// The shape to follow.
    pub definition: ShapeDefinition,
    /// Extra query parameters; must not use reserved names.
    pub params: BTreeMap<String, String>,
    /// Extra request headers, e.g. authorization.
    pub headers: BTreeMap<String, String>,
    /// Retry policy for each request.
    pub backoff: BackoffConfig,
    /// Keep long-polling once up to date. When false the stream stops at the
    /// first up-to-date boundary.
    pub live: bool,
    /// Offset to resume from.
    pub offset: Option<Offset>,
    /// Handle to resume with; required when `offset` is past the sentinel.
    pub handle: Option<ShapeHandle>,
    /// External cancellation signal.
    pub signal: Option<CancellationToken>,
    /// Per-request timeout; must exceed the server's long-poll timeout.
    ///
    /// The stream does not read this itself. It is the value to hand to
    /// [`ReqwestTransport::new`](crate::ReqwestTransport::new) when building
    /// the transport for these options.
    pub request_timeout: Duration,
}

impl ShapeStreamOptions {
    /// Creates options with defaults for everything but the endpoint and shape.
    pub fn new(url: impl Into<String>, definition: ShapeDefinition) -> Self {
        Self {
            url: url.into(),
            definition,
            params: BTreeMap::new(),
            headers: BTreeMap::new(),
            backoff: BackoffConfig::default(),
            live: true,
            offset: None,
            handle: None,
            signal: None,
            request_timeout: Duration::from_secs(60),
        }
    }

    /// Adds a custom query parameter.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Adds a request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the retry policy.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Enables or disables live mode.
    pub fn with_live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    /// Resumes from a previously persisted position.
    pub fn resume_from(mut self, offset: Offset, handle: Option<ShapeHandle>) -> Self {
        self.offset = Some(offset);
        self.handle = handle;
        self
    }

    /// Sets the external cancellation signal.
    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Sets the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Validates the options. Performs no I/O.
    pub fn validate(&self) -> ShapeResult<()> {
        let url = Url::parse(&self.url).map_err(|e| {
            ShapeError::InvalidShapeOptions(format!("invalid url {:?}: {e}", self.url))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ShapeError::InvalidShapeOptions(format!(
                "unsupported url scheme {:?}",
                url.scheme()
            )));
        }
        self.definition.validate()?;

        if self.params.keys().any(|name| name.trim().is_empty()) {
            return Err(ShapeError::InvalidShapeOptions(
                "custom parameter names must not be blank".into(),
            ));
        }
        for name in self.headers.keys() {
            HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                ShapeError::InvalidShapeOptions(format!("invalid header name {name:?}"))
            })?;
        }

        if self.signal.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(ShapeError::InvalidSignal);
        }

        let url_params: Vec<String> = url
            .query_pairs()
            .map(|(name, _)| name.into_owned())
            .collect();
        let reserved = reserved_collisions(
            self.params
                .keys()
                .chain(url_params.iter())
                .map(String::as_str),
        );
        if !reserved.is_empty() {
            return Err(ShapeError::ReservedParam(reserved));
        }

        let offset = self.offset.unwrap_or_default();
        if !offset.is_initial() && self.handle.is_none() {
            return Err(ShapeError::MissingShapeHandle);
        }
        Ok(())
    }
}
