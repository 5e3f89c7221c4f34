//! The shape stream state machine.
//!
//! A [`ShapeStream`] follows one shape by long-polling its endpoint:
//!
//! ```text
//! Initial ──► CatchingUp ──► Live ◄──┐
//!    ▲             │           │      │ live requests
//!    └── reset ◄───┴───────────┴──────┘
//!
//! any ──► Errored (restart resumes)   any ──► Stopped (terminal)
//! ```
//!
//! Each cycle builds a request from the committed position, runs it through
//! [`BackoffFetch`], decodes and parses the whole response, delivers the
//! resulting events to subscribers and only then commits the new position.
//! A response that fails anywhere along the way delivers nothing.

use crate::backoff::BackoffFetch;
use crate::config::ShapeStreamOptions;
use crate::error::{FetchError, ShapeError, ShapeResult};
use crate::feed::{ShapeEvent, SubscriberId, Subscribers};
use crate::transport::{ShapeRequest, ShapeTransport};
use parking_lot::{Mutex, RwLock};
use shapesync_protocol::{decode_response, Offset, Operation, ParseResult, Schema, ShapeHandle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No data received for the current shape handle.
    Initial,
    /// Receiving the snapshot or backlog.
    CatchingUp,
    /// Caught up and long-polling for new changes.
    Live,
    /// Failed; `restart` resumes from the last committed position.
    Errored,
    /// Stopped for good.
    Stopped,
}

impl StreamState {
    /// Returns true for `Errored` and `Stopped`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamState::Errored | StreamState::Stopped)
    }
}

/// Counters describing a stream's activity.
#[derive(Debug, Clone, Default)]
pub struct ShapeStreamStats {
    /// Requests put on the wire, retries included.
    pub requests: u64,
    /// Retries performed by the backoff policy.
    pub retries: u64,
    /// Operations delivered to subscribers.
    pub operations_delivered: u64,
    /// Shape resets, server or consumer initiated.
    pub resets: u64,
    /// When the stream last reached an up-to-date boundary.
    pub last_synced_at: Option<Instant>,
    /// Message of the last fatal error.
    pub last_error: Option<String>,
}

/// The committed position of a stream.
#[derive(Debug, Clone, Default)]
struct Position {
    offset: Offset,
    handle: Option<ShapeHandle>,
    cursor: Option<String>,
    schema: Option<Schema>,
    up_to_date: bool,
}

enum Cycle {
    Continue,
    Finished,
}

struct Inner<T: ShapeTransport> {
    options: ShapeStreamOptions,
    fetch: BackoffFetch<T>,
    subscribers: Subscribers,
    position: RwLock<Position>,
    state: RwLock<StreamState>,
    stats: RwLock<ShapeStreamStats>,
    operations_delivered: AtomicU64,
    cancel: CancellationToken,
    running: AtomicBool,
    reset_requested: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// A resumable, long-polling subscription to one shape.
///
/// Cloning is cheap; clones share the same stream.
///
/// # Example
///
/// ```rust,ignore
/// use shapesync_client::{ReqwestTransport, ShapeDefinition, ShapeStream, ShapeStreamOptions};
///
/// let options = ShapeStreamOptions::new("http://localhost:3000/v1/shape", ShapeDefinition::new("items"));
/// let transport = ReqwestTransport::new(options.request_timeout)?;
/// let stream = ShapeStream::new(options, transport)?;
/// let (_, mut events) = stream.subscribe_channel();
/// stream.start()?;
/// while let Some(event) = events.recv().await {
///     println!("{event:?}");
/// }
/// ```
pub struct ShapeStream<T: ShapeTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: ShapeTransport> Clone for ShapeStream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ShapeTransport + 'static> ShapeStream<T> {
    /// Creates a stream. Validates the options; performs no I/O.
    pub fn new(options: ShapeStreamOptions, transport: T) -> ShapeResult<Self> {
        Self::with_shared_transport(options, Arc::new(transport))
    }

    /// Creates a stream over a transport shared with other streams.
    pub fn with_shared_transport(
        options: ShapeStreamOptions,
        transport: Arc<T>,
    ) -> ShapeResult<Self> {
        options.validate()?;

        let position = Position {
            offset: options.offset.unwrap_or_default(),
            handle: options.handle.clone(),
            ..Position::default()
        };
        let state = if position.offset.is_initial() {
            StreamState::Initial
        } else {
            StreamState::CatchingUp
        };
        let cancel = options
            .signal
            .as_ref()
            .map_or_else(CancellationToken::new, CancellationToken::child_token);
        let fetch = BackoffFetch::new(transport, options.backoff.clone());

        Ok(Self {
            inner: Arc::new(Inner {
                options,
                fetch,
                subscribers: Subscribers::new(),
                position: RwLock::new(position),
                state: RwLock::new(state),
                stats: RwLock::new(ShapeStreamStats::default()),
                operations_delivered: AtomicU64::new(0),
                cancel,
                running: AtomicBool::new(false),
                reset_requested: AtomicBool::new(false),
                task: Mutex::new(None),
            }),
        })
    }

    /// Spawns the fetch loop on the current Tokio runtime.
    pub fn start(&self) -> ShapeResult<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ShapeError::NoRuntime)?;
        let guard = self.claim()?;
        let inner = Arc::clone(&self.inner);
        // Held across the spawn so a restart from the new loop lands after.
        let mut task = self.inner.task.lock();
        *task = Some(runtime.spawn(async move {
            // Failures are reported to subscribers and kept in the stats.
            let _ = inner.run_loop(guard).await;
        }));
        Ok(())
    }

    /// Runs the fetch loop on the calling task until the stream stops or
    /// fails.
    ///
    /// Returns `Ok` once stopped, or once up to date when live mode is off.
    pub async fn run(&self) -> ShapeResult<()> {
        let guard = self.claim()?;
        self.inner.run_loop(guard).await
    }

    /// Waits for a loop spawned by [`start`](Self::start) to exit.
    pub async fn join(&self) {
        let handle = self.inner.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Resumes an errored stream from its last committed position.
    ///
    /// May be called from the callback handling [`ShapeEvent::Error`]: the
    /// failed loop has already released the stream by then.
    pub fn restart(&self) -> ShapeResult<()> {
        if self.state() == StreamState::Stopped {
            return Err(ShapeError::Stopped);
        }
        info!(table = %self.inner.options.definition.table, "restarting shape stream");
        self.start()
    }

    fn claim(&self) -> ShapeResult<RunGuard<T>> {
        if self.inner.cancel.is_cancelled() || self.state() == StreamState::Stopped {
            return Err(ShapeError::Stopped);
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(ShapeError::AlreadyRunning);
        }
        Ok(RunGuard {
            inner: Arc::clone(&self.inner),
        })
    }
}

impl<T: ShapeTransport> ShapeStream<T> {
    /// Stops the stream.
    ///
    /// Cancels the in-flight request or backoff sleep. Once this returns no
    /// further event is delivered apart from a single [`ShapeEvent::Stopped`].
    /// May be called from inside a subscriber callback.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Requests a reset: the loop discards its position and refetches the
    /// shape from scratch before its next request.
    pub fn reset(&self) {
        self.inner.reset_requested.store(true, Ordering::SeqCst);
    }

    /// Registers a callback invoked for every subsequent event.
    pub fn subscribe<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(&ShapeEvent) + Send + Sync + 'static,
    {
        self.inner.subscribers.subscribe(callback)
    }

    /// Registers a channel receiving every subsequent event.
    pub fn subscribe_channel(&self) -> (SubscriberId, UnboundedReceiver<ShapeEvent>) {
        self.inner.subscribers.subscribe_channel()
    }

    /// Removes a subscriber. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.inner.subscribers.unsubscribe(id)
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        *self.inner.state.read()
    }

    /// Last committed offset.
    pub fn offset(&self) -> Offset {
        self.inner.position.read().offset
    }

    /// Current shape handle.
    pub fn handle(&self) -> Option<ShapeHandle> {
        self.inner.position.read().handle.clone()
    }

    /// Last live cursor received.
    pub fn cursor(&self) -> Option<String> {
        self.inner.position.read().cursor.clone()
    }

    /// Returns true once the stream has reached an up-to-date boundary for
    /// the current shape handle.
    pub fn is_up_to_date(&self) -> bool {
        self.inner.position.read().up_to_date
    }

    /// Column schema, once the server has sent it.
    pub fn schema(&self) -> Option<Schema> {
        self.inner.position.read().schema.clone()
    }

    /// Returns true while a fetch loop is running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Activity counters.
    pub fn stats(&self) -> ShapeStreamStats {
        let mut stats = self.inner.stats.read().clone();
        stats.requests = self.inner.fetch.attempts();
        stats.retries = self.inner.fetch.retries();
        stats.operations_delivered = self.inner.operations_delivered.load(Ordering::Relaxed);
        stats
    }

    /// The options the stream was created with.
    pub fn options(&self) -> &ShapeStreamOptions {
        &self.inner.options
    }

    /// The transport requests go through.
    pub fn transport(&self) -> &Arc<T> {
        self.inner.fetch.transport()
    }
}

/// Marks the loop as running until dropped.
struct RunGuard<T: ShapeTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: ShapeTransport> Drop for RunGuard<T> {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
    }
}

impl<T: ShapeTransport> Inner<T> {
    fn table(&self) -> &str {
        &self.options.definition.table
    }

    async fn run_loop(&self, guard: RunGuard<T>) -> ShapeResult<()> {
        {
            let position = self.position.read();
            self.set_state(if position.offset.is_initial() {
                StreamState::Initial
            } else if position.up_to_date {
                StreamState::Live
            } else {
                StreamState::CatchingUp
            });
            info!(
                table = %self.table(),
                offset = %position.offset,
                handle = position.handle.as_ref().map_or("", ShapeHandle::as_str),
                "shape stream started"
            );
        }

        loop {
            if self.cancel.is_cancelled() {
                self.stop();
                return Ok(());
            }
            if self.reset_requested.swap(false, Ordering::SeqCst) {
                self.apply_reset("requested by consumer");
            }

            match self.cycle().await {
                Ok(Cycle::Continue) => {}
                Ok(Cycle::Finished) => {
                    info!(table = %self.table(), "shape is up to date, live mode disabled");
                    self.stop();
                    return Ok(());
                }
                Err(ShapeError::FetchBackoffAbort) if self.cancel.is_cancelled() => {
                    self.stop();
                    return Ok(());
                }
                Err(err) => {
                    // Released first so an error callback may restart.
                    drop(guard);
                    self.fail(err.clone());
                    return Err(err);
                }
            }
        }
    }

    async fn cycle(&self) -> ShapeResult<Cycle> {
        let request = self.build_request()?;

        let response = match self.fetch.fetch(&request, &self.cancel).await {
            Ok(response) => response,
            Err(FetchError::Http(err)) if err.is_must_refetch() => {
                self.apply_reset("server answered 409");
                return Ok(Cycle::Continue);
            }
            Err(err) => return Err(err.into()),
        };

        let decoded = decode_response(response.status, &response.headers, &response.body)?;
        if decoded.must_refetch() {
            self.apply_reset("must-refetch");
            return Ok(Cycle::Continue);
        }

        let current = self.position.read().clone();
        if let (Some(held), Some(received)) = (&current.handle, &decoded.handle) {
            if held != received {
                warn!(
                    table = %self.table(),
                    handle = held.as_str(),
                    received = received.as_str(),
                    "shape handle changed"
                );
                self.apply_reset("shape handle changed");
                return Ok(Cycle::Continue);
            }
        }

        let offset = decoded.offset.unwrap_or(current.offset);
        if offset < current.offset {
            return Err(ShapeError::OffsetRegression {
                current: current.offset,
                received: offset,
            });
        }

        let schema = decoded.schema.or(current.schema);
        let operations = {
            let empty = Schema::new();
            let parse_schema = schema.as_ref().unwrap_or(&empty);
            decoded
                .changes
                .into_iter()
                .map(|change| change.into_operation(parse_schema, offset))
                .collect::<ParseResult<Vec<Operation>>>()?
        };
        check_operation_offsets(current.offset, &operations)?;

        debug!(
            table = %self.table(),
            status = response.status,
            offset = %offset,
            operations = operations.len(),
            up_to_date = decoded.up_to_date,
            "shape response applied"
        );

        if !operations.is_empty() {
            let count = operations.len() as u64;
            if self.subscribers.notify(&ShapeEvent::Operations(operations)) {
                self.operations_delivered.fetch_add(count, Ordering::Relaxed);
            }
        }
        if decoded.up_to_date {
            self.subscribers.notify(&ShapeEvent::UpToDate { offset });
        }

        let up_to_date = current.up_to_date || decoded.up_to_date;
        {
            let mut position = self.position.write();
            position.offset = offset;
            position.handle = decoded.handle.or(current.handle);
            position.cursor = decoded.cursor.or(current.cursor);
            position.schema = schema;
            position.up_to_date = up_to_date;
        }
        if decoded.up_to_date {
            self.stats.write().last_synced_at = Some(Instant::now());
        }

        let next = if up_to_date {
            StreamState::Live
        } else {
            StreamState::CatchingUp
        };
        if self.set_state(next) && next == StreamState::Live {
            info!(table = %self.table(), offset = %offset, "shape stream is live");
        }

        if decoded.up_to_date && !self.options.live {
            return Ok(Cycle::Finished);
        }
        Ok(Cycle::Continue)
    }

    fn build_request(&self) -> ShapeResult<ShapeRequest> {
        let position = self.position.read();
        if !position.offset.is_initial() && position.handle.is_none() {
            return Err(ShapeError::MissingShapeHandle);
        }

        let mut request = ShapeRequest::new(self.options.url.as_str());
        request.headers = self.options.headers.clone();
        for (name, value) in self.options.definition.to_params() {
            request.push_param(name, value);
        }
        for (name, value) in &self.options.params {
            request.push_param(name.as_str(), value.as_str());
        }
        request.push_param("offset", position.offset.to_string());
        if let Some(handle) = &position.handle {
            request.push_param("handle", handle.as_str());
        }
        if position.up_to_date && self.options.live {
            request.push_param("live", "true");
            if let Some(cursor) = &position.cursor {
                request.push_param("cursor", cursor.as_str());
            }
        }
        Ok(request)
    }

    /// Discards the position and tells subscribers to drop their copy.
    fn apply_reset(&self, reason: &str) {
        *self.position.write() = Position::default();
        self.stats.write().resets += 1;
        self.set_state(StreamState::Initial);
        info!(table = %self.table(), reason, "shape reset, refetching from the start");
        self.subscribers.notify(&ShapeEvent::Reset);
    }

    fn fail(&self, err: ShapeError) {
        error!(table = %self.table(), error = %err, "shape stream failed");
        self.stats.write().last_error = Some(err.to_string());
        self.set_state(StreamState::Errored);
        self.subscribers.notify(&ShapeEvent::Error(Arc::new(err)));
    }

    fn stop(&self) {
        self.cancel.cancel();
        *self.state.write() = StreamState::Stopped;
        if self.subscribers.close_with(&ShapeEvent::Stopped) {
            info!(table = %self.table(), "shape stream stopped");
        }
    }

    /// Moves to `next` unless stopped. Returns true if the state changed.
    fn set_state(&self, next: StreamState) -> bool {
        let mut state = self.state.write();
        if *state == StreamState::Stopped || *state == next {
            return false;
        }
        *state = next;
        true
    }
}

/// Operation offsets must not go below the committed offset nor below the
/// operation before them.
fn check_operation_offsets(committed: Offset, operations: &[Operation]) -> ShapeResult<()> {
    let mut floor = committed;
    for operation in operations {
        if operation.offset < floor {
            return Err(ShapeError::OffsetRegression {
                current: floor,
                received: operation.offset,
            });
        }
        floor = operation.offset;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackoffConfig, ShapeDefinition};
    use crate::transport::{HttpResponse, MockTransport};
    use shapesync_protocol::{HANDLE_HEADER, OFFSET_HEADER, SCHEMA_HEADER};

    fn options() -> ShapeStreamOptions {
        ShapeStreamOptions::new("http://localhost:3000/v1/shape", ShapeDefinition::new("items"))
            .with_backoff(BackoffConfig::no_retry())
    }

    fn stream(options: ShapeStreamOptions) -> ShapeStream<MockTransport> {
        ShapeStream::new(options, MockTransport::new()).unwrap()
    }

    fn up_to_date(handle: &str, offset: &str) -> HttpResponse {
        HttpResponse::ok(r#"[{"headers":{"control":"up-to-date"}}]"#)
            .with_header(HANDLE_HEADER, handle)
            .with_header(OFFSET_HEADER, offset)
            .with_header(SCHEMA_HEADER, r#"{"id":{"type":"int4","not_null":true}}"#)
    }

    #[test]
    fn initial_state_depends_on_resume_offset() {
        assert_eq!(stream(options()).state(), StreamState::Initial);

        let handle = ShapeHandle::new("h1").unwrap();
        let resumed = stream(options().resume_from(Offset::new(4, 2), Some(handle)));
        assert_eq!(resumed.state(), StreamState::CatchingUp);
        assert_eq!(resumed.offset(), Offset::new(4, 2));
        assert_eq!(resumed.handle().unwrap().as_str(), "h1");
    }

    #[test]
    fn first_request_has_no_handle() {
        let stream = stream(options().with_param("tenant", "acme"));
        let request = stream.inner.build_request().unwrap();
        assert_eq!(request.param("table"), Some("items"));
        assert_eq!(request.param("tenant"), Some("acme"));
        assert_eq!(request.param("offset"), Some("-1"));
        assert_eq!(request.param("handle"), None);
        assert_eq!(request.param("live"), None);
    }

    #[test]
    fn start_requires_a_runtime() {
        let stream = stream(options());
        assert!(matches!(stream.start(), Err(ShapeError::NoRuntime)));
        assert!(!stream.is_running());
    }

    #[tokio::test]
    async fn run_stops_at_up_to_date_without_live_mode() {
        let stream = stream(options().with_live(false));
        stream.transport().push_response(up_to_date("h1", "0_0"));

        stream.run().await.unwrap();
        assert_eq!(stream.state(), StreamState::Stopped);
        assert_eq!(stream.offset(), Offset::new(0, 0));
        assert!(stream.is_up_to_date());
        assert!(stream.schema().is_some());
        assert!(stream.stats().last_synced_at.is_some());
        assert!(matches!(stream.run().await, Err(ShapeError::Stopped)));
    }

    #[tokio::test]
    async fn live_requests_carry_cursor() {
        let stream = stream(options());
        stream
            .transport()
            .push_response(up_to_date("h1", "0_0").with_header("electric-cursor", "77"));
        stream.start().unwrap();
        assert!(matches!(stream.start(), Err(ShapeError::AlreadyRunning)));

        stream.transport().wait_for_requests(2).await;
        let requests = stream.transport().requests();
        assert_eq!(requests[1].param("live"), Some("true"));
        assert_eq!(requests[1].param("cursor"), Some("77"));
        assert_eq!(requests[1].param("handle"), Some("h1"));
        assert_eq!(stream.state(), StreamState::Live);

        stream.stop();
        stream.join().await;
        assert!(!stream.is_running());
        assert_eq!(stream.state(), StreamState::Stopped);
    }

    fn operation_at(offset: Offset) -> Operation {
        Operation {
            key: "k".into(),
            kind: shapesync_protocol::OperationKind::Insert,
            value: Default::default(),
            offset,
            headers: Default::default(),
        }
    }

    #[test]
    fn operation_offsets_never_decrease() {
        let ops = [Offset::new(5, 0), Offset::new(5, 0), Offset::new(6, 1)].map(operation_at);
        assert!(check_operation_offsets(Offset::new(5, 0), &ops).is_ok());
        assert!(check_operation_offsets(Offset::Initial, &[]).is_ok());

        let backwards = [Offset::new(5, 0), Offset::new(4, 9)].map(operation_at);
        match check_operation_offsets(Offset::Initial, &backwards) {
            Err(ShapeError::OffsetRegression { current, received }) => {
                assert_eq!(current, Offset::new(5, 0));
                assert_eq!(received, Offset::new(4, 9));
            }
            other => panic!("unexpected {other:?}"),
        }

        let below_committed = [operation_at(Offset::new(2, 0))];
        assert!(matches!(
            check_operation_offsets(Offset::new(3, 0), &below_committed),
            Err(ShapeError::OffsetRegression { .. })
        ));
    }

    #[tokio::test]
    async fn offset_regression_is_fatal() {
        let handle = ShapeHandle::new("h1").unwrap();
        let stream = stream(options().resume_from(Offset::new(10, 0), Some(handle)));
        stream.transport().push_response(up_to_date("h1", "9_0"));

        let err = stream.run().await.unwrap_err();
        assert!(matches!(err, ShapeError::OffsetRegression { .. }));
        assert_eq!(stream.state(), StreamState::Errored);
        assert_eq!(stream.offset(), Offset::new(10, 0));
        assert!(stream.stats().last_error.is_some());
    }
}
