//! Subscriber fan-out for shape events.
//!
//! Callbacks run synchronously on the fetch loop, in subscription order, so
//! every subscriber has seen a batch before the stream advances past it.
//! There is no replay buffer: a subscriber only sees events emitted after
//! it subscribed.
//!
//! Delivery goes through a gate. Once the gate is closed (the stream was
//! stopped) nothing is delivered except the single closing event. The gate
//! is re-entrant, so a callback may stop the stream it is subscribed to.

use crate::error::ShapeError;
use parking_lot::{ReentrantMutex, RwLock};
use shapesync_protocol::{Offset, Operation};
use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver};

/// An event delivered to subscribers.
#[derive(Debug, Clone)]
pub enum ShapeEvent {
    /// A batch of row operations, in log order.
    Operations(Vec<Operation>),
    /// Every operation up to `offset` has been delivered.
    UpToDate {
        /// The synced log position.
        offset: Offset,
    },
    /// The shape was invalidated; any local copy must be discarded.
    Reset,
    /// The stream failed and stopped fetching.
    Error(Arc<ShapeError>),
    /// The stream was stopped. Always the last event.
    Stopped,
}

impl ShapeEvent {
    /// Short name, for logs and text output.
    pub fn name(&self) -> &'static str {
        match self {
            ShapeEvent::Operations(_) => "operations",
            ShapeEvent::UpToDate { .. } => "up-to-date",
            ShapeEvent::Reset => "reset",
            ShapeEvent::Error(_) => "error",
            ShapeEvent::Stopped => "stopped",
        }
    }
}

/// Identifies a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscriber-{}", self.0)
    }
}

type Callback = Arc<dyn Fn(&ShapeEvent) + Send + Sync>;

/// The set of subscribers of one stream.
pub(crate) struct Subscribers {
    next_id: AtomicU64,
    callbacks: RwLock<Vec<(SubscriberId, Callback)>>,
    /// Holds `true` while delivery is allowed.
    gate: ReentrantMutex<Cell<bool>>,
}

impl Subscribers {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            callbacks: RwLock::new(Vec::new()),
            gate: ReentrantMutex::new(Cell::new(true)),
        }
    }

    pub(crate) fn subscribe<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(&ShapeEvent) + Send + Sync + 'static,
    {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks.write().push((id, Arc::new(callback)));
        id
    }

    pub(crate) fn subscribe_channel(&self) -> (SubscriberId, UnboundedReceiver<ShapeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(move |event| {
            // A dropped receiver just stops listening.
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }

    /// Returns false if the subscriber was not registered.
    pub(crate) fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut callbacks = self.callbacks.write();
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        callbacks.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.callbacks.read().len()
    }

    /// Delivers an event to every subscriber. Returns false if the gate was
    /// already closed.
    pub(crate) fn notify(&self, event: &ShapeEvent) -> bool {
        let gate = self.gate.lock();
        if !gate.get() {
            return false;
        }
        // The list is copied so callbacks may (un)subscribe.
        let callbacks: Vec<Callback> = self
            .callbacks
            .read()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            // A callback may have closed the gate.
            if !gate.get() {
                break;
            }
            callback(event);
        }
        true
    }

    /// Closes the gate and delivers `last` as the final event. Returns false,
    /// delivering nothing, if the gate was already closed.
    pub(crate) fn close_with(&self, last: &ShapeEvent) -> bool {
        let gate = self.gate.lock();
        if !gate.replace(false) {
            return false;
        }
        let callbacks: Vec<Callback> = self
            .callbacks
            .read()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(last);
        }
        true
    }
}
