//! In-memory materialization of a shape.

use crate::feed::{ShapeEvent, SubscriberId};
use crate::stream::ShapeStream;
use crate::transport::ShapeTransport;
use parking_lot::RwLock;
use shapesync_protocol::{Offset, Operation, OperationKind, Row};
use std::collections::BTreeMap;
use std::sync::Arc;

/// The current rows of a shape, keyed by message key.
///
/// Applying a stream's events in delivery order keeps it equal to the
/// server-side shape as of [`synced_offset`](Shape::synced_offset).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Shape {
    rows: BTreeMap<String, Row>,
    synced_offset: Option<Offset>,
}

impl Shape {
    /// Creates an empty shape.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes a shared shape to `stream`.
    pub fn follow<T: ShapeTransport + 'static>(
        stream: &ShapeStream<T>,
    ) -> (Arc<RwLock<Shape>>, SubscriberId) {
        let shape = Arc::new(RwLock::new(Shape::new()));
        let target = Arc::clone(&shape);
        let id = stream.subscribe(move |event| target.write().apply_event(event));
        (shape, id)
    }

    /// Applies one stream event.
    pub fn apply_event(&mut self, event: &ShapeEvent) {
        match event {
            ShapeEvent::Operations(operations) => {
                for operation in operations {
                    self.apply(operation);
                }
            }
            ShapeEvent::UpToDate { offset } => self.synced_offset = Some(*offset),
            ShapeEvent::Reset => self.clear(),
            ShapeEvent::Error(_) | ShapeEvent::Stopped => {}
        }
    }

    /// Applies one row operation.
    pub fn apply(&mut self, operation: &Operation) {
        match operation.kind {
            OperationKind::Insert => {
                self.rows
                    .insert(operation.key.clone(), operation.value.clone());
            }
            OperationKind::Update => {
                let row = self.rows.entry(operation.key.clone()).or_default();
                for (column, value) in &operation.value {
                    row.insert(column.clone(), value.clone());
                }
            }
            OperationKind::Delete => {
                self.rows.remove(&operation.key);
            }
        }
    }

    /// Drops every row.
    pub fn clear(&mut self) {
        self.rows.clear();
        self.synced_offset = None;
    }

    /// Looks up a row by key.
    pub fn get(&self, key: &str) -> Option<&Row> {
        self.rows.get(key)
    }

    /// All rows, ordered by key.
    pub fn rows(&self) -> &BTreeMap<String, Row> {
        &self.rows
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the shape has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Offset of the last up-to-date boundary applied.
    pub fn synced_offset(&self) -> Option<Offset> {
        self.synced_offset
    }
}
