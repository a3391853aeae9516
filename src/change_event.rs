//! Change events emitted after every mutation, for downstream indexing.
//!
//! The store only promises one `{operation, body}` record per mutation; how
//! it travels to the indexer is up to the sink.

use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::sync::Mutex;

use log::{info, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Save,
    Update,
    Delete,
}

impl Display for ChangeOperation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeOperation::Save => write!(f, "SAVE"),
            ChangeOperation::Update => write!(f, "UPDATE"),
            ChangeOperation::Delete => write!(f, "DELETE"),
        }
    }
}

/// `{"operation": "SAVE", "body": "<document JSON text>"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub operation: ChangeOperation,
    pub body: String,
}

impl ChangeEvent {
    pub fn new(operation: ChangeOperation, document: &serde_json::Value) -> Self {
        Self {
            operation,
            body: document.to_string(),
        }
    }
}

pub trait ChangeEventSink: Send + Sync {
    fn publish(&self, event: ChangeEvent);
}

/// Holds events in memory until the host drains them.
#[derive(Debug, Default)]
pub struct QueuedEventSink {
    queue: Mutex<VecDeque<ChangeEvent>>,
}

impl QueuedEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns every pending event, oldest first.
    pub fn drain(&self) -> Vec<ChangeEvent> {
        match self.queue.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        }
    }

    pub fn pending(&self) -> usize {
        match self.queue.lock() {
            Ok(queue) => queue.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

impl ChangeEventSink for QueuedEventSink {
    fn publish(&self, event: ChangeEvent) {
        match self.queue.lock() {
            Ok(mut queue) => queue.push_back(event),
            Err(poisoned) => {
                warn!("Event queue lock poisoned; recovering");
                poisoned.into_inner().push_back(event);
            }
        }
    }
}

/// Writes each event to the `log` facade and drops it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventSink;

impl ChangeEventSink for LogEventSink {
    fn publish(&self, event: ChangeEvent) {
        info!("{} event: {}", event.operation, event.body);
    }
}
