//! Data events and listener registrations.
//!
//! Views compute events by diffing their previous and new event caches;
//! the engine pairs each event with the callbacks of the registrations that
//! should observe it, and the repo raises them after releasing its lock so
//! a callback may freely re-enter the engine.

use crate::error::SyncError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tidedb_core::{Node, QuerySpec};

/// The kinds of change a listener can observe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataEventType {
    /// A child appeared in the query window.
    ChildAdded,
    /// A child left the query window.
    ChildRemoved,
    /// A child's value changed in place.
    ChildChanged,
    /// A child's position under the ordering index changed.
    ChildMoved,
    /// The whole queried value settled after a batch of child changes.
    Value,
}

/// One observable change at a query.
#[derive(Clone, Debug)]
pub struct DataEvent {
    /// What changed.
    pub kind: DataEventType,
    /// The query this event belongs to.
    pub query: QuerySpec,
    /// The child key, for child-scoped events.
    pub child_key: Option<String>,
    /// The new value (child value, or the whole node for `Value`).
    pub node: Node,
    /// The previous value, for `ChildChanged`.
    pub old_node: Option<Node>,
    /// The key sorting immediately before this child, for ordering.
    pub prev_child_key: Option<String>,
}

/// Callback invoked for every event a registration observes.
pub type EventCallback = Arc<dyn Fn(&DataEvent) + Send + Sync>;

/// Callback invoked when a listen is revoked or the engine shuts down.
pub type CancelCallback = Arc<dyn Fn(&SyncError) + Send + Sync>;

static NEXT_REGISTRATION_ID: AtomicU64 = AtomicU64::new(1);

/// A listener attached to one query's view.
#[derive(Clone)]
pub struct EventRegistration {
    /// Unique id, used to remove this registration later.
    pub id: u64,
    /// Receives data events.
    pub on_event: EventCallback,
    /// Receives the terminal cancellation, if any.
    pub on_cancel: CancelCallback,
}

impl EventRegistration {
    /// Creates a registration with a fresh id.
    pub fn new(on_event: EventCallback, on_cancel: CancelCallback) -> Self {
        Self {
            id: NEXT_REGISTRATION_ID.fetch_add(1, Ordering::Relaxed),
            on_event,
            on_cancel,
        }
    }

    /// A registration that ignores everything; used to hold data synced.
    pub fn silent() -> Self {
        Self::new(Arc::new(|_event| {}), Arc::new(|_error| {}))
    }
}

impl std::fmt::Debug for EventRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistration")
            .field("id", &self.id)
            .finish()
    }
}

/// An event paired with the callback that should receive it.
pub struct RaisedEvent {
    /// The callback to invoke.
    pub callback: EventCallback,
    /// The event payload.
    pub event: DataEvent,
}

/// A cancellation paired with its callback.
pub struct RaisedCancel {
    /// The callback to invoke.
    pub callback: CancelCallback,
    /// Why the listen ended.
    pub error: SyncError,
}

impl std::fmt::Debug for RaisedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaisedEvent").field("event", &self.event).finish()
    }
}

/// Delivers raised events to their callbacks, outside any engine lock.
pub fn raise_events(events: Vec<RaisedEvent>) {
    for raised in events {
        (raised.callback)(&raised.event);
    }
}

/// Delivers cancellations to their callbacks, outside any engine lock.
pub fn raise_cancels(cancels: Vec<RaisedCancel>) {
    for raised in cancels {
        (raised.callback)(&raised.error);
    }
}
