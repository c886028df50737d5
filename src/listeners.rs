//! Listener registry and event publishing
//!
//! The registry keeps listeners in registration order per event kind. Adding
//! the first `Data` listener and removing the last one are reported back to
//! the caller as [`Transition`]s; those edges are what start and stop the
//! read loop.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use hidstream_transport::Report;
use parking_lot::Mutex;
use tracing::warn;

use crate::error::HidError;

/// Kinds of events an adapter publishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// An input report was read
    Data,
    /// The read loop failed and has stopped
    Error,
}

/// An event delivered to listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HidEvent {
    Data(Report),
    Error(HidError),
}

impl HidEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            HidEvent::Data(_) => EventKind::Data,
            HidEvent::Error(_) => EventKind::Error,
        }
    }
}

/// A registered event callback
pub type Listener = Arc<dyn Fn(&HidEvent) + Send + Sync>;

/// Handle returned when registering a listener, used to remove it again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Change in the number of `Data` listeners caused by an add or remove
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Count went from 0 to 1
    FirstData,
    /// Count went from 1 to 0
    LastData,
    Unchanged,
}

struct Entry {
    id: ListenerId,
    kind: EventKind,
    listener: Listener,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    entries: Vec<Entry>,
}

/// Tracks subscribed listeners for one adapter
#[derive(Default)]
pub struct ListenerRegistry {
    inner: Mutex<RegistryInner>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener
    pub fn add(&self, kind: EventKind, listener: Listener) -> (ListenerId, Transition) {
        let mut inner = self.inner.lock();
        let id = ListenerId(inner.next_id);
        inner.next_id += 1;

        let was_empty = kind == EventKind::Data && !inner.has(EventKind::Data);
        inner.entries.push(Entry { id, kind, listener });

        let transition = if was_empty {
            Transition::FirstData
        } else {
            Transition::Unchanged
        };
        (id, transition)
    }

    /// Unregister a listener. Unknown IDs are ignored.
    pub fn remove(&self, id: ListenerId) -> Transition {
        let mut inner = self.inner.lock();
        let Some(pos) = inner.entries.iter().position(|e| e.id == id) else {
            return Transition::Unchanged;
        };
        let entry = inner.entries.remove(pos);

        if entry.kind == EventKind::Data && !inner.has(EventKind::Data) {
            Transition::LastData
        } else {
            Transition::Unchanged
        }
    }

    /// Drop every listener, returning how many were registered
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let n = inner.entries.len();
        inner.entries.clear();
        n
    }

    /// Number of listeners for `kind`
    pub fn count(&self, kind: EventKind) -> usize {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    /// Listeners for `kind` in registration order
    fn snapshot(&self, kind: EventKind) -> Vec<Listener> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| Arc::clone(&e.listener))
            .collect()
    }

    /// Call every listener for the event's kind
    ///
    /// The listener list is copied first so listeners may add, remove or
    /// close from inside their callback. `cancelled` is checked before each
    /// call; once it returns true no further listener sees the event.
    /// Returns the messages of listeners that panicked.
    fn call(&self, event: &HidEvent, cancelled: &dyn Fn() -> bool) -> Vec<String> {
        let mut panics = Vec::new();
        for listener in self.snapshot(event.kind()) {
            if cancelled() {
                break;
            }
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener(event))) {
                panics.push(panic_message(payload.as_ref()));
            }
        }
        panics
    }

    /// Publish an event, turning listener panics into `Error` events
    pub fn publish(&self, event: &HidEvent, cancelled: &dyn Fn() -> bool) {
        for message in self.call(event, cancelled) {
            warn!("{:?} listener panicked: {}", event.kind(), message);
            if event.kind() == EventKind::Data {
                let error = HidEvent::Error(HidError::ListenerPanicked(message));
                for nested in self.call(&error, cancelled) {
                    warn!("Error listener panicked: {}", nested);
                }
            }
        }
    }
}

impl RegistryInner {
    fn has(&self, kind: EventKind) -> bool {
        self.entries.iter().any(|e| e.kind == kind)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
