//! Change notifications for logical documents.
//!
//! Every physical record the classifier accepts becomes exactly one
//! `DeltaEvent`. Listeners register on a per-session `Dispatcher` and get
//! a `Subscription` back; dropping it unsubscribes.

use crate::record::{LogicalDocument, PhysicalRecord};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// One logical transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DeltaEvent {
    /// First record ever seen for a logical id, with `logical_id` filled in.
    Create { record: PhysicalRecord },
    /// A known document changed; carries the merged result.
    Update { document: LogicalDocument },
    /// The logical id was tombstoned.
    Delete { id: String },
}

impl DeltaEvent {
    /// Logical id the event is about.
    pub fn logical_id(&self) -> &str {
        match self {
            DeltaEvent::Create { record } => record.resolved_id(),
            DeltaEvent::Update { document } => &document.id,
            DeltaEvent::Delete { id } => id,
        }
    }
}

/// Receiver of logical transitions. All methods default to doing nothing.
pub trait DeltaListener: Send + Sync {
    fn on_create(&self, _record: &PhysicalRecord) {}

    fn on_update(&self, _document: &LogicalDocument) {}

    fn on_delete(&self, _logical_id: &str) {}
}

/// Adapts a closure over `DeltaEvent` into a listener.
struct FnListener<F>(F);

impl<F> DeltaListener for FnListener<F>
where
    F: Fn(&DeltaEvent) + Send + Sync,
{
    fn on_create(&self, record: &PhysicalRecord) {
        (self.0)(&DeltaEvent::Create {
            record: record.clone(),
        });
    }

    fn on_update(&self, document: &LogicalDocument) {
        (self.0)(&DeltaEvent::Update {
            document: document.clone(),
        });
    }

    fn on_delete(&self, logical_id: &str) {
        (self.0)(&DeltaEvent::Delete {
            id: logical_id.to_string(),
        });
    }
}

/// Subscription handle that unsubscribes automatically when dropped.
pub struct Subscription {
    dispatcher: Weak<Dispatcher>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.unsubscribe(self.id);
        }
    }
}

/// Fans events out to registered listeners. Wrap in `Arc` to subscribe.
#[derive(Default)]
pub struct Dispatcher {
    listeners: RwLock<Vec<(usize, Arc<dyn DeltaListener>)>>,
    next_id: AtomicUsize,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Keep the returned `Subscription` alive to stay registered.
    pub fn subscribe(self: &Arc<Self>, listener: Arc<dyn DeltaListener>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, listener));
        Subscription {
            dispatcher: Arc::downgrade(self),
            id,
        }
    }

    /// Register a closure receiving every event.
    pub fn subscribe_fn(
        self: &Arc<Self>,
        callback: impl Fn(&DeltaEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe(Arc::new(FnListener(callback)))
    }

    fn unsubscribe(&self, id: usize) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(i, _)| *i != id);
    }

    /// Drop every listener, e.g. when the owning session is torn down.
    ///
    /// Outstanding `Subscription`s become no-ops. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let removed = listeners.len();
        listeners.clear();
        removed
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Deliver an event to every listener.
    pub fn dispatch(&self, event: &DeltaEvent) {
        // Snapshot; no lock is held while listeners run
        let listeners: Vec<_> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in listeners {
            match event {
                DeltaEvent::Create { record } => listener.on_create(record),
                DeltaEvent::Update { document } => listener.on_update(document),
                DeltaEvent::Delete { id } => listener.on_delete(id),
            }
        }
    }
}
