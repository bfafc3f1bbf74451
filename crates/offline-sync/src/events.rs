//! Event infrastructure for offline-sync.
//!
//! Provides the process-wide channels the engine publishes on:
//! - `StorageEvent` for storage problems a UI layer should surface
//! - `SessionActivity` for attributing updates to editing sessions
//!
//! Both travel over the same `EventBus<E>`, wrapped in `Arc` so that
//! `Subscription` handles can unsubscribe when dropped.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Kind of storage problem reported on the event channel.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StorageEventKind {
    /// A write could not be persisted anywhere.
    WriteFailure,
    /// An update was discarded and cannot be recovered.
    DataLoss,
    /// The queue hit a cap and evicted older operations.
    OfflineOverflow,
    /// Usage crossed the low or critical threshold.
    StorageLow,
    /// A persisted entry failed to decode and was dropped.
    IntegrityError,
}

/// Storage event published for consumption by a UI layer.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageEvent {
    #[serde(rename = "type")]
    pub kind: StorageEventKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl StorageEvent {
    pub fn new(kind: StorageEventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Where a session activity signal originated.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ActivitySource {
    /// A local edit in this process.
    LocalEdit,
    /// An update received from the remote authority.
    RemoteUpdate,
    /// The orchestrator attempted to send a queued operation.
    SyncAttempt,
}

/// Broadcast whenever a session is observed doing something.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionActivity {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub source: ActivitySource,
}

type Callback<E> = Arc<dyn Fn(E) + Send + Sync>;

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription<E: Clone + Send + 'static> {
    bus: Weak<EventBus<E>>,
    id: usize,
}

impl<E: Clone + Send + 'static> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Event bus for publishing events to subscribers.
///
/// Thread-safe for use in multi-threaded Tokio runtime.
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus<E: Clone + Send + 'static> {
    callbacks: RwLock<Vec<(usize, Callback<E>)>>,
    next_id: AtomicUsize,
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    ///
    /// Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(self: &Arc<Self>, callback: impl Fn(E) + Send + Sync + 'static) -> Subscription<E> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds the read lock.
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: E) {
        // Clone the callback list so a callback may subscribe without deadlocking.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}

/// Collects every event emitted on a bus. Handy for tests and diagnostics.
pub struct EventLog<E: Clone + Send + 'static> {
    events: Arc<std::sync::Mutex<Vec<E>>>,
    _subscription: Subscription<E>,
}

impl<E: Clone + Send + 'static> EventLog<E> {
    pub fn attach(bus: &Arc<EventBus<E>>) -> Self {
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let subscription = bus.subscribe(move |event| {
            sink.lock().unwrap_or_else(|e| e.into_inner()).push(event);
        });
        Self {
            events,
            _subscription: subscription,
        }
    }

    pub fn events(&self) -> Vec<E> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
