//! Event bus: durable append, synchronous handler fan-out and a tokio
//! broadcast stream for async consumers

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::warn;

use crate::store::{EventError, EventStore, MemoryEventStore};
use crate::types::{type_matches, Event, EventQuery, LifecycleEvent, NewEvent};

/// Capacity for the broadcast channel
const DEFAULT_CAPACITY: usize = 1000;

/// In-process subscriber callback. Runs inside `publish`, so it must be quick.
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    pattern: String,
    handler: EventHandler,
}

/// Event bus for publishing, subscribing to and querying lifecycle events
#[derive(Clone)]
pub struct EventBus {
    store: Arc<dyn EventStore>,
    sender: broadcast::Sender<Event>,
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
    next_subscription: Arc<AtomicU64>,
    /// Number of events published (for monitoring)
    event_count: Arc<AtomicUsize>,
}

impl EventBus {
    /// Create a bus backed by the given store
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self::with_capacity(store, DEFAULT_CAPACITY)
    }

    /// Create a bus that only keeps events in memory
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryEventStore::new()))
    }

    pub fn with_capacity(store: Arc<dyn EventStore>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            store,
            sender,
            subscriptions: Arc::new(RwLock::new(Vec::new())),
            next_subscription: Arc::new(AtomicU64::new(1)),
            event_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Persist an event, then notify subscribers.
    ///
    /// Returns the store-assigned event id. The event is durable before any
    /// handler runs; a panicking handler is logged and skipped.
    pub async fn publish(&self, event: NewEvent) -> Result<i64, EventError> {
        let stored = self.store.append(event).await?;
        self.event_count.fetch_add(1, Ordering::Relaxed);

        self.deliver(&stored);
        // No receivers is not an error
        let _ = self.sender.send(stored.clone());

        Ok(stored.event_id)
    }

    /// Publish a lifecycle event on behalf of `source`
    pub async fn emit(
        &self,
        source: &str,
        event: LifecycleEvent,
    ) -> Result<i64, EventError> {
        self.publish(event.into_new_event(source)).await
    }

    /// Register a handler for an event type, a `prefix.*` pattern or `*`
    pub fn subscribe<F>(&self, pattern: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let subscription = Subscription {
            id,
            pattern: pattern.into(),
            handler: Arc::new(handler),
        };

        match self.subscriptions.write() {
            Ok(mut subs) => subs.push(subscription),
            Err(poisoned) => poisoned.into_inner().push(subscription),
        }
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = match self.subscriptions.write() {
            Ok(subs) => subs,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Receiver for every event published after this call
    pub fn stream(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub async fn query(&self, query: &EventQuery) -> Result<Vec<Event>, EventError> {
        self.store.query(query).await
    }

    /// Get the number of registered handlers
    pub fn subscriber_count(&self) -> usize {
        match self.subscriptions.read() {
            Ok(subs) => subs.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Get the total number of events published through this bus
    pub fn event_count(&self) -> usize {
        self.event_count.load(Ordering::Relaxed)
    }

    fn deliver(&self, event: &Event) {
        // Handlers run without the lock held so they may subscribe themselves.
        let handlers: Vec<EventHandler> = {
            let subs = match self.subscriptions.read() {
                Ok(subs) => subs,
                Err(poisoned) => poisoned.into_inner(),
            };
            subs.iter()
                .filter(|s| type_matches(&s.pattern, &event.event_type))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                warn!(
                    event_id = event.event_id,
                    event_type = %event.event_type,
                    "Event subscriber panicked"
                );
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .field("event_count", &self.event_count())
            .finish()
    }
}
