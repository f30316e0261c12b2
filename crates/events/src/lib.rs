//! Event system for hive
//!
//! Lifecycle events are appended to a durable [`EventStore`] first and then
//! delivered to in-process subscribers. Persisted events survive subscriber
//! crashes; delivery is best effort.

mod bus;
mod store;
mod types;

pub use bus::{EventBus, EventHandler, SubscriptionId};
pub use store::{EventError, EventStore, MemoryEventStore};
pub use types::*;
