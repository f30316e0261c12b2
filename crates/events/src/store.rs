//! Durable side of the event bus

use async_trait::async_trait;
use std::sync::Mutex;
use thiserror::Error;

use crate::types::{Event, EventQuery, NewEvent};

#[derive(Debug, Error)]
pub enum EventError {
    /// Transient; the caller may retry the publish.
    #[error("Event store unavailable: {0}")]
    Unavailable(String),

    #[error("Event store error: {0}")]
    Store(String),
}

/// Append-only event log. Implementations assign `event_id`.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, event: NewEvent) -> Result<Event, EventError>;

    /// Matches in ascending `event_id` order. With a limit, only the most
    /// recent matches are returned.
    async fn query(&self, query: &EventQuery) -> Result<Vec<Event>, EventError>;
}

/// In-process event log, used when no database is configured and in tests.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|events| events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, event: NewEvent) -> Result<Event, EventError> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| EventError::Store("event log lock poisoned".to_string()))?;
        let event_id = events.last().map_or(1, |last| last.event_id + 1);
        let stored = event.into_event(event_id);
        events.push(stored.clone());
        Ok(stored)
    }

    async fn query(&self, query: &EventQuery) -> Result<Vec<Event>, EventError> {
        let events = self
            .events
            .lock()
            .map_err(|_| EventError::Store("event log lock poisoned".to_string()))?;
        let matching: Vec<Event> = events.iter().filter(|e| query.matches(e)).cloned().collect();

        Ok(match query.limit {
            Some(limit) if matching.len() > limit => matching[matching.len() - limit..].to_vec(),
            _ => matching,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let store = MemoryEventStore::new();
        let first = store.append(NewEvent::new("a", "test")).await.unwrap();
        let second = store.append(NewEvent::new("b", "test")).await.unwrap();

        assert_eq!(first.event_id, 1);
        assert_eq!(second.event_id, 2);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_query_limit_keeps_latest() {
        let store = MemoryEventStore::new();
        for i in 0..5 {
            store
                .append(NewEvent::new("task.created", "test").with_correlation_id(format!("t{}", i)))
                .await
                .unwrap();
        }
        store.append(NewEvent::new("run.finished", "test")).await.unwrap();

        let latest = store
            .query(&EventQuery::new().event_type("task.*").limit(2))
            .await
            .unwrap();
        let ids: Vec<i64> = latest.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![4, 5]);
    }
}
