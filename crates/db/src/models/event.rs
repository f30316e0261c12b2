use events::Event;

use super::millis_to_datetime;
use crate::error::DbError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRow {
    pub event_id: i64,
    pub event_type: String,
    pub source: String,
    pub correlation_id: Option<String>,
    pub payload: String,
    pub timestamp: i64,
}

impl EventRow {
    pub fn into_domain(self) -> Result<Event, DbError> {
        Ok(Event {
            event_id: self.event_id,
            event_type: self.event_type,
            source: self.source,
            correlation_id: self.correlation_id,
            payload: serde_json::from_str(&self.payload)?,
            timestamp: millis_to_datetime(self.timestamp),
        })
    }
}
