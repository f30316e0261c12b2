mod event;
mod plan;
mod run;
mod task;

pub use event::EventRow;
pub use plan::{PlanRow, PlanningQueueRow};
pub use run::RunRow;
pub use task::TaskRow;

pub(crate) use run::RUN_COLUMNS;
pub(crate) use task::TASK_COLUMNS;

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use crate::error::DbError;

pub(crate) fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

pub(crate) fn datetime_to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn parse_uuid(column: &str, value: &str) -> Result<Uuid, DbError> {
    Uuid::parse_str(value).map_err(|e| DbError::Corrupt(format!("{}='{}': {}", column, value, e)))
}
