use hive_core::CoreError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DbError {
    /// Connection loss, pool exhaustion or a busy database. Retryable.
    #[error("Store unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),

    #[error("Database error: {0}")]
    Sqlx(#[source] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    #[error("Plan not found: {0}")]
    PlanNotFound(Uuid),

    /// The requested change conflicts with the task's workflow or current
    /// state. Not retryable.
    #[error("Invalid transition for task {task_id}: {reason}")]
    InvalidTransition { task_id: Uuid, reason: String },

    #[error(transparent)]
    Validation(#[from] CoreError),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DbError {
    pub fn invalid_transition(task_id: Uuid, reason: impl Into<String>) -> Self {
        Self::InvalidTransition {
            task_id,
            reason: reason.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

// SQLITE_BUSY, SQLITE_LOCKED and their extended codes
const TRANSIENT_SQLITE_CODES: &[&str] = &["5", "6", "261", "262", "517"];

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        let transient = match &err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Io(_) => true,
            sqlx::Error::Database(db_err) => db_err
                .code()
                .map(|code| TRANSIENT_SQLITE_CODES.contains(&code.as_ref()))
                .unwrap_or(false),
            _ => false,
        };

        if transient {
            Self::Unavailable(err)
        } else {
            Self::Sqlx(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_timeout_is_retryable() {
        let err = DbError::from(sqlx::Error::PoolTimedOut);
        assert!(err.is_retryable());
        assert!(err.to_string().starts_with("Store unavailable"));
    }

    #[test]
    fn test_row_not_found_is_not_retryable() {
        let err = DbError::from(sqlx::Error::RowNotFound);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_invalid_transition_is_not_retryable() {
        let err = DbError::invalid_transition(Uuid::new_v4(), "unknown phase 'deploy'");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("deploy"));
    }
}
