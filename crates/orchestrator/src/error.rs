use thiserror::Error;

use crate::task_manager::TaskError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Database error: {0}")]
    Database(#[from] db::DbError),

    #[error("Event bus error: {0}")]
    Events(#[from] events::EventError),

    #[error(transparent)]
    Workflow(#[from] hive_core::CoreError),

    #[error("Task manager error: {0}")]
    TaskManager(#[from] TaskError),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    pub fn worker(message: impl Into<String>) -> Self {
        Self::Worker(message.into())
    }

    /// Whether the operation may succeed if simply tried again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(err) => err.is_retryable(),
            Self::Events(events::EventError::Unavailable(_)) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
