use hive_core::{Task, TaskStatus, Workflow};

use super::{datetime_to_millis, millis_to_datetime, parse_uuid};
use crate::error::DbError;

pub(crate) const TASK_COLUMNS: &str = "id, title, description, task_type, status, current_phase, \
     workflow, payload, priority, max_retries, retry_count, assignee, failure_reason, \
     created_at, updated_at";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskRow {
    pub id: String,
    pub title: String,
    pub description: String,
    pub task_type: String,
    pub status: String,
    pub current_phase: Option<String>,
    pub workflow: String,
    pub payload: String,
    pub priority: i64,
    pub max_retries: i64,
    pub retry_count: i64,
    pub assignee: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TaskRow {
    pub fn into_domain(self) -> Result<Task, DbError> {
        let status = TaskStatus::parse(&self.status)
            .ok_or_else(|| DbError::Corrupt(format!("unknown task status '{}'", self.status)))?;
        let workflow: Workflow = serde_json::from_str(&self.workflow)?;

        Ok(Task {
            id: parse_uuid("tasks.id", &self.id)?,
            title: self.title,
            description: self.description,
            task_type: self.task_type,
            status,
            current_phase: self.current_phase,
            workflow,
            payload: serde_json::from_str(&self.payload)?,
            priority: self.priority,
            max_retries: u32::try_from(self.max_retries).unwrap_or(0),
            retry_count: u32::try_from(self.retry_count).unwrap_or(0),
            assignee: self.assignee,
            failure_reason: self.failure_reason,
            created_at: millis_to_datetime(self.created_at),
            updated_at: millis_to_datetime(self.updated_at),
        })
    }

    pub fn from_domain(task: &Task) -> Result<Self, DbError> {
        Ok(Self {
            id: task.id.to_string(),
            title: task.title.clone(),
            description: task.description.clone(),
            task_type: task.task_type.clone(),
            status: task.status.as_str().to_string(),
            current_phase: task.current_phase.clone(),
            workflow: serde_json::to_string(&task.workflow)?,
            payload: serde_json::to_string(&task.payload)?,
            priority: task.priority,
            max_retries: i64::from(task.max_retries),
            retry_count: i64::from(task.retry_count),
            assignee: task.assignee.clone(),
            failure_reason: task.failure_reason.clone(),
            created_at: datetime_to_millis(task.created_at),
            updated_at: datetime_to_millis(task.updated_at),
        })
    }
}
