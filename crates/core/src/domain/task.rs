use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::plan::SubtaskRef;
use super::workflow::{Workflow, START_PHASE};
use crate::error::CoreError;

/// `task_type` reserved for tasks materialised from an execution plan.
pub const PLANNED_SUBTASK: &str = "planned_subtask";

pub const DEFAULT_TASK_TYPE: &str = "task";
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Queued,
    InProgress,
    ReviewPending,
    Escalated,
    Approved,
    Rejected,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::ReviewPending => "review_pending",
            Self::Escalated => "escalated",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "in_progress" => Some(Self::InProgress),
            "review_pending" => Some(Self::ReviewPending),
            "escalated" => Some(Self::Escalated),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// `completed` and `failed` have no phase and are never dispatched again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Statuses owned by an external actor until the task is re-queued.
    pub fn is_parking(&self) -> bool {
        matches!(
            self,
            Self::ReviewPending | Self::Escalated | Self::Approved | Self::Rejected
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub task_type: String,
    pub status: TaskStatus,
    /// `None` once the task is `completed` or `failed`.
    pub current_phase: Option<String>,
    pub workflow: Workflow,
    pub payload: Value,
    pub priority: i64,
    pub max_retries: u32,
    pub retry_count: u32,
    pub assignee: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(title: impl Into<String>, description: impl Into<String>, workflow: Workflow) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: description.into(),
            task_type: DEFAULT_TASK_TYPE.to_string(),
            status: TaskStatus::default(),
            current_phase: Some(START_PHASE.to_string()),
            workflow,
            payload: Value::Object(Default::default()),
            priority: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_count: 0,
            assignee: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = task_type.into();
        self
    }

    pub fn with_assignee(mut self, assignee: impl Into<String>) -> Self {
        self.assignee = Some(assignee.into());
        self
    }

    pub fn starting_at(mut self, phase: impl Into<String>) -> Self {
        self.current_phase = Some(phase.into());
        self
    }

    pub fn is_planned_subtask(&self) -> bool {
        self.task_type == PLANNED_SUBTASK
    }

    /// Plan membership carried in the payload of planned subtasks.
    pub fn subtask_ref(&self) -> Option<SubtaskRef> {
        if !self.is_planned_subtask() {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }

    /// Fails fast on malformed workflows before the task is stored.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.title.trim().is_empty() {
            return Err(CoreError::Validation("task title must not be empty".to_string()));
        }

        self.workflow.validate()?;

        match (&self.current_phase, self.status.is_terminal()) {
            (Some(phase), false) if !self.workflow.contains(phase) => {
                Err(CoreError::UnknownPhase(phase.clone()))
            }
            (None, false) => Err(CoreError::Validation(format!(
                "non-terminal task in status '{}' has no current phase",
                self.status
            ))),
            _ => Ok(()),
        }
    }
}

/// Task description accepted from external producers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub task_type: Option<String>,
    pub workflow: Workflow,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub starting_phase: Option<String>,
}

impl CreateTaskRequest {
    pub fn into_task(self) -> Result<Task, CoreError> {
        let mut task = Task::new(self.title, self.description, self.workflow)
            .with_priority(self.priority)
            .with_max_retries(self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES));

        if let Some(task_type) = self.task_type {
            if task_type == PLANNED_SUBTASK {
                return Err(CoreError::Validation(
                    "planned subtasks are created through plan ingestion".to_string(),
                ));
            }
            task.task_type = task_type;
        }
        if let Some(payload) = self.payload {
            task.payload = payload;
        }
        task.assignee = self.assignee;
        if let Some(phase) = self.starting_phase {
            task.current_phase = Some(phase);
        }

        task.validate()?;
        Ok(task)
    }
}

/// Partial update of a task. Fields left as `None` are untouched.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpdateTaskRequest {
    pub status: Option<TaskStatus>,
    pub current_phase: Option<String>,
    /// RFC 7396 merge patch applied to the payload.
    pub payload_patch: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PhaseSpec;
    use serde_json::json;

    fn simple_workflow() -> Workflow {
        Workflow::new()
            .with_phase(START_PHASE, PhaseSpec::new("work"))
            .with_phase("work", PhaseSpec::new("completed").with_command("echo {task_id}"))
    }

    #[test]
    fn test_task_creation() {
        let task = Task::new("Test Task", "Test Description", simple_workflow());

        assert_eq!(task.title, "Test Task");
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.current_phase.as_deref(), Some(START_PHASE));
        assert_eq!(task.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(task.retry_count, 0);
        assert!(!task.is_planned_subtask());
        assert!(task.validate().is_ok());
    }

    #[test]
    fn test_task_status_round_trip_names() {
        assert_eq!(TaskStatus::ReviewPending.as_str(), "review_pending");
        assert_eq!(TaskStatus::parse("in_progress"), Some(TaskStatus::InProgress));
        assert_eq!(TaskStatus::parse("done"), None);
        assert!(TaskStatus::Completed.is_terminal());
        assert!(!TaskStatus::Rejected.is_terminal());
        assert!(TaskStatus::Escalated.is_parking());
    }

    #[test]
    fn test_validate_rejects_unknown_starting_phase() {
        let task = Task::new("t", "", simple_workflow()).starting_at("deploy");
        assert_eq!(
            task.validate().unwrap_err(),
            CoreError::UnknownPhase("deploy".to_string())
        );
    }

    #[test]
    fn test_validate_rejects_missing_start() {
        let workflow = Workflow::new().with_phase("work", PhaseSpec::new("completed"));
        assert!(Task::new("t", "", workflow.clone()).validate().is_err());
        assert!(Task::new("t", "", workflow).starting_at("work").validate().is_ok());
    }

    #[test]
    fn test_create_request_into_task() {
        let request: CreateTaskRequest = serde_json::from_value(json!({
            "title": "Build",
            "workflow": {
                "start": {"next_success": "work"},
                "work": {"cmd": "make", "next_success": "completed"}
            },
            "priority": 5,
            "max_retries": 1,
            "payload": {"target": "x86_64"}
        }))
        .unwrap();

        let task = request.into_task().unwrap();
        assert_eq!(task.priority, 5);
        assert_eq!(task.max_retries, 1);
        assert_eq!(task.payload["target"], "x86_64");
        assert_eq!(task.task_type, DEFAULT_TASK_TYPE);
    }

    #[test]
    fn test_create_request_rejects_planned_subtask_type() {
        let request = CreateTaskRequest {
            title: "x".to_string(),
            description: String::new(),
            task_type: Some(PLANNED_SUBTASK.to_string()),
            workflow: simple_workflow(),
            payload: None,
            priority: 0,
            max_retries: None,
            assignee: None,
            starting_phase: None,
        };
        assert!(request.into_task().is_err());
    }
}
