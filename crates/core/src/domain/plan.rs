use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use uuid::Uuid;

use super::task::{Task, DEFAULT_MAX_RETRIES, PLANNED_SUBTASK};
use super::workflow::Workflow;
use crate::error::CoreError;

/// A decomposition of one high-level request into subtasks, produced by an
/// external planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: Uuid,
    pub name: String,
    pub request: String,
    pub created_at: DateTime<Utc>,
}

impl ExecutionPlan {
    pub fn new(name: impl Into<String>, request: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            request: request.into(),
            created_at: Utc::now(),
        }
    }

    /// Rejects duplicate subtask ids, self-dependencies and dependencies on
    /// subtasks outside this plan.
    pub fn validate_entries(entries: &[PlanningEntry]) -> Result<(), CoreError> {
        if entries.is_empty() {
            return Err(CoreError::InvalidPlan("plan has no subtasks".to_string()));
        }

        let mut ids = HashSet::new();
        for entry in entries {
            if entry.subtask_id.trim().is_empty() {
                return Err(CoreError::InvalidPlan("empty subtask_id".to_string()));
            }
            if !ids.insert(entry.subtask_id.as_str()) {
                return Err(CoreError::InvalidPlan(format!(
                    "duplicate subtask_id '{}'",
                    entry.subtask_id
                )));
            }
        }

        for entry in entries {
            for dep in &entry.dependencies {
                if dep == &entry.subtask_id {
                    return Err(CoreError::InvalidPlan(format!(
                        "subtask '{}' depends on itself",
                        entry.subtask_id
                    )));
                }
                if !ids.contains(dep.as_str()) {
                    return Err(CoreError::InvalidPlan(format!(
                        "subtask '{}' depends on unknown subtask '{}'",
                        entry.subtask_id, dep
                    )));
                }
            }
            entry.workflow.validate()?;
        }

        Ok(())
    }
}

/// One subtask spec inside an execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanningEntry {
    pub subtask_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub max_retries: Option<u32>,
    pub workflow: Workflow,
    #[serde(default)]
    pub payload: Option<Value>,
}

impl PlanningEntry {
    pub fn new(subtask_id: impl Into<String>, title: impl Into<String>, workflow: Workflow) -> Self {
        Self {
            subtask_id: subtask_id.into(),
            title: title.into(),
            description: String::new(),
            dependencies: Vec::new(),
            priority: 0,
            max_retries: None,
            workflow,
            payload: None,
        }
    }

    pub fn depends_on(mut self, subtask_id: impl Into<String>) -> Self {
        self.dependencies.push(subtask_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Materialises the entry as a queued planned subtask.
    pub fn to_task(&self, plan_id: Uuid) -> Task {
        let reference = SubtaskRef {
            parent_plan_id: plan_id,
            subtask_id: self.subtask_id.clone(),
            dependencies: self.dependencies.clone(),
        };

        let mut payload = match &self.payload {
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                let mut map = serde_json::Map::new();
                map.insert("data".to_string(), other.clone());
                map
            }
            None => serde_json::Map::new(),
        };
        if let Value::Object(fields) = reference.to_value() {
            payload.extend(fields);
        }

        Task::new(self.title.clone(), self.description.clone(), self.workflow.clone())
            .with_task_type(PLANNED_SUBTASK)
            .with_priority(self.priority)
            .with_max_retries(self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES))
            .with_payload(Value::Object(payload))
    }
}

/// Plan membership stored in a planned subtask's payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubtaskRef {
    pub parent_plan_id: Uuid,
    pub subtask_id: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl SubtaskRef {
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "parent_plan_id": self.parent_plan_id,
            "subtask_id": self.subtask_id,
            "dependencies": self.dependencies,
        })
    }
}
