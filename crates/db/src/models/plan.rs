use hive_core::ExecutionPlan;
use uuid::Uuid;

use super::{datetime_to_millis, millis_to_datetime, parse_uuid};
use crate::error::DbError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PlanRow {
    pub id: String,
    pub name: String,
    pub request: String,
    pub created_at: i64,
}

impl PlanRow {
    pub fn into_domain(self) -> Result<ExecutionPlan, DbError> {
        Ok(ExecutionPlan {
            id: parse_uuid("execution_plans.id", &self.id)?,
            name: self.name,
            request: self.request,
            created_at: millis_to_datetime(self.created_at),
        })
    }
}

impl From<&ExecutionPlan> for PlanRow {
    fn from(plan: &ExecutionPlan) -> Self {
        Self {
            id: plan.id.to_string(),
            name: plan.name.clone(),
            request: plan.request.clone(),
            created_at: datetime_to_millis(plan.created_at),
        }
    }
}

/// One row of the planning queue: which task a plan's subtask became.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PlanningQueueRow {
    pub plan_id: String,
    pub subtask_id: String,
    pub task_id: String,
    pub dependencies: String,
    pub spec: String,
    pub created_at: i64,
}

impl PlanningQueueRow {
    pub fn task_uuid(&self) -> Result<Uuid, DbError> {
        parse_uuid("planning_queue.task_id", &self.task_id)
    }

    pub fn dependency_ids(&self) -> Result<Vec<String>, DbError> {
        Ok(serde_json::from_str(&self.dependencies)?)
    }
}
