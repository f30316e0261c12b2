use hive_core::{Run, RunStatus};

use super::{datetime_to_millis, millis_to_datetime, parse_uuid};
use crate::error::DbError;

pub(crate) const RUN_COLUMNS: &str =
    "id, task_id, run_number, phase, status, result_data, started_at, ended_at, created_at";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunRow {
    pub id: String,
    pub task_id: String,
    pub run_number: i64,
    pub phase: String,
    pub status: String,
    pub result_data: Option<String>,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub created_at: i64,
}

impl RunRow {
    pub fn into_domain(self) -> Result<Run, DbError> {
        let status = RunStatus::parse(&self.status)
            .ok_or_else(|| DbError::Corrupt(format!("unknown run status '{}'", self.status)))?;
        let result_data: Option<serde_json::Value> = self
            .result_data
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(Run {
            id: parse_uuid("runs.id", &self.id)?,
            task_id: parse_uuid("runs.task_id", &self.task_id)?,
            run_number: self.run_number,
            phase: self.phase,
            status,
            result_data,
            started_at: self.started_at.map(millis_to_datetime),
            ended_at: self.ended_at.map(millis_to_datetime),
            created_at: millis_to_datetime(self.created_at),
        })
    }

    pub fn from_domain(run: &Run) -> Result<Self, DbError> {
        Ok(Self {
            id: run.id.to_string(),
            task_id: run.task_id.to_string(),
            run_number: run.run_number,
            phase: run.phase.clone(),
            status: run.status.as_str().to_string(),
            result_data: run.result_data.as_ref().map(serde_json::to_string).transpose()?,
            started_at: run.started_at.map(datetime_to_millis),
            ended_at: run.ended_at.map(datetime_to_millis),
            created_at: datetime_to_millis(run.created_at),
        })
    }
}
