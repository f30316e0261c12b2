use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution attempt of one phase of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub task_id: Uuid,
    /// Monotonic per task, starting at 1.
    pub run_number: i64,
    pub phase: String,
    pub status: RunStatus,
    pub result_data: Option<Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Run {
    pub fn new(task_id: Uuid, run_number: i64, phase: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            run_number,
            phase: phase.into(),
            status: RunStatus::default(),
            result_data: None,
            started_at: None,
            ended_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn start(&mut self) {
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn succeed(&mut self, result_data: Option<Value>) {
        self.finish(RunStatus::Success, result_data);
    }

    pub fn fail(&mut self, result_data: Option<Value>) {
        self.finish(RunStatus::Failure, result_data);
    }

    fn finish(&mut self, status: RunStatus, result_data: Option<Value>) {
        self.status = status;
        if result_data.is_some() {
            self.result_data = result_data;
        }
        self.ended_at = Some(Utc::now());
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.ended_at? - self.started_at?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_lifecycle() {
        let mut run = Run::new(Uuid::new_v4(), 1, "apply");
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.started_at.is_none());

        run.start();
        assert_eq!(run.status, RunStatus::Running);
        assert!(!run.status.is_terminal());

        run.succeed(Some(json!({"files": 3})));
        assert_eq!(run.status, RunStatus::Success);
        assert!(run.status.is_terminal());
        assert!(run.duration().is_some());
        assert_eq!(run.result_data.unwrap()["files"], 3);
    }

    #[test]
    fn test_fail_keeps_existing_result() {
        let mut run = Run::new(Uuid::new_v4(), 2, "test");
        run.start();
        run.result_data = Some(json!({"reported": true}));
        run.fail(None);

        assert_eq!(run.status, RunStatus::Failure);
        assert_eq!(run.result_data.unwrap()["reported"], true);
    }

    #[test]
    fn test_run_status_parsing() {
        assert_eq!(RunStatus::parse("failure"), Some(RunStatus::Failure));
        assert_eq!(RunStatus::parse("aborted"), None);
        assert_eq!(RunStatus::Running.as_str(), "running");
    }
}
