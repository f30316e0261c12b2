//! Event types for the hive event system

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Matches every event type in subscriptions and queries.
pub const WILDCARD: &str = "*";

/// A persisted event. `event_id` is assigned by the store and increases
/// monotonically.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub event_id: i64,
    pub event_type: String,
    /// Component that emitted the event (`queen`, `store`, `cli`, ...)
    pub source: String,
    /// Usually the task id; lets dashboards follow one task through its life.
    pub correlation_id: Option<String>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Decodes the payload back into a lifecycle event, if it is one.
    pub fn lifecycle(&self) -> Option<LifecycleEvent> {
        serde_json::from_value(self.payload.clone()).ok()
    }
}

/// An event that has not been stored yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewEvent {
    pub event_type: String,
    pub source: String,
    pub correlation_id: Option<String>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            source: source.into(),
            correlation_id: None,
            payload: Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn into_event(self, event_id: i64) -> Event {
        Event {
            event_id,
            event_type: self.event_type,
            source: self.source,
            correlation_id: self.correlation_id,
            payload: self.payload,
            timestamp: self.timestamp,
        }
    }
}

/// Read-only filter over the event log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventQuery {
    /// Exact type, `prefix.*`, or `*`.
    pub event_type: Option<String>,
    pub correlation_id: Option<String>,
    /// Keep only the most recent `limit` matches.
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        let type_ok = self
            .event_type
            .as_deref()
            .map_or(true, |pattern| type_matches(pattern, &event.event_type));
        let correlation_ok = self
            .correlation_id
            .as_deref()
            .map_or(true, |id| event.correlation_id.as_deref() == Some(id));
        type_ok && correlation_ok
    }
}

/// `*` matches everything, `task.*` matches `task.created` and friends,
/// anything else must match exactly.
pub fn type_matches(pattern: &str, event_type: &str) -> bool {
    if pattern == WILDCARD {
        return true;
    }
    match pattern.strip_suffix(".*") {
        Some(prefix) => event_type
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.')),
        None => pattern == event_type,
    }
}

/// All lifecycle events emitted by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    // Task events
    #[serde(rename = "task.created")]
    TaskCreated {
        task_id: Uuid,
        title: String,
        task_type: String,
    },

    /// A phase command was handed to the task manager
    #[serde(rename = "task.dispatched")]
    TaskDispatched {
        task_id: Uuid,
        phase: String,
        command: Option<String>,
    },

    #[serde(rename = "task.phase_changed")]
    TaskPhaseChanged {
        task_id: Uuid,
        from_phase: String,
        to_phase: String,
    },

    /// Task handed to an external actor (review, escalation)
    #[serde(rename = "task.parked")]
    TaskParked {
        task_id: Uuid,
        phase: String,
        status: String,
    },

    #[serde(rename = "task.completed")]
    TaskCompleted { task_id: Uuid },

    #[serde(rename = "task.failed")]
    TaskFailed {
        task_id: Uuid,
        phase: Option<String>,
        reason: String,
    },

    #[serde(rename = "task.requeued")]
    TaskRequeued {
        task_id: Uuid,
        phase: Option<String>,
        reason: String,
    },

    // Run events
    #[serde(rename = "run.started")]
    RunStarted {
        task_id: Uuid,
        run_id: Uuid,
        run_number: i64,
        phase: String,
    },

    #[serde(rename = "run.finished")]
    RunFinished {
        task_id: Uuid,
        run_id: Uuid,
        phase: String,
        status: String,
        outcome: String,
        duration_ms: u64,
    },

    // Plan events
    #[serde(rename = "plan.ingested")]
    PlanIngested { plan_id: Uuid, subtask_count: usize },

    // Driver events
    #[serde(rename = "driver.started")]
    DriverStarted {
        driver_id: Uuid,
        max_concurrent: usize,
    },

    #[serde(rename = "driver.stopped")]
    DriverStopped {
        driver_id: Uuid,
        in_flight_at_shutdown: usize,
    },

    #[serde(rename = "driver.error")]
    DriverError {
        driver_id: Uuid,
        message: String,
        context: Option<String>,
    },
}

impl LifecycleEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TaskCreated { .. } => "task.created",
            Self::TaskDispatched { .. } => "task.dispatched",
            Self::TaskPhaseChanged { .. } => "task.phase_changed",
            Self::TaskParked { .. } => "task.parked",
            Self::TaskCompleted { .. } => "task.completed",
            Self::TaskFailed { .. } => "task.failed",
            Self::TaskRequeued { .. } => "task.requeued",
            Self::RunStarted { .. } => "run.started",
            Self::RunFinished { .. } => "run.finished",
            Self::PlanIngested { .. } => "plan.ingested",
            Self::DriverStarted { .. } => "driver.started",
            Self::DriverStopped { .. } => "driver.stopped",
            Self::DriverError { .. } => "driver.error",
        }
    }

    /// Get the task ID associated with this event, if any
    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            Self::TaskCreated { task_id, .. }
            | Self::TaskDispatched { task_id, .. }
            | Self::TaskPhaseChanged { task_id, .. }
            | Self::TaskParked { task_id, .. }
            | Self::TaskCompleted { task_id }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskRequeued { task_id, .. }
            | Self::RunStarted { task_id, .. }
            | Self::RunFinished { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }

    pub fn correlation_id(&self) -> Option<String> {
        if let Some(task_id) = self.task_id() {
            return Some(task_id.to_string());
        }
        match self {
            Self::PlanIngested { plan_id, .. } => Some(plan_id.to_string()),
            Self::DriverStarted { driver_id, .. }
            | Self::DriverStopped { driver_id, .. }
            | Self::DriverError { driver_id, .. } => Some(driver_id.to_string()),
            _ => None,
        }
    }

    pub fn into_new_event(self, source: impl Into<String>) -> NewEvent {
        let mut event = NewEvent::new(self.event_type(), source);
        event.correlation_id = self.correlation_id();
        event.payload = serde_json::to_value(&self).unwrap_or(Value::Null);
        event
    }
}
