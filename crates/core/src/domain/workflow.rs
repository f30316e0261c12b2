use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::task::TaskStatus;
use crate::error::CoreError;

/// Phase every task starts in unless it declares another one.
pub const START_PHASE: &str = "start";

/// One step of a task's workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseSpec {
    /// Worker invocation. `{task_id}`, `{run_id}` and `{phase}` are substituted
    /// before spawning. A phase without a command passes straight through.
    #[serde(default, alias = "cmd", skip_serializing_if = "Option::is_none")]
    pub command_template: Option<String>,

    #[serde(default, alias = "next_success")]
    pub next_phase_on_success: Option<String>,

    #[serde(default, alias = "next_failure", skip_serializing_if = "Option::is_none")]
    pub next_phase_on_failure: Option<String>,

    /// Where a timed out attempt goes. Absent means the phase is retried.
    #[serde(default, alias = "next_timeout", skip_serializing_if = "Option::is_none")]
    pub next_phase_on_timeout: Option<String>,

    /// Per-phase override of the driver's default timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl PhaseSpec {
    pub fn new(next_phase_on_success: impl Into<String>) -> Self {
        Self {
            next_phase_on_success: Some(next_phase_on_success.into()),
            ..Default::default()
        }
    }

    pub fn with_command(mut self, template: impl Into<String>) -> Self {
        self.command_template = Some(template.into());
        self
    }

    pub fn on_failure(mut self, target: impl Into<String>) -> Self {
        self.next_phase_on_failure = Some(target.into());
        self
    }

    pub fn on_timeout(mut self, target: impl Into<String>) -> Self {
        self.next_phase_on_timeout = Some(target.into());
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn is_pass_through(&self) -> bool {
        self.command_template
            .as_deref()
            .map(|cmd| cmd.trim().is_empty())
            .unwrap_or(true)
    }

    /// Renders the command template for one run of this phase.
    pub fn render_command(&self, task_id: Uuid, run_id: Uuid, phase: &str) -> Option<String> {
        let template = self.command_template.as_deref()?;
        Some(
            template
                .replace("{task_id}", &task_id.to_string())
                .replace("{run_id}", &run_id.to_string())
                .replace("{phase}", phase),
        )
    }
}

/// Resolved routing target of a phase edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStep {
    /// Continue with another phase of the same workflow.
    Phase(String),
    /// `completed` or `failed`; the task leaves the workflow.
    Finish(TaskStatus),
    /// Hand the task to an external actor (`review_pending`, `escalated`,
    /// `approved`, `rejected`). The current phase is kept.
    Park(TaskStatus),
}

impl NextStep {
    pub fn parse(target: &str) -> Self {
        match TaskStatus::parse(target) {
            Some(status) if status.is_terminal() => NextStep::Finish(status),
            Some(status) if status.is_parking() => NextStep::Park(status),
            _ => NextStep::Phase(target.to_string()),
        }
    }
}

/// Per-task workflow: phase name to its spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Workflow {
    phases: BTreeMap<String, PhaseSpec>,
}

impl Workflow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_phase(mut self, name: impl Into<String>, spec: PhaseSpec) -> Self {
        self.phases.insert(name.into(), spec);
        self
    }

    pub fn get(&self, phase: &str) -> Option<&PhaseSpec> {
        self.phases.get(phase)
    }

    pub fn contains(&self, phase: &str) -> bool {
        self.phases.contains_key(phase)
    }

    pub fn resolve(&self, phase: &str) -> Result<&PhaseSpec, CoreError> {
        self.get(phase)
            .ok_or_else(|| CoreError::UnknownPhase(phase.to_string()))
    }

    pub fn phase_names(&self) -> impl Iterator<Item = &str> {
        self.phases.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Resolves an edge target and refuses phase names this workflow lacks.
    pub fn next_step(&self, target: &str) -> Result<NextStep, CoreError> {
        match NextStep::parse(target) {
            NextStep::Phase(name) if !self.contains(&name) => Err(CoreError::UnknownPhase(name)),
            step => Ok(step),
        }
    }

    /// Checks the phase graph once, at task creation.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.phases.is_empty() {
            return Err(CoreError::Validation(
                "workflow must define at least one phase".to_string(),
            ));
        }

        for (name, spec) in &self.phases {
            let invalid = |reason: String| CoreError::InvalidWorkflow {
                phase: name.clone(),
                reason,
            };

            match spec.next_phase_on_success.as_deref() {
                None | Some("") => {
                    return Err(invalid("missing next_phase_on_success".to_string()));
                }
                Some(target) => self.check_target(target).map_err(invalid)?,
            }

            for target in [
                spec.next_phase_on_failure.as_deref(),
                spec.next_phase_on_timeout.as_deref(),
            ]
            .into_iter()
            .flatten()
            {
                self.check_target(target).map_err(invalid)?;
            }
        }

        Ok(())
    }

    fn check_target(&self, target: &str) -> Result<(), String> {
        match NextStep::parse(target) {
            NextStep::Phase(name) if !self.contains(&name) => {
                Err(format!("edge points at unknown phase '{}'", name))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply_test_workflow() -> Workflow {
        Workflow::new()
            .with_phase(START_PHASE, PhaseSpec::new("apply"))
            .with_phase(
                "apply",
                PhaseSpec::new("test")
                    .with_command("apply --task {task_id}")
                    .on_failure("apply"),
            )
            .with_phase(
                "test",
                PhaseSpec::new("completed")
                    .with_command("test --task {task_id}")
                    .on_failure("apply"),
            )
    }

    #[test]
    fn test_valid_workflow() {
        assert!(apply_test_workflow().validate().is_ok());
    }

    #[test]
    fn test_missing_success_edge_rejected() {
        let workflow = Workflow::new().with_phase(START_PHASE, PhaseSpec::default());
        let err = workflow.validate().unwrap_err();
        assert!(matches!(err, CoreError::InvalidWorkflow { ref phase, .. } if phase == "start"));
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let workflow = Workflow::new().with_phase(
            START_PHASE,
            PhaseSpec::new("completed").on_failure("cleanup"),
        );
        let err = workflow.validate().unwrap_err();
        assert!(err.to_string().contains("cleanup"));
    }

    #[test]
    fn test_empty_workflow_rejected() {
        assert!(Workflow::new().validate().is_err());
    }

    #[test]
    fn test_next_step_parsing() {
        assert_eq!(
            NextStep::parse("completed"),
            NextStep::Finish(TaskStatus::Completed)
        );
        assert_eq!(NextStep::parse("failed"), NextStep::Finish(TaskStatus::Failed));
        assert_eq!(
            NextStep::parse("review_pending"),
            NextStep::Park(TaskStatus::ReviewPending)
        );
        assert_eq!(NextStep::parse("apply"), NextStep::Phase("apply".to_string()));
    }

    #[test]
    fn test_next_step_refuses_unknown_phase() {
        let workflow = apply_test_workflow();
        assert_eq!(
            workflow.next_step("test").unwrap(),
            NextStep::Phase("test".to_string())
        );
        assert_eq!(
            workflow.next_step("deploy").unwrap_err(),
            CoreError::UnknownPhase("deploy".to_string())
        );
    }

    #[test]
    fn test_render_command() {
        let task_id = Uuid::new_v4();
        let run_id = Uuid::new_v4();
        let spec = PhaseSpec::new("completed").with_command("run {phase} {task_id} {run_id}");

        let rendered = spec.render_command(task_id, run_id, "apply").unwrap();
        assert_eq!(rendered, format!("run apply {} {}", task_id, run_id));
        assert!(PhaseSpec::new("completed")
            .render_command(task_id, run_id, "start")
            .is_none());
    }

    #[test]
    fn test_deserialize_short_keys() {
        let json = r#"{
            "start": {"next_success": "apply"},
            "apply": {"cmd": "make apply", "next_success": "completed", "next_failure": "apply"}
        }"#;
        let workflow: Workflow = serde_json::from_str(json).unwrap();

        assert_eq!(workflow.len(), 2);
        assert!(workflow.get("start").unwrap().is_pass_through());
        let apply = workflow.get("apply").unwrap();
        assert_eq!(apply.command_template.as_deref(), Some("make apply"));
        assert_eq!(apply.next_phase_on_failure.as_deref(), Some("apply"));
        assert!(workflow.validate().is_ok());
    }
}
