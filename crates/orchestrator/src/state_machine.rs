use db::TaskTransition;
use hive_core::{CoreError, NextStep, Task, TaskStatus};

/// How one phase attempt ended, as seen by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    Success,
    Failure(String),
    Timeout,
    /// Interrupted by shutdown or an explicit cancel. Not the task's fault.
    Cancelled,
}

impl PhaseOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseOutcome::Success => "success",
            PhaseOutcome::Failure(_) => "failure",
            PhaseOutcome::Timeout => "timeout",
            PhaseOutcome::Cancelled => "cancelled",
        }
    }

    fn counts_as_retry(&self) -> bool {
        matches!(self, PhaseOutcome::Failure(_) | PhaseOutcome::Timeout)
    }
}

/// Decides where `task` goes after its current phase ended with `outcome`.
///
/// Failures and timeouts consume one retry; once `retry_count` exceeds
/// `max_retries` the task fails whatever the workflow says. A cancelled
/// attempt puts the task back in the queue at the same phase.
pub fn plan_transition(task: &Task, outcome: &PhaseOutcome) -> Result<TaskTransition, CoreError> {
    let phase = task
        .current_phase
        .clone()
        .ok_or_else(|| CoreError::Validation(format!("task {} has no current phase", task.id)))?;
    let spec = task.workflow.resolve(&phase)?;

    let retry_count = if outcome.counts_as_retry() {
        task.retry_count.saturating_add(1)
    } else {
        task.retry_count
    };

    let failed = |reason: String| TaskTransition {
        status: TaskStatus::Failed,
        phase: None,
        retry_count,
        failure_reason: Some(reason),
    };

    if outcome.counts_as_retry() && retry_count > task.max_retries {
        return Ok(failed(format!(
            "retries exhausted ({}/{}) in phase '{}': {}",
            retry_count,
            task.max_retries,
            phase,
            describe(outcome)
        )));
    }

    let target = match outcome {
        PhaseOutcome::Cancelled => {
            return Ok(TaskTransition {
                status: TaskStatus::Queued,
                phase: Some(phase),
                retry_count,
                failure_reason: task.failure_reason.clone(),
            });
        }
        PhaseOutcome::Success => spec.next_phase_on_success.clone(),
        PhaseOutcome::Failure(_) => spec.next_phase_on_failure.clone(),
        PhaseOutcome::Timeout => Some(
            spec.next_phase_on_timeout
                .clone()
                .unwrap_or_else(|| phase.clone()),
        ),
    };

    let Some(target) = target else {
        return Ok(failed(format!(
            "phase '{}' has no route for {}: {}",
            phase,
            outcome.as_str(),
            describe(outcome)
        )));
    };

    let last_error = match outcome {
        PhaseOutcome::Success => None,
        other => Some(describe(other)),
    };

    Ok(match task.workflow.next_step(&target)? {
        NextStep::Phase(next) => TaskTransition {
            status: TaskStatus::Queued,
            phase: Some(next),
            retry_count,
            failure_reason: last_error,
        },
        NextStep::Park(status) => TaskTransition {
            status,
            phase: Some(phase),
            retry_count,
            failure_reason: last_error,
        },
        NextStep::Finish(TaskStatus::Completed) => TaskTransition {
            status: TaskStatus::Completed,
            phase: None,
            retry_count,
            failure_reason: None,
        },
        NextStep::Finish(status) => TaskTransition {
            status,
            phase: None,
            retry_count,
            failure_reason: Some(format!(
                "phase '{}' routed to {} after {}",
                phase,
                status,
                describe(outcome)
            )),
        },
    })
}

fn describe(outcome: &PhaseOutcome) -> String {
    match outcome {
        PhaseOutcome::Failure(reason) => reason.clone(),
        other => other.as_str().to_string(),
    }
}
