//! Phase workers: the units that actually execute a phase command.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

/// Keep this much of stderr in the run's result.
const STDERR_TAIL_BYTES: usize = 2048;

/// Everything a worker needs to run one attempt of one phase.
#[derive(Debug, Clone)]
pub struct PhaseInvocation {
    pub task_id: Uuid,
    pub run_id: Uuid,
    pub phase: String,
    /// Rendered command template.
    pub command: String,
    /// Deadline the task manager enforces on this attempt. Passed to
    /// command workers as `HIVE_PHASE_TIMEOUT_SECS` so they can pace
    /// themselves; the worker itself does not enforce it.
    pub timeout: Option<Duration>,
}

/// What a finished worker reports back to the driver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    /// Structured result the worker printed, if any.
    pub output: Option<Value>,
    pub stderr: Option<String>,
}

impl WorkerOutput {
    pub fn succeeded(output: Option<Value>) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            output,
            stderr: None,
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: Some(exit_code),
            output: None,
            stderr: Some(stderr.into()),
        }
    }

    pub fn failure_reason(&self) -> String {
        let code = match self.exit_code {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        };
        match self.stderr.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(stderr) => format!("{}: {}", code, last_line(stderr)),
            None => code,
        }
    }

    /// Result data recorded on the run.
    pub fn to_result_data(&self) -> Value {
        json!({
            "exit_code": self.exit_code,
            "output": self.output,
            "stderr": self.stderr,
        })
    }
}

/// Executes a single attempt of a phase. No internal retries: routing after
/// failure is the workflow's job.
#[async_trait]
pub trait PhaseWorker: Send + Sync {
    async fn execute(
        &self,
        invocation: PhaseInvocation,
        cancel: CancellationToken,
    ) -> Result<WorkerOutput>;
}

/// Runs the rendered command through a shell.
///
/// The child sees `HIVE_TASK_ID`, `HIVE_RUN_ID`, `HIVE_PHASE`, the phase
/// deadline as `HIVE_PHASE_TIMEOUT_SECS` when there is one and, when
/// configured, `HIVE_DATABASE_URL` so it can report results through the
/// store itself. A trailing JSON line on stdout is taken as the structured
/// output.
#[derive(Debug, Clone)]
pub struct CommandWorker {
    shell: String,
    database_url: Option<String>,
}

impl CommandWorker {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            database_url: None,
        }
    }

    pub fn with_database_url(mut self, database_url: impl Into<String>) -> Self {
        self.database_url = Some(database_url.into());
        self
    }
}

impl Default for CommandWorker {
    fn default() -> Self {
        Self::new("sh")
    }
}

#[async_trait]
impl PhaseWorker for CommandWorker {
    async fn execute(
        &self,
        invocation: PhaseInvocation,
        cancel: CancellationToken,
    ) -> Result<WorkerOutput> {
        debug!(
            task_id = %invocation.task_id,
            run_id = %invocation.run_id,
            phase = %invocation.phase,
            command = %invocation.command,
            "Spawning phase worker"
        );

        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(&invocation.command)
            .env("HIVE_TASK_ID", invocation.task_id.to_string())
            .env("HIVE_RUN_ID", invocation.run_id.to_string())
            .env("HIVE_PHASE", &invocation.phase)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(timeout) = invocation.timeout {
            command.env("HIVE_PHASE_TIMEOUT_SECS", timeout.as_secs().to_string());
        }
        if let Some(url) = &self.database_url {
            command.env("HIVE_DATABASE_URL", url);
        }

        let child = command.spawn().map_err(|e| {
            OrchestratorError::worker(format!("failed to spawn '{}': {}", self.shell, e))
        })?;

        // Dropping the wait future kills the child.
        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = cancel.cancelled() => {
                return Err(OrchestratorError::worker("cancelled"));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        Ok(WorkerOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            output: trailing_json(&stdout),
            stderr: Some(tail(&stderr, STDERR_TAIL_BYTES)).filter(|s| !s.is_empty()),
        })
    }
}

/// Last non-empty stdout line, if it parses as JSON.
fn trailing_json(stdout: &str) -> Option<Value> {
    let line = stdout.lines().map(str::trim).rfind(|line| !line.is_empty())?;
    serde_json::from_str(line).ok()
}

fn last_line(text: &str) -> &str {
    text.lines().map(str::trim).rfind(|line| !line.is_empty()).unwrap_or("")
}

fn tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(command: &str) -> PhaseInvocation {
        PhaseInvocation {
            task_id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            phase: "apply".to_string(),
            command: command.to_string(),
            timeout: None,
        }
    }

    #[test]
    fn test_trailing_json() {
        assert_eq!(
            trailing_json("building...\n{\"files\": 3}\n\n"),
            Some(json!({"files": 3}))
        );
        assert_eq!(trailing_json("just text\n"), None);
        assert_eq!(trailing_json(""), None);
    }

    #[test]
    fn test_failure_reason() {
        let output = WorkerOutput::failed(2, "warning\nerror: tests failed\n");
        assert_eq!(output.failure_reason(), "exit code 2: error: tests failed");

        let killed = WorkerOutput {
            exit_code: None,
            ..Default::default()
        };
        assert_eq!(killed.failure_reason(), "terminated by signal");
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        let text = "ééééé";
        let tailed = tail(text, 3);
        assert!(tailed.len() <= 3);
        assert!(text.ends_with(&tailed));
    }

    #[tokio::test]
    async fn test_command_worker_reports_exit_and_json() {
        let worker = CommandWorker::default();

        let ok = worker
            .execute(
                invocation(r#"echo "phase=$HIVE_PHASE"; echo '{"ok": true}'"#),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(ok.success);
        assert_eq!(ok.exit_code, Some(0));
        assert_eq!(ok.output, Some(json!({"ok": true})));

        let failed = worker
            .execute(invocation("echo broken >&2; exit 3"), CancellationToken::new())
            .await
            .unwrap();
        assert!(!failed.success);
        assert_eq!(failed.exit_code, Some(3));
        assert_eq!(failed.failure_reason(), "exit code 3: broken");
    }

    #[tokio::test]
    async fn test_command_worker_sees_invocation_env() {
        let worker = CommandWorker::default().with_database_url("sqlite:hive.db");
        let invocation = invocation(
            r#"printf '{"task":"%s","run":"%s","db":"%s"}\n' "$HIVE_TASK_ID" "$HIVE_RUN_ID" "$HIVE_DATABASE_URL""#,
        );
        let (task_id, run_id) = (invocation.task_id, invocation.run_id);

        let output = worker
            .execute(invocation, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            output.output,
            Some(json!({
                "task": task_id.to_string(),
                "run": run_id.to_string(),
                "db": "sqlite:hive.db",
            }))
        );
    }

    #[tokio::test]
    async fn test_command_worker_exports_phase_deadline() {
        let worker = CommandWorker::default();
        let script = r#"printf '{"timeout":"%s"}\n' "${HIVE_PHASE_TIMEOUT_SECS:-none}""#;

        let mut bounded = invocation(script);
        bounded.timeout = Some(Duration::from_secs(90));
        let output = worker
            .execute(bounded, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.output, Some(json!({ "timeout": "90" })));

        let output = worker
            .execute(invocation(script), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.output, Some(json!({ "timeout": "none" })));
    }

    #[tokio::test]
    async fn test_command_worker_cancellation() {
        let worker = CommandWorker::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = worker
            .execute(invocation("sleep 30"), cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }
}
