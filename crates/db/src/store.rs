use chrono::Utc;
use hive_core::{Run, RunStatus, Task, TaskStatus, UpdateTaskRequest};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DbError;
use crate::models::{datetime_to_millis, RunRow, TaskRow, RUN_COLUMNS, TASK_COLUMNS};
use crate::pool::{create_pool, run_migrations};
use crate::repositories::{
    fail_open_runs, insert_run, select_task, stale_cutoff, EventRepository, PlanRepository,
    RunRepository, TaskRepository, STALE_IN_PROGRESS,
};

/// Where a task goes after one of its phases finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskTransition {
    pub status: TaskStatus,
    /// `None` exactly when `status` is terminal.
    pub phase: Option<String>,
    pub retry_count: u32,
    pub failure_reason: Option<String>,
}

/// A finished phase attempt and the task transition it causes. Applied by
/// [`Store::reconcile`] as a single unit.
#[derive(Debug, Clone)]
pub struct PhaseCompletion {
    pub task_id: Uuid,
    pub run_id: Uuid,
    /// Phase the run was dispatched for. The task must still be there.
    pub phase: String,
    pub run_status: RunStatus,
    /// Driver-captured output. Anything the worker already reported wins.
    pub result_data: Option<Value>,
    pub transition: TaskTransition,
}

/// The persistent store: repositories over one pool plus the multi-row
/// operations that must commit together.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    pub tasks: TaskRepository,
    pub runs: RunRepository,
    pub plans: PlanRepository,
    pub events: EventRepository,
}

impl Store {
    /// Opens (creating if missing) and migrates the database at `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, DbError> {
        let pool = create_pool(database_url).await?;
        run_migrations(&pool).await?;
        debug!(database_url, "Store ready");
        Ok(Self::new(pool))
    }

    pub fn new(pool: SqlitePool) -> Self {
        Self {
            tasks: TaskRepository::new(pool.clone()),
            runs: RunRepository::new(pool.clone()),
            plans: PlanRepository::new(pool.clone()),
            events: EventRepository::new(pool.clone()),
            pool,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn insert_task(&self, task: &Task) -> Result<Task, DbError> {
        self.tasks.create(task).await
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Task, DbError> {
        self.tasks.get(id).await
    }

    pub async fn update_task(&self, id: Uuid, update: &UpdateTaskRequest) -> Result<Task, DbError> {
        self.tasks.update(id, update).await
    }

    pub async fn list_eligible_tasks(&self, limit: usize) -> Result<Vec<Task>, DbError> {
        self.tasks.list_eligible(limit).await
    }

    pub async fn insert_run(&self, run: &Run) -> Result<Run, DbError> {
        self.runs.create(run).await
    }

    pub async fn update_run(&self, run: &Run) -> Result<Run, DbError> {
        self.runs.update(run).await
    }

    pub async fn get_latest_run(&self, task_id: Uuid) -> Result<Option<Run>, DbError> {
        self.runs.find_latest(task_id).await
    }

    /// Moves a queued task at `phase` to `in_progress` and opens a running
    /// Run with the next `run_number`. Fails with `InvalidTransition` when
    /// someone else got there first.
    pub async fn claim(&self, task_id: Uuid, phase: &str) -> Result<(Task, Run), DbError> {
        let now = datetime_to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'in_progress', updated_at = ?
            WHERE id = ? AND status = 'queued' AND current_phase = ?
            "#,
        )
        .bind(now)
        .bind(task_id.to_string())
        .bind(phase)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            return match select_task(&mut *tx, task_id).await? {
                Some(task) => Err(DbError::invalid_transition(
                    task_id,
                    format!(
                        "cannot claim phase '{}': task is {} at {:?}",
                        phase, task.status, task.current_phase
                    ),
                )),
                None => Err(DbError::TaskNotFound(task_id)),
            };
        }

        let (next_number,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(run_number), 0) + 1 FROM runs WHERE task_id = ?")
                .bind(task_id.to_string())
                .fetch_one(&mut *tx)
                .await?;

        let mut run = Run::new(task_id, next_number, phase);
        run.start();
        insert_run(&mut *tx, &run).await?;
        sqlx::query("UPDATE runs SET heartbeat_at = ? WHERE id = ?")
            .bind(now)
            .bind(run.id.to_string())
            .execute(&mut *tx)
            .await?;

        let task = select_task(&mut *tx, task_id)
            .await?
            .ok_or(DbError::TaskNotFound(task_id))?;

        tx.commit().await?;
        Ok((task, run))
    }

    /// Closes the run and applies the task transition in one transaction.
    /// On any error nothing is written: the run stays open and the task
    /// stays `in_progress` at its old phase.
    pub async fn reconcile(&self, completion: &PhaseCompletion) -> Result<(Task, Run), DbError> {
        let PhaseCompletion {
            task_id,
            run_id,
            phase,
            run_status,
            result_data,
            transition,
        } = completion;

        if !run_status.is_terminal() {
            return Err(DbError::invalid_transition(
                *task_id,
                format!("run {} cannot be closed as {}", run_id, run_status),
            ));
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let result_json = result_data.as_ref().map(serde_json::to_string).transpose()?;
        let closed = sqlx::query(
            r#"
            UPDATE runs
            SET status = ?, result_data = COALESCE(result_data, ?), ended_at = ?
            WHERE id = ? AND task_id = ? AND status IN ('pending', 'running')
            "#,
        )
        .bind(run_status.as_str())
        .bind(result_json)
        .bind(datetime_to_millis(now))
        .bind(run_id.to_string())
        .bind(task_id.to_string())
        .execute(&mut *tx)
        .await?;

        if closed.rows_affected() == 0 {
            return Err(DbError::invalid_transition(
                *task_id,
                format!("run {} is not open", run_id),
            ));
        }

        let mut task = select_task(&mut *tx, *task_id)
            .await?
            .ok_or(DbError::TaskNotFound(*task_id))?;

        let at_phase = task.current_phase.as_deref() == Some(phase.as_str());
        if task.status != TaskStatus::InProgress || !at_phase {
            return Err(DbError::invalid_transition(
                *task_id,
                format!(
                    "expected in_progress at '{}', found {} at {:?}",
                    phase, task.status, task.current_phase
                ),
            ));
        }

        check_transition(&task, transition)?;

        task.status = transition.status;
        task.current_phase = transition.phase.clone();
        task.retry_count = transition.retry_count;
        task.failure_reason = transition.failure_reason.clone();
        task.updated_at = now;

        sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?, current_phase = ?, retry_count = ?, failure_reason = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(task.status.as_str())
        .bind(&task.current_phase)
        .bind(i64::from(task.retry_count))
        .bind(&task.failure_reason)
        .bind(datetime_to_millis(now))
        .bind(task.id.to_string())
        .execute(&mut *tx)
        .await?;

        let run = select_run(&mut tx, *run_id).await?;

        tx.commit().await?;
        Ok((task, run))
    }

    /// Forces a non-terminal task to `failed`, closing any open run.
    pub async fn fail_task(&self, task_id: Uuid, reason: &str) -> Result<Task, DbError> {
        let now = datetime_to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;

        fail_open_runs(&mut *tx, task_id, &json!({ "error": reason })).await?;

        let failed = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'failed', current_phase = NULL, failure_reason = ?, updated_at = ?
            WHERE id = ? AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(reason)
        .bind(now)
        .bind(task_id.to_string())
        .execute(&mut *tx)
        .await?;

        let task = select_task(&mut *tx, task_id)
            .await?
            .ok_or(DbError::TaskNotFound(task_id))?;

        if failed.rows_affected() == 0 {
            return Err(DbError::invalid_transition(
                task_id,
                format!("task is already {}", task.status),
            ));
        }

        tx.commit().await?;
        warn!(task_id = %task_id, reason, "Task forced to failed");
        Ok(task)
    }

    /// Refreshes the heartbeat of each open run in `run_ids`. Returns how
    /// many were still open.
    pub async fn heartbeat(&self, run_ids: &[Uuid]) -> Result<u64, DbError> {
        if run_ids.is_empty() {
            return Ok(0);
        }

        let mut builder = sqlx::QueryBuilder::<sqlx::Sqlite>::new("UPDATE runs SET heartbeat_at = ");
        builder.push_bind(datetime_to_millis(Utc::now()));
        builder.push(" WHERE status IN ('pending', 'running') AND id IN (");
        let mut ids = builder.separated(", ");
        for run_id in run_ids {
            ids.push_bind(run_id.to_string());
        }
        ids.push_unseparated(")");

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Returns tasks stuck `in_progress` for longer than `older_than`, with
    /// no open run heartbeating in that window, to `queued` at their current
    /// phase. Their open runs are closed as abandoned failures.
    pub async fn requeue_stale(&self, older_than: Duration) -> Result<Vec<Task>, DbError> {
        let now = datetime_to_millis(Utc::now());
        let cutoff = stale_cutoff(older_than);
        let mut tx = self.pool.begin().await?;

        let sql = format!("SELECT {} FROM tasks WHERE {}", TASK_COLUMNS, STALE_IN_PROGRESS);
        let rows: Vec<TaskRow> = sqlx::query_as(&sql)
            .bind(cutoff)
            .bind(cutoff)
            .fetch_all(&mut *tx)
            .await?;

        let mut requeued = Vec::with_capacity(rows.len());
        for row in rows {
            let mut task = row.into_domain()?;
            fail_open_runs(&mut *tx, task.id, &json!({ "error": "abandoned" })).await?;

            sqlx::query(
                "UPDATE tasks SET status = 'queued', updated_at = ? WHERE id = ? AND status = 'in_progress'",
            )
            .bind(now)
            .bind(task.id.to_string())
            .execute(&mut *tx)
            .await?;

            task.status = TaskStatus::Queued;
            requeued.push(task);
        }

        tx.commit().await?;

        if !requeued.is_empty() {
            info!(count = requeued.len(), "Requeued stale in-progress tasks");
        }
        Ok(requeued)
    }
}

async fn select_run(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    run_id: Uuid,
) -> Result<Run, DbError> {
    let sql = format!("SELECT {} FROM runs WHERE id = ?", RUN_COLUMNS);
    let row: Option<RunRow> = sqlx::query_as(&sql)
        .bind(run_id.to_string())
        .fetch_optional(&mut **tx)
        .await?;

    row.ok_or(DbError::RunNotFound(run_id))?.into_domain()
}

fn check_transition(task: &Task, transition: &TaskTransition) -> Result<(), DbError> {
    match (&transition.phase, transition.status) {
        (None, status) if status.is_terminal() => Ok(()),
        (Some(_), status) if status.is_terminal() => Err(DbError::invalid_transition(
            task.id,
            format!("terminal status {} cannot keep a phase", status),
        )),
        (None, status) => Err(DbError::invalid_transition(
            task.id,
            format!("status {} needs a phase", status),
        )),
        (Some(_), TaskStatus::InProgress) => Err(DbError::invalid_transition(
            task.id,
            "a finished phase cannot leave the task in_progress",
        )),
        (Some(phase), _) if !task.workflow.contains(phase) => Err(DbError::invalid_transition(
            task.id,
            format!("unknown phase '{}'", phase),
        )),
        _ => Ok(()),
    }
}
