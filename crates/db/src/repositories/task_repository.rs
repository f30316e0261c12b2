use crate::error::DbError;
use crate::models::{datetime_to_millis, TaskRow, TASK_COLUMNS};
use chrono::Utc;
use hive_core::{Task, TaskStatus, UpdateTaskRequest, PLANNED_SUBTASK};
use sqlx::{Executor, Sqlite, SqlitePool};
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone)]
pub struct TaskRepository {
    pool: SqlitePool,
}

impl TaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Stores a new task after validating its workflow.
    pub async fn create(&self, task: &Task) -> Result<Task, DbError> {
        task.validate()?;
        insert_task(&self.pool, task).await?;
        Ok(task.clone())
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Task>, DbError> {
        select_task(&self.pool, id).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Task, DbError> {
        self.find_by_id(id).await?.ok_or(DbError::TaskNotFound(id))
    }

    pub async fn find_all(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, DbError> {
        let rows: Vec<TaskRow> = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {} FROM tasks WHERE status = ? ORDER BY created_at DESC, rowid DESC",
                    TASK_COLUMNS
                );
                sqlx::query_as(&sql)
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM tasks ORDER BY created_at DESC, rowid DESC",
                    TASK_COLUMNS
                );
                sqlx::query_as(&sql).fetch_all(&self.pool).await?
            }
        };

        rows.into_iter().map(TaskRow::into_domain).collect()
    }

    /// Queued plain tasks, highest priority first, then oldest first.
    /// Planned subtasks are excluded; they go through dependency resolution.
    pub async fn list_eligible(&self, limit: usize) -> Result<Vec<Task>, DbError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM tasks
            WHERE status = 'queued' AND task_type != ?
            ORDER BY priority DESC, created_at ASC, rowid ASC
            LIMIT ?
            "#,
            TASK_COLUMNS
        );
        let rows: Vec<TaskRow> = sqlx::query_as(&sql)
            .bind(PLANNED_SUBTASK)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(TaskRow::into_domain).collect()
    }

    /// All subtasks materialised from one plan, in creation order.
    pub async fn find_by_plan(&self, plan_id: Uuid) -> Result<Vec<Task>, DbError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM tasks
            WHERE task_type = ? AND json_extract(payload, '$.parent_plan_id') = ?
            ORDER BY created_at ASC, rowid ASC
            "#,
            TASK_COLUMNS
        );
        let rows: Vec<TaskRow> = sqlx::query_as(&sql)
            .bind(PLANNED_SUBTASK)
            .bind(plan_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(TaskRow::into_domain).collect()
    }

    /// Plans that still have queued subtasks.
    pub async fn active_plan_ids(&self) -> Result<Vec<Uuid>, DbError> {
        let rows: Vec<(Option<String>,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT json_extract(payload, '$.parent_plan_id')
            FROM tasks
            WHERE task_type = ? AND status = 'queued'
            "#,
        )
        .bind(PLANNED_SUBTASK)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(id,)| id.and_then(|id| Uuid::parse_str(&id).ok()))
            .collect())
    }

    /// Applies a partial update in one transaction. A phase change must name
    /// a phase of the task's own workflow.
    pub async fn update(&self, id: Uuid, update: &UpdateTaskRequest) -> Result<Task, DbError> {
        let mut tx = self.pool.begin().await?;

        let mut task = select_task(&mut *tx, id)
            .await?
            .ok_or(DbError::TaskNotFound(id))?;
        apply_update(&mut task, update)?;
        task.updated_at = Utc::now();

        let payload = serde_json::to_string(&task.payload)?;
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?, current_phase = ?, payload = ?, failure_reason = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(task.status.as_str())
        .bind(&task.current_phase)
        .bind(payload)
        .bind(&task.failure_reason)
        .bind(datetime_to_millis(task.updated_at))
        .bind(task.id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(task)
    }

    /// Tasks stuck `in_progress` for longer than `older_than` with no open
    /// run heartbeating in that window. Candidates for external reclamation.
    pub async fn find_stale_in_progress(&self, older_than: Duration) -> Result<Vec<Task>, DbError> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE {} ORDER BY updated_at ASC",
            TASK_COLUMNS, STALE_IN_PROGRESS
        );
        let cutoff = stale_cutoff(older_than);
        let rows: Vec<TaskRow> = sqlx::query_as(&sql)
            .bind(cutoff)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(TaskRow::into_domain).collect()
    }

    pub async fn count_by_status(&self) -> Result<Vec<(TaskStatus, i64)>, DbError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status ORDER BY status")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(status, count)| {
                TaskStatus::parse(&status)
                    .map(|s| (s, count))
                    .ok_or_else(|| DbError::Corrupt(format!("unknown task status '{}'", status)))
            })
            .collect()
    }
}

/// Filter on `tasks` for abandoned work. Binds the cutoff twice.
pub(crate) const STALE_IN_PROGRESS: &str = r#"
    status = 'in_progress' AND updated_at < ?
    AND NOT EXISTS (
        SELECT 1 FROM runs
        WHERE runs.task_id = tasks.id
          AND runs.status IN ('pending', 'running')
          AND COALESCE(runs.heartbeat_at, runs.started_at, runs.created_at) >= ?
    )
"#;

pub(crate) fn stale_cutoff(older_than: Duration) -> i64 {
    let older_than_ms = i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX);
    datetime_to_millis(Utc::now()).saturating_sub(older_than_ms)
}

fn apply_update(task: &mut Task, update: &UpdateTaskRequest) -> Result<(), DbError> {
    let moves_task = update.status.is_some() || update.current_phase.is_some();
    if moves_task && task.status == TaskStatus::InProgress {
        return Err(DbError::invalid_transition(
            task.id,
            "task is in progress; its status and phase belong to the driver until the run closes",
        ));
    }

    if let Some(phase) = &update.current_phase {
        if !task.workflow.contains(phase) {
            return Err(DbError::invalid_transition(
                task.id,
                format!("unknown phase '{}'", phase),
            ));
        }
        task.current_phase = Some(phase.clone());
    }

    if let Some(status) = update.status {
        match status {
            TaskStatus::InProgress => {
                return Err(DbError::invalid_transition(
                    task.id,
                    "in_progress is only set when a driver claims the task",
                ));
            }
            TaskStatus::Completed => {
                task.current_phase = None;
                task.failure_reason = None;
            }
            TaskStatus::Failed => {
                task.current_phase = None;
                if task.failure_reason.is_none() {
                    task.failure_reason = Some("marked failed externally".to_string());
                }
            }
            _ => {
                if task.current_phase.is_none() {
                    return Err(DbError::invalid_transition(
                        task.id,
                        format!("status '{}' needs a current_phase to resume from", status),
                    ));
                }
                task.failure_reason = None;
            }
        }
        task.status = status;
    }

    if let Some(patch) = &update.payload_patch {
        json_patch::merge(&mut task.payload, patch);
    }

    Ok(())
}

pub(crate) async fn select_task<'e, E>(executor: E, id: Uuid) -> Result<Option<Task>, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS);
    let row: Option<TaskRow> = sqlx::query_as(&sql)
        .bind(id.to_string())
        .fetch_optional(executor)
        .await?;

    row.map(TaskRow::into_domain).transpose()
}

pub(crate) async fn insert_task<'e, E>(executor: E, task: &Task) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = TaskRow::from_domain(task)?;

    sqlx::query(
        r#"
        INSERT INTO tasks (id, title, description, task_type, status, current_phase, workflow,
                           payload, priority, max_retries, retry_count, assignee, failure_reason,
                           created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&row.id)
    .bind(&row.title)
    .bind(&row.description)
    .bind(&row.task_type)
    .bind(&row.status)
    .bind(&row.current_phase)
    .bind(&row.workflow)
    .bind(&row.payload)
    .bind(row.priority)
    .bind(row.max_retries)
    .bind(row.retry_count)
    .bind(&row.assignee)
    .bind(&row.failure_reason)
    .bind(row.created_at)
    .bind(row.updated_at)
    .execute(executor)
    .await?;

    Ok(())
}
