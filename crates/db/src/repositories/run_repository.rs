use crate::error::DbError;
use crate::models::{datetime_to_millis, RunRow, RUN_COLUMNS};
use chrono::Utc;
use hive_core::Run;
use serde_json::Value;
use sqlx::{Executor, Sqlite, SqlitePool};
use uuid::Uuid;

#[derive(Clone)]
pub struct RunRepository {
    pool: SqlitePool,
}

impl RunRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, run: &Run) -> Result<Run, DbError> {
        insert_run(&self.pool, run).await?;
        Ok(run.clone())
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Run>, DbError> {
        let sql = format!("SELECT {} FROM runs WHERE id = ?", RUN_COLUMNS);
        let row: Option<RunRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(RunRow::into_domain).transpose()
    }

    /// Runs of one task ordered by `run_number`.
    pub async fn find_by_task_id(&self, task_id: Uuid) -> Result<Vec<Run>, DbError> {
        let sql = format!(
            "SELECT {} FROM runs WHERE task_id = ? ORDER BY run_number ASC",
            RUN_COLUMNS
        );
        let rows: Vec<RunRow> = sqlx::query_as(&sql)
            .bind(task_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(RunRow::into_domain).collect()
    }

    pub async fn find_latest(&self, task_id: Uuid) -> Result<Option<Run>, DbError> {
        let sql = format!(
            "SELECT {} FROM runs WHERE task_id = ? ORDER BY run_number DESC LIMIT 1",
            RUN_COLUMNS
        );
        let row: Option<RunRow> = sqlx::query_as(&sql)
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(RunRow::into_domain).transpose()
    }

    pub async fn find_active(&self) -> Result<Vec<Run>, DbError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM runs
            WHERE status IN ('pending', 'running')
            ORDER BY created_at ASC
            "#,
            RUN_COLUMNS
        );
        let rows: Vec<RunRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;

        rows.into_iter().map(RunRow::into_domain).collect()
    }

    /// Writes status, result and timestamps. Terminal runs are immutable, so
    /// updating one is an invalid transition.
    pub async fn update(&self, run: &Run) -> Result<Run, DbError> {
        let row = RunRow::from_domain(run)?;

        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = ?, result_data = ?, started_at = ?, ended_at = ?
            WHERE id = ? AND status IN ('pending', 'running')
            "#,
        )
        .bind(&row.status)
        .bind(&row.result_data)
        .bind(row.started_at)
        .bind(row.ended_at)
        .bind(&row.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.find_by_id(run.id).await? {
                Some(_) => Err(DbError::invalid_transition(
                    run.task_id,
                    format!("run {} is already terminal", run.id),
                )),
                None => Err(DbError::RunNotFound(run.id)),
            };
        }

        Ok(run.clone())
    }

    /// Structured output written back by an out-of-process worker while its
    /// run is still open. Returns false when the run is already terminal.
    pub async fn record_result(&self, run_id: Uuid, result_data: &Value) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET result_data = ?
            WHERE id = ? AND status IN ('pending', 'running')
            "#,
        )
        .bind(serde_json::to_string(result_data)?)
        .bind(run_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 && self.find_by_id(run_id).await?.is_none() {
            return Err(DbError::RunNotFound(run_id));
        }
        Ok(result.rows_affected() > 0)
    }
}

pub(crate) async fn insert_run<'e, E>(executor: E, run: &Run) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = RunRow::from_domain(run)?;

    sqlx::query(
        r#"
        INSERT INTO runs (id, task_id, run_number, phase, status, result_data, started_at, ended_at, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&row.id)
    .bind(&row.task_id)
    .bind(row.run_number)
    .bind(&row.phase)
    .bind(&row.status)
    .bind(&row.result_data)
    .bind(row.started_at)
    .bind(row.ended_at)
    .bind(row.created_at)
    .execute(executor)
    .await?;

    Ok(())
}

/// Closes every open run of a task with the given outcome data.
pub(crate) async fn fail_open_runs<'e, E>(
    executor: E,
    task_id: Uuid,
    result_data: &Value,
) -> Result<u64, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        UPDATE runs
        SET status = 'failure', result_data = COALESCE(result_data, ?), ended_at = ?
        WHERE task_id = ? AND status IN ('pending', 'running')
        "#,
    )
    .bind(serde_json::to_string(result_data)?)
    .bind(datetime_to_millis(Utc::now()))
    .bind(task_id.to_string())
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations, TaskRepository};
    use hive_core::{PhaseSpec, RunStatus, Task, Workflow, START_PHASE};
    use serde_json::json;

    async fn setup() -> (RunRepository, Task) {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();

        let workflow = Workflow::new().with_phase(START_PHASE, PhaseSpec::new("completed"));
        let task = Task::new("t", "", workflow);
        TaskRepository::new(pool.clone()).create(&task).await.unwrap();

        (RunRepository::new(pool), task)
    }

    #[tokio::test]
    async fn test_runs_ordered_by_number() {
        let (repo, task) = setup().await;

        repo.create(&Run::new(task.id, 2, "test")).await.unwrap();
        repo.create(&Run::new(task.id, 1, "apply")).await.unwrap();

        let runs = repo.find_by_task_id(task.id).await.unwrap();
        let numbers: Vec<i64> = runs.iter().map(|r| r.run_number).collect();
        assert_eq!(numbers, vec![1, 2]);

        let latest = repo.find_latest(task.id).await.unwrap().unwrap();
        assert_eq!(latest.run_number, 2);
        assert_eq!(latest.phase, "test");
    }

    #[tokio::test]
    async fn test_duplicate_run_number_rejected() {
        let (repo, task) = setup().await;

        repo.create(&Run::new(task.id, 1, "apply")).await.unwrap();
        assert!(repo.create(&Run::new(task.id, 1, "apply")).await.is_err());
    }

    #[tokio::test]
    async fn test_terminal_run_is_immutable() {
        let (repo, task) = setup().await;

        let mut run = Run::new(task.id, 1, "apply");
        run.start();
        repo.create(&run).await.unwrap();

        run.succeed(Some(json!({"ok": true})));
        repo.update(&run).await.unwrap();

        run.fail(None);
        let err = repo.update(&run).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidTransition { .. }));

        let stored = repo.find_by_id(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Success);
    }

    #[tokio::test]
    async fn test_record_result_only_while_open() {
        let (repo, task) = setup().await;

        let mut run = Run::new(task.id, 1, "apply");
        run.start();
        repo.create(&run).await.unwrap();

        assert!(repo.record_result(run.id, &json!({"lines": 10})).await.unwrap());
        let stored = repo.find_by_id(run.id).await.unwrap().unwrap();
        assert_eq!(stored.result_data, Some(json!({"lines": 10})));

        let mut closed = stored.clone();
        closed.succeed(None);
        repo.update(&closed).await.unwrap();
        assert!(!repo.record_result(run.id, &json!({"late": true})).await.unwrap());

        let missing = repo.record_result(Uuid::new_v4(), &json!({})).await;
        assert!(matches!(missing, Err(DbError::RunNotFound(_))));
    }
}
