use crate::error::DbError;
use crate::models::{datetime_to_millis, PlanRow, PlanningQueueRow};
use crate::repositories::task_repository::insert_task;
use chrono::Utc;
use hive_core::{ExecutionPlan, PlanningEntry, Task};
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
pub struct PlanRepository {
    pool: SqlitePool,
}

impl PlanRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Stores a plan and materialises every entry as a queued planned
    /// subtask. Either the whole plan lands or nothing does.
    pub async fn ingest(
        &self,
        plan: &ExecutionPlan,
        entries: &[PlanningEntry],
    ) -> Result<Vec<Task>, DbError> {
        ExecutionPlan::validate_entries(entries)?;

        let plan_row = PlanRow::from(plan);
        let now = datetime_to_millis(Utc::now());
        let mut tasks = Vec::with_capacity(entries.len());

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO execution_plans (id, name, request, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&plan_row.id)
        .bind(&plan_row.name)
        .bind(&plan_row.request)
        .bind(plan_row.created_at)
        .execute(&mut *tx)
        .await?;

        for entry in entries {
            let task = entry.to_task(plan.id);
            task.validate()?;
            insert_task(&mut *tx, &task).await?;

            sqlx::query(
                r#"
                INSERT INTO planning_queue (plan_id, subtask_id, task_id, dependencies, spec, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&plan_row.id)
            .bind(&entry.subtask_id)
            .bind(task.id.to_string())
            .bind(serde_json::to_string(&entry.dependencies)?)
            .bind(serde_json::to_string(entry)?)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            tasks.push(task);
        }

        tx.commit().await?;

        info!(plan_id = %plan.id, subtasks = tasks.len(), "Ingested execution plan");
        Ok(tasks)
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<ExecutionPlan>, DbError> {
        let row: Option<PlanRow> = sqlx::query_as(
            "SELECT id, name, request, created_at FROM execution_plans WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(PlanRow::into_domain).transpose()
    }

    pub async fn find_all(&self) -> Result<Vec<ExecutionPlan>, DbError> {
        let rows: Vec<PlanRow> = sqlx::query_as(
            "SELECT id, name, request, created_at FROM execution_plans ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PlanRow::into_domain).collect()
    }

    /// Planning queue rows of a plan in subtask order.
    pub async fn entries(&self, plan_id: Uuid) -> Result<Vec<PlanningQueueRow>, DbError> {
        if self.find_by_id(plan_id).await?.is_none() {
            return Err(DbError::PlanNotFound(plan_id));
        }

        let rows: Vec<PlanningQueueRow> = sqlx::query_as(
            r#"
            SELECT plan_id, subtask_id, task_id, dependencies, spec, created_at
            FROM planning_queue
            WHERE plan_id = ?
            ORDER BY subtask_id ASC
            "#,
        )
        .bind(plan_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
