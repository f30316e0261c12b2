use async_trait::async_trait;
use events::{Event, EventError, EventQuery, EventStore, NewEvent, WILDCARD};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::error::DbError;
use crate::models::{datetime_to_millis, EventRow};

/// SQLite-backed event log. Shares the task store's database so events and
/// state live side by side.
#[derive(Clone)]
pub struct EventRepository {
    pool: SqlitePool,
}

impl EventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, event: NewEvent) -> Result<Event, DbError> {
        let payload = serde_json::to_string(&event.payload)?;

        let result = sqlx::query(
            r#"
            INSERT INTO events (event_type, source, correlation_id, payload, timestamp)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.event_type)
        .bind(&event.source)
        .bind(&event.correlation_id)
        .bind(payload)
        .bind(datetime_to_millis(event.timestamp))
        .execute(&self.pool)
        .await?;

        Ok(event.into_event(result.last_insert_rowid()))
    }

    pub async fn find(&self, query: &EventQuery) -> Result<Vec<Event>, DbError> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT event_id, event_type, source, correlation_id, payload, timestamp FROM events WHERE 1 = 1",
        );

        match query.event_type.as_deref() {
            None | Some(WILDCARD) => {}
            Some(pattern) => match pattern.strip_suffix(".*") {
                Some(prefix) => {
                    // SQLite measures text in characters, not bytes.
                    let prefix = format!("{}.", prefix);
                    builder
                        .push(" AND substr(event_type, 1, length(")
                        .push_bind(prefix.clone())
                        .push(")) = ")
                        .push_bind(prefix);
                }
                None => {
                    builder.push(" AND event_type = ").push_bind(pattern.to_string());
                }
            },
        }

        if let Some(correlation_id) = &query.correlation_id {
            builder
                .push(" AND correlation_id = ")
                .push_bind(correlation_id.clone());
        }

        // Newest first so LIMIT keeps the latest matches; reversed below.
        builder.push(" ORDER BY event_id DESC");
        if let Some(limit) = query.limit {
            builder
                .push(" LIMIT ")
                .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows: Vec<EventRow> = builder.build_query_as().fetch_all(&self.pool).await?;

        let mut events = rows
            .into_iter()
            .map(EventRow::into_domain)
            .collect::<Result<Vec<_>, _>>()?;
        events.reverse();
        Ok(events)
    }
}

impl From<DbError> for EventError {
    fn from(err: DbError) -> Self {
        if err.is_retryable() {
            EventError::Unavailable(err.to_string())
        } else {
            EventError::Store(err.to_string())
        }
    }
}

#[async_trait]
impl EventStore for EventRepository {
    async fn append(&self, event: NewEvent) -> Result<Event, EventError> {
        Ok(self.insert(event).await?)
    }

    async fn query(&self, query: &EventQuery) -> Result<Vec<Event>, EventError> {
        Ok(self.find(query).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations};
    use events::{EventBus, LifecycleEvent};
    use std::sync::Arc;
    use uuid::Uuid;

    async fn setup() -> EventRepository {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        EventRepository::new(pool)
    }

    #[tokio::test]
    async fn test_prefix_match_counts_characters() {
        let repo = setup().await;
        for event_type in [
            "déploiement.started",
            "déploiement.finished",
            "déploiementx.started",
            "deploy.started",
        ] {
            repo.append(NewEvent::new(event_type, "test")).await.unwrap();
        }

        let matched: Vec<String> = repo
            .find(&EventQuery::new().event_type("déploiement.*"))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(matched, vec!["déploiement.started", "déploiement.finished"]);
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_ids() {
        let repo = setup().await;

        let first = repo.append(NewEvent::new("task.created", "test")).await.unwrap();
        let second = repo.append(NewEvent::new("task.completed", "test")).await.unwrap();

        assert!(second.event_id > first.event_id);
    }

    #[tokio::test]
    async fn test_query_filters_and_limits() {
        let repo = setup().await;
        let task_id = Uuid::new_v4().to_string();

        for event_type in ["task.created", "run.started", "run.finished", "task.completed"] {
            repo.append(NewEvent::new(event_type, "test").with_correlation_id(&task_id))
                .await
                .unwrap();
        }
        repo.append(NewEvent::new("taskforce.created", "test")).await.unwrap();

        let task_events = repo.query(&EventQuery::new().event_type("task.*")).await.unwrap();
        let types: Vec<&str> = task_events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["task.created", "task.completed"]);

        let latest = repo
            .query(&EventQuery::new().correlation_id(&task_id).limit(2))
            .await
            .unwrap();
        let types: Vec<&str> = latest.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["run.finished", "task.completed"]);

        let everything = repo.query(&EventQuery::new().event_type("*")).await.unwrap();
        assert_eq!(everything.len(), 5);
    }

    #[tokio::test]
    async fn test_bus_persists_through_repository() {
        let repo = setup().await;
        let bus = EventBus::new(Arc::new(repo.clone()));
        let task_id = Uuid::new_v4();

        bus.emit("queen", LifecycleEvent::TaskCompleted { task_id })
            .await
            .unwrap();

        let stored = repo
            .query(&EventQuery::new().correlation_id(task_id.to_string()))
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].source, "queen");
        assert_eq!(
            stored[0].lifecycle(),
            Some(LifecycleEvent::TaskCompleted { task_id })
        );
    }
}
