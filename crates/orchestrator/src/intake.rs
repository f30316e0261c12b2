//! Entry points for external producers: plain task submission and plan
//! ingestion. Both write through the store, then announce on the bus.

use db::Store;
use events::{EventBus, LifecycleEvent};
use hive_core::{CreateTaskRequest, ExecutionPlan, PlanningEntry, Task};
use tracing::{info, warn};

use crate::error::Result;

pub async fn submit_task(
    store: &Store,
    bus: &EventBus,
    source: &str,
    request: CreateTaskRequest,
) -> Result<Task> {
    let task = store.insert_task(&request.into_task()?).await?;
    info!(task_id = %task.id, title = %task.title, "Task submitted");

    announce(bus, source, created(&task)).await;
    Ok(task)
}

/// Stores the plan and all its subtasks atomically. Dependency references
/// are checked before anything is written.
pub async fn ingest_plan(
    store: &Store,
    bus: &EventBus,
    source: &str,
    plan: &ExecutionPlan,
    entries: &[PlanningEntry],
) -> Result<Vec<Task>> {
    let tasks = store.plans.ingest(plan, entries).await?;

    announce(
        bus,
        source,
        LifecycleEvent::PlanIngested {
            plan_id: plan.id,
            subtask_count: tasks.len(),
        },
    )
    .await;
    for task in &tasks {
        announce(bus, source, created(task)).await;
    }
    Ok(tasks)
}

fn created(task: &Task) -> LifecycleEvent {
    LifecycleEvent::TaskCreated {
        task_id: task.id,
        title: task.title.clone(),
        task_type: task.task_type.clone(),
    }
}

async fn announce(bus: &EventBus, source: &str, event: LifecycleEvent) {
    if let Err(e) = bus.emit(source, event).await {
        warn!(error = %e, "Failed to publish event");
    }
}
