//! Dependency gating for planned subtasks.
//!
//! Stateless: every call recomputes readiness from the sibling task rows, so
//! nothing about the dependency graph is persisted beyond the payloads.

use db::{DbError, TaskRepository};
use hive_core::{Task, TaskStatus};
use std::collections::HashMap;
use uuid::Uuid;

/// Whether a planned subtask may run now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Every dependency is `completed`.
    Ready,
    /// Some dependencies have not finished yet.
    Waiting { pending: Vec<String> },
    /// A dependency failed or does not exist. Stays blocked until someone
    /// outside the core intervenes.
    Blocked { failed: Vec<String> },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }

    /// `siblings` maps `subtask_id` to the status of that sibling's task.
    pub fn of(dependencies: &[String], siblings: &HashMap<String, TaskStatus>) -> Self {
        let mut pending = Vec::new();
        let mut failed = Vec::new();

        for dependency in dependencies {
            match siblings.get(dependency) {
                Some(TaskStatus::Completed) => {}
                Some(TaskStatus::Failed) | None => failed.push(dependency.clone()),
                Some(_) => pending.push(dependency.clone()),
            }
        }

        if !failed.is_empty() {
            Readiness::Blocked { failed }
        } else if !pending.is_empty() {
            Readiness::Waiting { pending }
        } else {
            Readiness::Ready
        }
    }
}

#[derive(Clone)]
pub struct DependencyResolver {
    tasks: TaskRepository,
}

impl DependencyResolver {
    pub fn new(tasks: TaskRepository) -> Self {
        Self { tasks }
    }

    /// Readiness of one planned subtask. Plain tasks have no dependencies
    /// and are always ready.
    pub async fn readiness(&self, task: &Task) -> Result<Readiness, DbError> {
        let Some(reference) = task.subtask_ref() else {
            return Ok(Readiness::Ready);
        };
        if reference.dependencies.is_empty() {
            return Ok(Readiness::Ready);
        }

        let siblings = self.sibling_statuses(reference.parent_plan_id).await?;
        Ok(Readiness::of(&reference.dependencies, &siblings))
    }

    /// Queued subtasks of a plan whose dependencies are all `completed`,
    /// highest priority first.
    pub async fn ready_subtasks(&self, plan_id: Uuid) -> Result<Vec<Task>, DbError> {
        let subtasks = self.tasks.find_by_plan(plan_id).await?;
        let siblings = statuses(&subtasks);

        let mut ready: Vec<Task> = subtasks
            .into_iter()
            .filter(|task| task.status == TaskStatus::Queued)
            .filter(|task| {
                task.subtask_ref()
                    .map(|reference| Readiness::of(&reference.dependencies, &siblings).is_ready())
                    .unwrap_or(false)
            })
            .collect();

        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(ready)
    }

    /// Ready subtasks across every plan that still has queued work.
    pub async fn ready_across_plans(&self) -> Result<Vec<Task>, DbError> {
        let mut ready = Vec::new();
        for plan_id in self.tasks.active_plan_ids().await? {
            ready.extend(self.ready_subtasks(plan_id).await?);
        }
        Ok(ready)
    }

    async fn sibling_statuses(&self, plan_id: Uuid) -> Result<HashMap<String, TaskStatus>, DbError> {
        Ok(statuses(&self.tasks.find_by_plan(plan_id).await?))
    }
}

fn statuses(subtasks: &[Task]) -> HashMap<String, TaskStatus> {
    subtasks
        .iter()
        .filter_map(|task| {
            task.subtask_ref()
                .map(|reference| (reference.subtask_id, task.status))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::{PhaseCompletion, Store, TaskTransition};
    use hive_core::{
        ExecutionPlan, PhaseSpec, PlanningEntry, RunStatus, UpdateTaskRequest, Workflow,
        START_PHASE,
    };

    fn workflow() -> Workflow {
        Workflow::new().with_phase(START_PHASE, PhaseSpec::new("completed"))
    }

    fn deps(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn test_readiness_states() {
        let siblings: HashMap<String, TaskStatus> = [
            ("done".to_string(), TaskStatus::Completed),
            ("running".to_string(), TaskStatus::InProgress),
            ("review".to_string(), TaskStatus::ReviewPending),
            ("broken".to_string(), TaskStatus::Failed),
        ]
        .into_iter()
        .collect();

        assert_eq!(Readiness::of(&[], &siblings), Readiness::Ready);
        assert_eq!(Readiness::of(&deps(&["done"]), &siblings), Readiness::Ready);
        assert_eq!(
            Readiness::of(&deps(&["done", "running", "review"]), &siblings),
            Readiness::Waiting {
                pending: deps(&["running", "review"])
            }
        );
        assert_eq!(
            Readiness::of(&deps(&["running", "broken", "ghost"]), &siblings),
            Readiness::Blocked {
                failed: deps(&["broken", "ghost"])
            }
        );
    }

    async fn complete(store: &Store, task: &Task) {
        let (_, run) = store.claim(task.id, START_PHASE).await.unwrap();
        store
            .reconcile(&PhaseCompletion {
                task_id: task.id,
                run_id: run.id,
                phase: START_PHASE.to_string(),
                run_status: RunStatus::Success,
                result_data: None,
                transition: TaskTransition {
                    status: TaskStatus::Completed,
                    phase: None,
                    retry_count: 0,
                    failure_reason: None,
                },
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dependent_waits_for_exact_completion() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let resolver = DependencyResolver::new(store.tasks.clone());

        let plan = ExecutionPlan::new("p", "");
        let tasks = store
            .plans
            .ingest(
                &plan,
                &[
                    PlanningEntry::new("a", "A", workflow()),
                    PlanningEntry::new("b", "B", workflow()).depends_on("a"),
                ],
            )
            .await
            .unwrap();
        let (a, b) = (&tasks[0], &tasks[1]);

        let ready = resolver.ready_subtasks(plan.id).await.unwrap();
        assert_eq!(ready.iter().map(|t| t.id).collect::<Vec<_>>(), vec![a.id]);
        assert_eq!(
            resolver.readiness(b).await.unwrap(),
            Readiness::Waiting {
                pending: deps(&["a"])
            }
        );

        // Parked is not completed.
        store
            .update_task(
                a.id,
                &UpdateTaskRequest {
                    status: Some(TaskStatus::ReviewPending),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(resolver.ready_subtasks(plan.id).await.unwrap().is_empty());

        store
            .update_task(
                a.id,
                &UpdateTaskRequest {
                    status: Some(TaskStatus::Queued),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        complete(&store, a).await;

        let ready = resolver.ready_subtasks(plan.id).await.unwrap();
        assert_eq!(ready.iter().map(|t| t.id).collect::<Vec<_>>(), vec![b.id]);
        assert!(resolver.readiness(b).await.unwrap().is_ready());
    }

    #[tokio::test]
    async fn test_failed_dependency_blocks() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let resolver = DependencyResolver::new(store.tasks.clone());

        let plan = ExecutionPlan::new("p", "");
        let tasks = store
            .plans
            .ingest(
                &plan,
                &[
                    PlanningEntry::new("a", "A", workflow()),
                    PlanningEntry::new("b", "B", workflow()).depends_on("a"),
                ],
            )
            .await
            .unwrap();

        store.fail_task(tasks[0].id, "gave up").await.unwrap();

        assert!(resolver.ready_across_plans().await.unwrap().is_empty());
        assert_eq!(
            resolver.readiness(&tasks[1]).await.unwrap(),
            Readiness::Blocked {
                failed: deps(&["a"])
            }
        );
    }
}
