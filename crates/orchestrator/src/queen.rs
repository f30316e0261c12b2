//! The Queen: hive's workflow driver.
//!
//! One polling loop per instance. Each cycle reconciles finished phase
//! attempts, then claims eligible tasks and hands their phase commands to
//! the task manager. Every task and run mutation goes through the store;
//! the in-memory state here is only the set of attempts this instance is
//! waiting on.

use db::{DbError, PhaseCompletion, Store, TaskTransition};
use events::{EventBus, LifecycleEvent};
use hive_core::{RunStatus, Task, TaskStatus};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::QueenConfig;
use crate::error::Result;
use crate::resolver::DependencyResolver;
use crate::state_machine::{plan_transition, PhaseOutcome};
use crate::task_manager::{TaskError, TaskManager, TaskResult};
use crate::worker::{PhaseInvocation, PhaseWorker, WorkerOutput};

/// `source` of every event the Queen publishes.
pub const EVENT_SOURCE: &str = "queen";

/// A dispatched phase attempt this instance is waiting on.
#[derive(Debug, Clone)]
struct InFlight {
    task_id: Uuid,
    run_id: Uuid,
    phase: String,
    started: Instant,
}

/// A finished attempt whose transition has not been committed yet.
#[derive(Debug, Clone)]
struct Finished {
    task_id: Uuid,
    run_id: Uuid,
    phase: String,
    outcome: PhaseOutcome,
    result_data: Option<Value>,
    duration: Duration,
}

impl Finished {
    fn from_result(flight: InFlight, result: TaskResult<WorkerOutput>) -> Self {
        let (outcome, result_data) = match result.outcome {
            Ok(output) if output.success => (PhaseOutcome::Success, output.to_result_data()),
            Ok(output) => (
                PhaseOutcome::Failure(output.failure_reason()),
                output.to_result_data(),
            ),
            Err(TaskError::Timeout(limit)) => (
                PhaseOutcome::Timeout,
                json!({ "error": format!("timed out after {}s", limit.as_secs_f64()) }),
            ),
            Err(TaskError::Cancelled) => (PhaseOutcome::Cancelled, json!({ "error": "cancelled" })),
            Err(err) => (
                PhaseOutcome::Failure(err.to_string()),
                json!({ "error": err.to_string() }),
            ),
        };

        Self {
            task_id: flight.task_id,
            run_id: flight.run_id,
            phase: flight.phase,
            outcome,
            result_data: Some(result_data),
            duration: result.duration,
        }
    }

    /// A phase without a command succeeds as soon as it is claimed.
    fn pass_through(flight: InFlight) -> Self {
        Self {
            duration: flight.started.elapsed(),
            task_id: flight.task_id,
            run_id: flight.run_id,
            phase: flight.phase,
            outcome: PhaseOutcome::Success,
            result_data: None,
        }
    }

    fn interrupted(flight: InFlight) -> Self {
        Self {
            duration: flight.started.elapsed(),
            task_id: flight.task_id,
            run_id: flight.run_id,
            phase: flight.phase,
            outcome: PhaseOutcome::Cancelled,
            result_data: Some(json!({ "error": "cancelled" })),
        }
    }
}

/// What one poll cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub reconciled: usize,
    pub dispatched: usize,
    pub in_flight: usize,
    /// Finished attempts waiting for the store to come back.
    pub unreconciled: usize,
}

pub struct Queen {
    id: Uuid,
    store: Arc<Store>,
    bus: EventBus,
    worker: Arc<dyn PhaseWorker>,
    manager: TaskManager<WorkerOutput>,
    resolver: DependencyResolver,
    config: QueenConfig,
    /// Keyed by run id, which doubles as the task manager id.
    in_flight: HashMap<String, InFlight>,
    unreconciled: Vec<Finished>,
    last_heartbeat: Option<Instant>,
}

impl Queen {
    pub fn new(
        store: Arc<Store>,
        bus: EventBus,
        worker: Arc<dyn PhaseWorker>,
        config: QueenConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            resolver: DependencyResolver::new(store.tasks.clone()),
            manager: TaskManager::new(config.max_concurrent),
            store,
            bus,
            worker,
            config,
            in_flight: HashMap::new(),
            unreconciled: Vec::new(),
            last_heartbeat: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &QueenConfig {
        &self.config
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Nothing running and nothing waiting to be written back.
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.unreconciled.is_empty()
    }

    /// One poll cycle: reconcile, then admit new work up to the ceiling.
    pub async fn tick(&mut self) -> Result<TickReport> {
        let mut report = TickReport {
            reconciled: self.retry_unreconciled().await,
            ..Default::default()
        };
        report.reconciled += self.collect_finished().await;
        self.heartbeat().await;

        let slots = self.manager.available_slots();
        if slots > 0 {
            for task in self.eligible(slots).await? {
                if self.dispatch(task).await? {
                    report.dispatched += 1;
                }
            }
        }

        report.in_flight = self.in_flight.len();
        report.unreconciled = self.unreconciled.len();
        Ok(report)
    }

    /// Ticks until nothing is running and nothing new is eligible.
    pub async fn run_until_idle(&mut self) -> Result<()> {
        loop {
            let report = self.tick().await?;
            if report.dispatched == 0 && self.is_idle() {
                return Ok(());
            }
            if report.dispatched == 0 {
                self.wait_for_work().await;
            }
        }
    }

    /// Polls until `shutdown` is cancelled, then winds down in-flight work.
    /// Poll errors are reported and the loop carries on.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        info!(
            driver_id = %self.id,
            max_concurrent = self.config.max_concurrent,
            "Queen started"
        );
        self.announce(LifecycleEvent::DriverStarted {
            driver_id: self.id,
            max_concurrent: self.config.max_concurrent,
        })
        .await;

        while !shutdown.is_cancelled() {
            match self.tick().await {
                Ok(report) if report.dispatched > 0 => {
                    debug!(?report, "Poll cycle dispatched work");
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(driver_id = %self.id, error = %e, "Poll cycle failed");
                    self.report_error(e.to_string(), "tick").await;
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.manager.completed() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn wait_for_work(&self) {
        tokio::select! {
            _ = self.manager.completed() => {}
            _ = tokio::time::sleep(self.config.poll_interval) => {}
        }
    }

    /// Stops admitting work, cancels what is in flight and writes back every
    /// attempt that finished or was interrupted.
    async fn shutdown(&mut self) {
        let in_flight = self.in_flight.len();
        info!(driver_id = %self.id, in_flight, "Queen shutting down");

        let forced = self.manager.shutdown(self.config.shutdown_grace).await;
        if forced > 0 {
            warn!(forced, "Phase workers aborted after grace period");
        }

        self.collect_finished().await;
        for (_, flight) in std::mem::take(&mut self.in_flight) {
            self.settle(Finished::interrupted(flight)).await;
        }
        self.retry_unreconciled().await;

        if !self.unreconciled.is_empty() {
            warn!(
                count = self.unreconciled.len(),
                "Stopping with unreconciled runs; reclaim will requeue them"
            );
        }

        self.announce(LifecycleEvent::DriverStopped {
            driver_id: self.id,
            in_flight_at_shutdown: in_flight,
        })
        .await;
    }

    /// Refreshes the lease on every open run this instance is waiting on,
    /// at most once per `heartbeat_interval`.
    async fn heartbeat(&mut self) {
        if self.in_flight.is_empty() {
            return;
        }
        if self
            .last_heartbeat
            .is_some_and(|last| last.elapsed() < self.config.heartbeat_interval)
        {
            return;
        }

        let run_ids: Vec<Uuid> = self.in_flight.values().map(|f| f.run_id).collect();
        match self.store.heartbeat(&run_ids).await {
            Ok(refreshed) => {
                self.last_heartbeat = Some(Instant::now());
                if refreshed < run_ids.len() as u64 {
                    debug!(
                        refreshed,
                        in_flight = run_ids.len(),
                        "Some in-flight runs were closed elsewhere"
                    );
                }
            }
            Err(e) => warn!(driver_id = %self.id, error = %e, "Failed to refresh run heartbeats"),
        }
    }

    async fn eligible(&self, slots: usize) -> Result<Vec<Task>> {
        let mut candidates = self
            .store
            .list_eligible_tasks(slots + self.in_flight.len())
            .await?;
        candidates.extend(self.resolver.ready_across_plans().await?);

        let busy: HashSet<Uuid> = self.in_flight.values().map(|f| f.task_id).collect();
        candidates.retain(|task| !busy.contains(&task.id));
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        candidates.truncate(slots);
        Ok(candidates)
    }

    /// Claims a task and starts its current phase. Returns false when the
    /// task was not started.
    async fn dispatch(&mut self, task: Task) -> Result<bool> {
        let Some(phase) = task.current_phase.clone() else {
            return Ok(false);
        };

        let spec = match task.workflow.resolve(&phase) {
            Ok(spec) => spec.clone(),
            Err(e) => {
                warn!(task_id = %task.id, phase = %phase, "Task cannot be dispatched");
                self.force_fail(task.id, &phase, e.to_string()).await?;
                return Ok(false);
            }
        };

        let (task, run) = match self.store.claim(task.id, &phase).await {
            Ok(claimed) => claimed,
            Err(DbError::InvalidTransition { reason, .. }) => {
                debug!(task_id = %task.id, %reason, "Task claimed elsewhere");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let command = spec
            .render_command(task.id, run.id, &phase)
            .filter(|_| !spec.is_pass_through());

        info!(
            task_id = %task.id,
            run_id = %run.id,
            run_number = run.run_number,
            phase = %phase,
            "Dispatching phase"
        );
        self.announce(LifecycleEvent::RunStarted {
            task_id: task.id,
            run_id: run.id,
            run_number: run.run_number,
            phase: phase.clone(),
        })
        .await;
        self.announce(LifecycleEvent::TaskDispatched {
            task_id: task.id,
            phase: phase.clone(),
            command: command.clone(),
        })
        .await;

        let flight = InFlight {
            task_id: task.id,
            run_id: run.id,
            phase: phase.clone(),
            started: Instant::now(),
        };

        let Some(command) = command else {
            self.settle(Finished::pass_through(flight)).await;
            return Ok(true);
        };

        let timeout = spec
            .timeout_secs
            .map(Duration::from_secs)
            .or(self.config.default_phase_timeout);
        let invocation = PhaseInvocation {
            task_id: task.id,
            run_id: run.id,
            phase,
            command,
            timeout,
        };
        let worker = Arc::clone(&self.worker);
        let key = run.id.to_string();

        let submitted = self
            .manager
            .submit(
                move |cancel| async move { worker.execute(invocation, cancel).await },
                Some(key.clone()),
                timeout,
            )
            .await;

        match submitted {
            Ok(_) => {
                self.in_flight.insert(key, flight);
                Ok(true)
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Task manager refused phase");
                self.settle(Finished::interrupted(flight)).await;
                Ok(false)
            }
        }
    }

    async fn force_fail(&self, task_id: Uuid, phase: &str, reason: String) -> Result<()> {
        match self.store.fail_task(task_id, &reason).await {
            Ok(_) => {
                self.announce(LifecycleEvent::TaskFailed {
                    task_id,
                    phase: Some(phase.to_string()),
                    reason,
                })
                .await;
                Ok(())
            }
            // Someone finished it in the meantime.
            Err(DbError::InvalidTransition { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn collect_finished(&mut self) -> usize {
        let mut reconciled = 0;
        for result in self.manager.take_finished() {
            let Some(flight) = self.in_flight.remove(&result.id) else {
                warn!(id = %result.id, "Result for unknown phase attempt");
                continue;
            };
            if self.settle(Finished::from_result(flight, result)).await {
                reconciled += 1;
            }
        }
        reconciled
    }

    async fn retry_unreconciled(&mut self) -> usize {
        let mut reconciled = 0;
        for finished in std::mem::take(&mut self.unreconciled) {
            if self.settle(finished).await {
                reconciled += 1;
            }
        }
        reconciled
    }

    /// Commits a finished attempt. Keeps it for the next cycle when the
    /// store is unavailable.
    async fn settle(&mut self, finished: Finished) -> bool {
        match self.apply(&finished).await {
            Ok(()) => true,
            Err(e) if e.is_retryable() => {
                warn!(
                    task_id = %finished.task_id,
                    run_id = %finished.run_id,
                    error = %e,
                    "Store unavailable, will retry reconcile"
                );
                self.unreconciled.push(finished);
                false
            }
            Err(e) => {
                error!(
                    task_id = %finished.task_id,
                    run_id = %finished.run_id,
                    error = %e,
                    "Phase result cannot be applied"
                );
                self.report_error(e.to_string(), "reconcile").await;
                self.abandon(finished, e).await
            }
        }
    }

    /// Fails the task of an attempt whose result was rejected, provided the
    /// run is still open. A run closed by someone else means the task has
    /// moved on without us.
    async fn abandon(&mut self, finished: Finished, cause: DbError) -> bool {
        let open = match self.store.runs.find_by_id(finished.run_id).await {
            Ok(run) => run.is_some_and(|run| !run.status.is_terminal()),
            Err(e) if e.is_retryable() => {
                self.unreconciled.push(finished);
                return false;
            }
            Err(e) => {
                warn!(run_id = %finished.run_id, error = %e, "Cannot inspect rejected run");
                return false;
            }
        };
        if !open {
            debug!(run_id = %finished.run_id, "Run already closed elsewhere");
            return false;
        }

        let reason = format!(
            "result of phase '{}' could not be applied: {}",
            finished.phase, cause
        );
        match self.force_fail(finished.task_id, &finished.phase, reason).await {
            Ok(()) => true,
            Err(e) if e.is_retryable() => {
                self.unreconciled.push(finished);
                false
            }
            Err(e) => {
                error!(task_id = %finished.task_id, error = %e, "Failed to fail task");
                false
            }
        }
    }

    async fn apply(&self, finished: &Finished) -> std::result::Result<(), DbError> {
        let task = self.store.get_task(finished.task_id).await?;

        let transition = plan_transition(&task, &finished.outcome).unwrap_or_else(|e| {
            TaskTransition {
                status: TaskStatus::Failed,
                phase: None,
                retry_count: task.retry_count,
                failure_reason: Some(e.to_string()),
            }
        });
        let run_status = match finished.outcome {
            PhaseOutcome::Success => RunStatus::Success,
            _ => RunStatus::Failure,
        };

        let (task, run) = self
            .store
            .reconcile(&PhaseCompletion {
                task_id: finished.task_id,
                run_id: finished.run_id,
                phase: finished.phase.clone(),
                run_status,
                result_data: finished.result_data.clone(),
                transition,
            })
            .await?;

        info!(
            task_id = %task.id,
            run_id = %run.id,
            phase = %finished.phase,
            outcome = finished.outcome.as_str(),
            status = %task.status,
            next_phase = ?task.current_phase,
            "Phase reconciled"
        );
        self.announce_transition(finished, &task, run.status).await;
        Ok(())
    }

    async fn announce_transition(&self, finished: &Finished, task: &Task, run_status: RunStatus) {
        self.announce(LifecycleEvent::RunFinished {
            task_id: task.id,
            run_id: finished.run_id,
            phase: finished.phase.clone(),
            status: run_status.as_str().to_string(),
            outcome: finished.outcome.as_str().to_string(),
            duration_ms: u64::try_from(finished.duration.as_millis()).unwrap_or(u64::MAX),
        })
        .await;

        let event = match task.status {
            TaskStatus::Completed => LifecycleEvent::TaskCompleted { task_id: task.id },
            TaskStatus::Failed => LifecycleEvent::TaskFailed {
                task_id: task.id,
                phase: Some(finished.phase.clone()),
                reason: task.failure_reason.clone().unwrap_or_default(),
            },
            TaskStatus::Queued => match task.current_phase.as_deref() {
                Some(next) if next != finished.phase => LifecycleEvent::TaskPhaseChanged {
                    task_id: task.id,
                    from_phase: finished.phase.clone(),
                    to_phase: next.to_string(),
                },
                _ => LifecycleEvent::TaskRequeued {
                    task_id: task.id,
                    phase: task.current_phase.clone(),
                    reason: finished.outcome.as_str().to_string(),
                },
            },
            status if status.is_parking() => LifecycleEvent::TaskParked {
                task_id: task.id,
                phase: finished.phase.clone(),
                status: status.as_str().to_string(),
            },
            _ => return,
        };
        self.announce(event).await;
    }

    async fn report_error(&self, message: String, context: &str) {
        self.announce(LifecycleEvent::DriverError {
            driver_id: self.id,
            message,
            context: Some(context.to_string()),
        })
        .await;
    }

    /// Event delivery never fails a transition that is already committed.
    async fn announce(&self, event: LifecycleEvent) {
        if let Err(e) = self.bus.emit(EVENT_SOURCE, event).await {
            warn!(driver_id = %self.id, error = %e, "Failed to publish event");
        }
    }
}
