//! Workflow driving for hive: the generic task manager, dependency
//! resolution for planned subtasks, phase routing and the Queen loop.

pub mod config;
pub mod error;
pub mod intake;
pub mod queen;
pub mod resolver;
pub mod retry;
pub mod state_machine;
pub mod task_manager;
pub mod worker;

pub use config::QueenConfig;
pub use error::{OrchestratorError, Result};
pub use intake::{ingest_plan, submit_task};
pub use queen::{Queen, TickReport};
pub use resolver::{DependencyResolver, Readiness};
pub use retry::{run_with_retry, RetryPolicy};
pub use state_machine::{plan_transition, PhaseOutcome};
pub use task_manager::{gather_bounded, TaskError, TaskManager, TaskResult};
pub use worker::{CommandWorker, PhaseInvocation, PhaseWorker, WorkerOutput};
