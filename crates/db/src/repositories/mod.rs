mod event_repository;
mod plan_repository;
mod run_repository;
mod task_repository;

pub use event_repository::*;
pub use plan_repository::*;
pub use run_repository::*;
pub use task_repository::*;

pub(crate) use run_repository::{fail_open_runs, insert_run};
pub(crate) use task_repository::{select_task, stale_cutoff, STALE_IN_PROGRESS};
