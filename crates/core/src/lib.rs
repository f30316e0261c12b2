//! Domain model for the hive task orchestrator.
//!
//! Tasks carry their own workflow (a map of phase name to [`PhaseSpec`]),
//! every phase attempt is recorded as a [`Run`], and planned subtasks are
//! materialised from an [`ExecutionPlan`].

pub mod domain;
mod error;

pub use domain::*;
pub use error::CoreError;
