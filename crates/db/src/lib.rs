//! SQLite persistent store for hive.
//!
//! Single-table reads and writes live in the repositories; operations that
//! must touch a task and its runs together (claim, reconcile, forced
//! failure, reclamation) live on [`Store`] and run in one transaction.

mod error;
pub mod models;
mod pool;
pub mod repositories;
mod store;

pub use error::*;
pub use pool::*;
pub use repositories::*;
pub use store::*;
