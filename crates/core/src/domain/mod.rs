mod plan;
mod run;
mod task;
mod workflow;

pub use plan::*;
pub use run::*;
pub use task::*;
pub use workflow::*;
