//! Stage execution
//!
//! A stage is one named unit of pipeline work handed to an external
//! collaborator through [`StageExecutor`]. [`StageRunner`] wraps each
//! invocation in the retry policy and checkpoints every transition.

mod cache;
mod executor;
mod runner;

pub use cache::{CacheEntry, JudgmentCache};
#[cfg(test)]
pub use executor::mock;
pub use executor::{CommandStage, StageError, StageExecutor, StageInput, StageOutput};
pub use runner::{StageContext, StageOutcome, StagePlan, StageRunner};
