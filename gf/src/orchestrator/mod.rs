//! Run orchestration

mod engine;
mod report;

pub use engine::{Orchestrator, RunOptions};
pub use report::RunReport;
