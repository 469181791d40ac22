//! Run state persistence and crash recovery

pub mod recovery;
mod store;

pub use recovery::{RecoveryStats, prepare_resume};
pub use store::StateStore;
