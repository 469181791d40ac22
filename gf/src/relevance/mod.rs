//! Relevance prefiltering
//!
//! Narrows a run to the items that could help close an open gap. Named
//! presets are plain threshold values, see [`FilterPreset`](crate::config::FilterPreset).

mod filter;
mod scorer;

pub use filter::{FilterResult, FilterStats, RelevanceFilter, RelevanceScore};
pub use scorer::{KeywordOverlapScorer, RelevanceScorer};
