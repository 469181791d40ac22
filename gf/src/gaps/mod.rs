//! Gap analysis
//!
//! Turns a completeness report into the ordered list of unmet
//! sub-requirements that drives targeted re-analysis. Everything here is a
//! pure function of the report: gaps are recomputed every cycle, never patched.

mod analyzer;
mod report;

pub use analyzer::{GapRecord, GapSummary, Severity, average_completeness, extract_gaps, gap_percent, summarize};
pub use report::{CompletenessReport, FileReportSource, ReportError, ReportGroup, ReportSource, Requirement, SubRequirement};

/// Default completeness fraction below which a sub-requirement is a gap
pub const DEFAULT_GAP_THRESHOLD: f64 = 0.8;
