//! Gap extraction and summaries

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::report::CompletenessReport;

/// Gap severity, derived from completeness alone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    /// Severity for a completeness percentage
    ///
    /// Breakpoints: below 30 critical, below 50 high, below 70 medium.
    pub fn from_completeness(percent: f64) -> Self {
        if percent < 30.0 {
            Self::Critical
        } else if percent < 50.0 {
            Self::High
        } else if percent < 70.0 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    /// Sort rank, lower is more severe
    pub fn rank(self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }

    pub fn all() -> [Severity; 4] {
        [Self::Critical, Self::High, Self::Medium, Self::Low]
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "CRITICAL"),
            Self::High => write!(f, "HIGH"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::Low => write!(f, "LOW"),
        }
    }
}

/// A sub-requirement whose completeness is below the acceptance threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapRecord {
    /// Parent grouping id
    pub group: String,

    /// Requirement id
    pub requirement: String,

    /// Sub-requirement id
    pub sub_requirement: String,

    /// Requirement text
    pub description: String,

    /// Current completeness, 0-100
    pub completeness: f64,

    /// Number of supporting evidence entries
    pub evidence_count: usize,

    /// Severity bucket
    pub severity: Severity,

    /// Terms that may help close the gap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_searches: Option<Vec<String>>,
}

impl GapRecord {
    /// Stable identifier of the sub-requirement this gap refers to
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.group, self.requirement, self.sub_requirement)
    }
}

/// Aggregate view over a gap list
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GapSummary {
    /// Number of gaps
    pub total: usize,

    /// Gap counts per severity (every severity present, possibly zero)
    pub by_severity: BTreeMap<Severity, usize>,

    /// Gap counts per group
    pub by_group: BTreeMap<String, usize>,

    /// Mean completeness across gaps (0 when there are none)
    pub average_completeness: f64,

    /// Lowest completeness among gaps
    pub min_completeness: Option<f64>,

    /// Highest completeness among gaps
    pub max_completeness: Option<f64>,
}

/// Extract every sub-requirement below `threshold` (a 0-1 fraction)
///
/// A sub-requirement exactly at the threshold is not a gap. Output order is
/// severity rank, then completeness ascending, then requirement id; the
/// sub-requirement and group ids settle any remaining ties.
pub fn extract_gaps(report: &CompletenessReport, threshold: f64) -> Vec<GapRecord> {
    debug!(groups = report.groups.len(), threshold, "extract_gaps: called");
    let mut gaps: Vec<GapRecord> = report
        .leaves()
        .filter(|(_, _, _, sub)| sub.completeness_percent / 100.0 < threshold)
        .map(|(group, requirement, sub_id, sub)| GapRecord {
            group: group.to_string(),
            requirement: requirement.to_string(),
            sub_requirement: sub_id.to_string(),
            description: sub.text.clone(),
            completeness: sub.completeness_percent,
            evidence_count: sub.evidence.len(),
            severity: Severity::from_completeness(sub.completeness_percent),
            suggested_searches: sub.suggested_searches.clone(),
        })
        .collect();

    gaps.sort_by(compare_gaps);
    debug!(gap_count = gaps.len(), "extract_gaps: done");
    gaps
}

fn compare_gaps(a: &GapRecord, b: &GapRecord) -> Ordering {
    a.severity
        .rank()
        .cmp(&b.severity.rank())
        .then_with(|| a.completeness.total_cmp(&b.completeness))
        .then_with(|| a.requirement.cmp(&b.requirement))
        .then_with(|| a.sub_requirement.cmp(&b.sub_requirement))
        .then_with(|| a.group.cmp(&b.group))
}

/// Summarize a gap list
pub fn summarize(gaps: &[GapRecord]) -> GapSummary {
    debug!(gap_count = gaps.len(), "summarize: called");
    let mut by_severity: BTreeMap<Severity, usize> = Severity::all().into_iter().map(|s| (s, 0)).collect();
    let mut by_group: BTreeMap<String, usize> = BTreeMap::new();

    for gap in gaps {
        *by_severity.entry(gap.severity).or_default() += 1;
        *by_group.entry(gap.group.clone()).or_default() += 1;
    }

    let average_completeness = if gaps.is_empty() {
        0.0
    } else {
        gaps.iter().map(|g| g.completeness).sum::<f64>() / gaps.len() as f64
    };

    GapSummary {
        total: gaps.len(),
        by_severity,
        by_group,
        average_completeness,
        min_completeness: gaps.iter().map(|g| g.completeness).min_by(f64::total_cmp),
        max_completeness: gaps.iter().map(|g| g.completeness).max_by(f64::total_cmp),
    }
}

/// Gaps as a percentage of all sub-requirements in the report
pub fn gap_percent(report: &CompletenessReport, gaps: &[GapRecord]) -> f64 {
    let total = report.sub_requirement_count();
    if total == 0 {
        return 0.0;
    }
    gaps.len() as f64 * 100.0 / total as f64
}

/// Mean completeness over every sub-requirement in the report
pub fn average_completeness(report: &CompletenessReport) -> f64 {
    let total = report.sub_requirement_count();
    if total == 0 {
        return 0.0;
    }
    report.leaves().map(|(_, _, _, sub)| sub.completeness_percent).sum::<f64>() / total as f64
}
