//! Completeness report tree
//!
//! The report is a three-level mapping produced by the scoring stage:
//!
//! ```text
//! { "<group>": { "requirements": { "<req>": { "sub_requirements": {
//!     "<sub>": { "text": "...", "completeness_percent": 40, "evidence": [...] }
//! } } } } }
//! ```
//!
//! It is parsed into typed structs and validated before any traversal.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Errors raised while reading a completeness report
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Failed to read report {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed report: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid completeness {value} at {path} (expected 0-100)")]
    CompletenessOutOfRange { path: String, value: f64 },

    #[error("Empty identifier at {0}")]
    EmptyId(String),
}

/// Whole report, keyed by group id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompletenessReport {
    pub groups: BTreeMap<String, ReportGroup>,
}

/// One top-level grouping of requirements
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportGroup {
    #[serde(default)]
    pub requirements: BTreeMap<String, Requirement>,
}

/// A requirement and its sub-requirements
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    #[serde(default)]
    pub sub_requirements: BTreeMap<String, SubRequirement>,
}

/// Leaf node carrying the judged completeness
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubRequirement {
    /// Requirement text
    pub text: String,

    /// Evidence-backed completeness, 0-100
    pub completeness_percent: f64,

    /// Supporting evidence entries (opaque to the core)
    #[serde(default)]
    pub evidence: Vec<Value>,

    /// Search terms suggested by the judge for closing this gap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_searches: Option<Vec<String>>,
}

impl CompletenessReport {
    /// Parse and validate a report from JSON text
    pub fn from_json_str(json: &str) -> Result<Self, ReportError> {
        let report: Self = serde_json::from_str(json)?;
        report.validate()?;
        Ok(report)
    }

    /// Read a report file
    ///
    /// A missing file is not an error: the pipeline may not have produced a
    /// report yet, and callers branch on `None`.
    pub fn load(path: &Path) -> Result<Option<Self>, ReportError> {
        debug!(path = %path.display(), "CompletenessReport::load: called");
        if !path.is_file() {
            debug!("CompletenessReport::load: no report file");
            return Ok(None);
        }
        let content = fs::read_to_string(path).map_err(|source| ReportError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&content).map(Some)
    }

    /// Reject out-of-range completeness values and empty ids
    pub fn validate(&self) -> Result<(), ReportError> {
        for (group_id, group) in &self.groups {
            if group_id.trim().is_empty() {
                return Err(ReportError::EmptyId("<group>".to_string()));
            }
            for (req_id, req) in &group.requirements {
                if req_id.trim().is_empty() {
                    return Err(ReportError::EmptyId(group_id.clone()));
                }
                for (sub_id, sub) in &req.sub_requirements {
                    let path = format!("{}/{}/{}", group_id, req_id, sub_id);
                    if sub_id.trim().is_empty() {
                        return Err(ReportError::EmptyId(path));
                    }
                    let value = sub.completeness_percent;
                    if !value.is_finite() || !(0.0..=100.0).contains(&value) {
                        return Err(ReportError::CompletenessOutOfRange { path, value });
                    }
                }
            }
        }
        Ok(())
    }

    /// Total number of sub-requirements in the report
    pub fn sub_requirement_count(&self) -> usize {
        self.groups
            .values()
            .flat_map(|g| g.requirements.values())
            .map(|r| r.sub_requirements.len())
            .sum()
    }

    /// Iterate over every leaf as `(group, requirement, sub_requirement, node)`
    pub fn leaves(&self) -> impl Iterator<Item = (&str, &str, &str, &SubRequirement)> {
        self.groups.iter().flat_map(|(group_id, group)| {
            group.requirements.iter().flat_map(move |(req_id, req)| {
                req.sub_requirements
                    .iter()
                    .map(move |(sub_id, sub)| (group_id.as_str(), req_id.as_str(), sub_id.as_str(), sub))
            })
        })
    }
}

/// Where the orchestrator reads the report from after each stage pass
pub trait ReportSource: Send + Sync {
    /// Fetch the current report, `Ok(None)` when none exists yet
    fn load(&self) -> Result<Option<CompletenessReport>, ReportError>;
}

/// Report read from a file on disk
#[derive(Debug, Clone)]
pub struct FileReportSource {
    path: PathBuf,
}

impl FileReportSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ReportSource for FileReportSource {
    fn load(&self) -> Result<Option<CompletenessReport>, ReportError> {
        CompletenessReport::load(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"{
        "governance": {
            "requirements": {
                "R1": {
                    "sub_requirements": {
                        "R1.a": { "text": "Board oversight", "completeness_percent": 25, "evidence": ["p3"] },
                        "R1.b": { "text": "Risk committee", "completeness_percent": 85, "evidence": [] }
                    }
                }
            }
        }
    }"#;

    #[test]
    fn test_parse_sample() {
        let report = CompletenessReport::from_json_str(SAMPLE).unwrap();

        assert_eq!(report.groups.len(), 1);
        assert_eq!(report.sub_requirement_count(), 2);
        let sub = &report.groups["governance"].requirements["R1"].sub_requirements["R1.a"];
        assert_eq!(sub.completeness_percent, 25.0);
        assert_eq!(sub.evidence.len(), 1);
        assert!(sub.suggested_searches.is_none());
    }

    #[test]
    fn test_empty_report_is_valid() {
        let report = CompletenessReport::from_json_str("{}").unwrap();
        assert_eq!(report.sub_requirement_count(), 0);
        assert_eq!(report.leaves().count(), 0);
    }

    #[test]
    fn test_rejects_out_of_range() {
        let json = r#"{"g": {"requirements": {"r": {"sub_requirements": {
            "s": {"text": "t", "completeness_percent": 140}
        }}}}}"#;
        let err = CompletenessReport::from_json_str(json).unwrap_err();
        match err {
            ReportError::CompletenessOutOfRange { path, value } => {
                assert_eq!(path, "g/r/s");
                assert_eq!(value, 140.0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_rejects_wrong_shape() {
        let json = r#"{"g": {"requirements": {"r": {"sub_requirements": {"s": {"text": "t"}}}}}}"#;
        assert!(matches!(
            CompletenessReport::from_json_str(json),
            Err(ReportError::Parse(_))
        ));
    }

    #[test]
    fn test_file_source_missing_is_none() {
        let temp = tempdir().unwrap();
        let source = FileReportSource::new(temp.path().join("report.json"));
        assert!(source.load().unwrap().is_none());
    }

    #[test]
    fn test_file_source_reads_report() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("report.json");
        fs::write(&path, SAMPLE).unwrap();

        let report = FileReportSource::new(&path).load().unwrap().unwrap();
        assert_eq!(report.sub_requirement_count(), 2);
    }
}
