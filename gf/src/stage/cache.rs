//! Judgment cache
//!
//! Memoizes successful outputs of deterministic stages. Entries live under
//! `<output_dir>/cache/<key>.json` and are written atomically.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::executor::StageOutput;
use crate::gaps::GapRecord;

/// A cached stage output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub stage: String,
    pub created_at: DateTime<Utc>,
    pub output: StageOutput,
}

#[derive(Debug, Clone)]
pub struct JudgmentCache {
    dir: PathBuf,
}

impl JudgmentCache {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            dir: output_dir.join("cache"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Key for a stage invocation, independent of iteration and attempt
    ///
    /// Covers the stage command and every gap field the stage is handed, so
    /// a changed command or a moved completeness score is a miss.
    pub fn key(stage: &str, command: &str, dataset_hash: &str, items: &[String], gaps: &[GapRecord]) -> String {
        let mut item_ids: Vec<&str> = items.iter().map(String::as_str).collect();
        item_ids.sort_unstable();
        let mut gap_lines: Vec<String> = gaps.iter().map(gap_line).collect();
        gap_lines.sort_unstable();

        let mut hasher = Sha256::new();
        for field in [stage, command, dataset_hash] {
            hasher.update(field.as_bytes());
            hasher.update([0u8]);
        }
        for id in item_ids {
            hasher.update(id.as_bytes());
            hasher.update([b'\n']);
        }
        hasher.update([0u8]);
        for line in gap_lines {
            hasher.update(line.as_bytes());
            hasher.update([b'\n']);
        }
        format!("{:x}", hasher.finalize())
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    /// Look up an entry
    ///
    /// Unreadable entries count as misses.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let path = self.path(key);
        let content = fs::read(&path).ok()?;
        match serde_json::from_slice(&content) {
            Ok(entry) => {
                debug!(%key, "JudgmentCache::get: hit");
                Some(entry)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable cache entry");
                None
            }
        }
    }

    /// Store a successful output
    pub fn put(&self, key: &str, stage: &str, output: &StageOutput) -> Result<()> {
        debug!(%key, %stage, "JudgmentCache::put: called");
        let entry = CacheEntry {
            stage: stage.to_string(),
            created_at: Utc::now(),
            output: output.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&entry)?;
        statestore::write_atomic(&self.path(key), &bytes).context("Failed to write cache entry")?;
        Ok(())
    }
}

/// Gap fields joined with ASCII record separators
fn gap_line(gap: &GapRecord) -> String {
    let searches = gap.suggested_searches.as_deref().unwrap_or_default().join("\u{1f}");
    format!(
        "{}\u{1e}{}\u{1e}{}\u{1e}{}\u{1e}{}\u{1e}{}",
        gap.key(),
        gap.description,
        gap.completeness,
        gap.evidence_count,
        gap.severity,
        searches
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gaps::Severity;
    use tempfile::tempdir;

    fn gap(completeness: f64) -> GapRecord {
        GapRecord {
            group: "governance".into(),
            requirement: "R1".into(),
            sub_requirement: "R1.a".into(),
            description: "Board oversight".into(),
            completeness,
            evidence_count: 0,
            severity: Severity::from_completeness(completeness),
            suggested_searches: None,
        }
    }

    #[test]
    fn test_key_ignores_order() {
        let a = JudgmentCache::key("judge", "run.sh", "h", &["b".into(), "a".into()], &[]);
        let b = JudgmentCache::key("judge", "run.sh", "h", &["a".into(), "b".into()], &[]);
        let c = JudgmentCache::key("judge", "run.sh", "other", &["a".into(), "b".into()], &[]);
        let d = JudgmentCache::key("extract", "run.sh", "h", &["a".into(), "b".into()], &[]);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_key_covers_gap_contents_and_command() {
        let items = vec!["a".to_string()];
        let base = JudgmentCache::key("judge", "run.sh", "h", &items, &[gap(10.0)]);

        assert_eq!(base, JudgmentCache::key("judge", "run.sh", "h", &items, &[gap(10.0)]));
        assert_ne!(base, JudgmentCache::key("judge", "run.sh", "h", &items, &[gap(65.0)]));
        assert_ne!(base, JudgmentCache::key("judge", "run-v2.sh", "h", &items, &[gap(10.0)]));

        let mut searched = gap(10.0);
        searched.suggested_searches = Some(vec!["board minutes".into()]);
        assert_ne!(base, JudgmentCache::key("judge", "run.sh", "h", &items, &[searched]));

        let mut reworded = gap(10.0);
        reworded.description = "Board oversight of climate risk".into();
        assert_ne!(base, JudgmentCache::key("judge", "run.sh", "h", &items, &[reworded]));
    }

    #[test]
    fn test_put_then_get() {
        let temp = tempdir().unwrap();
        let cache = JudgmentCache::new(temp.path());
        let key = JudgmentCache::key("judge", "run.sh", "h", &[], &[]);

        assert!(cache.get(&key).is_none());
        cache.put(&key, "judge", &StageOutput::new("verdict")).unwrap();

        let entry = cache.get(&key).unwrap();
        assert_eq!(entry.stage, "judge");
        assert_eq!(entry.output.stdout, "verdict");
    }

    #[test]
    fn test_corrupt_entry_is_miss() {
        let temp = tempdir().unwrap();
        let cache = JudgmentCache::new(temp.path());
        fs::create_dir_all(cache.dir()).unwrap();
        fs::write(cache.dir().join("bad.json"), "{").unwrap();

        assert!(cache.get("bad").is_none());
    }
}
