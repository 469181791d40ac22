//! Relevance filter: partition items into analyze and skip sets

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::scorer::RelevanceScorer;
use crate::dataset::InputItem;
use crate::domain::{RelevanceSnapshot, SkippedItem};
use crate::gaps::GapRecord;

/// An item paired with its score against the best-matching gap
#[derive(Debug, Clone, PartialEq)]
pub struct RelevanceScore {
    pub item: InputItem,
    pub score: f64,
    /// Key of the best-matching gap, `None` when there are no gaps
    pub best_gap: Option<String>,
}

/// Counters for one filter pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterStats {
    pub total: usize,
    pub kept: usize,
    pub skipped: usize,
    pub threshold: f64,
    pub mean_score: f64,
}

/// Result of one filter pass
#[derive(Debug, Clone, Default)]
pub struct FilterResult {
    pub keep: Vec<RelevanceScore>,
    pub skip: Vec<RelevanceScore>,
    pub stats: FilterStats,
}

impl FilterResult {
    /// Persistable record of this decision
    pub fn snapshot(&self) -> RelevanceSnapshot {
        RelevanceSnapshot {
            threshold: self.stats.threshold,
            kept: self.keep.iter().map(|s| s.item.id.clone()).collect(),
            skipped: self
                .skip
                .iter()
                .map(|s| SkippedItem {
                    id: s.item.id.clone(),
                    score: s.score,
                })
                .collect(),
            mean_score: self.stats.mean_score,
        }
    }
}

/// Keeps items scoring at or above a threshold against any open gap
#[derive(Debug, Clone, Copy)]
pub struct RelevanceFilter {
    threshold: f64,
}

impl RelevanceFilter {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Score every item against every gap and partition on the best score
    ///
    /// With no gaps every item is skipped: there is nothing left to target.
    pub fn filter(&self, items: &[InputItem], gaps: &[GapRecord], scorer: &dyn RelevanceScorer) -> FilterResult {
        debug!(items = items.len(), gaps = gaps.len(), threshold = self.threshold, "RelevanceFilter::filter: called");
        let mut result = FilterResult::default();
        let mut score_sum = 0.0;

        for item in items {
            let scored = best_match(item, gaps, scorer);
            score_sum += scored.score;
            if !gaps.is_empty() && scored.score >= self.threshold {
                result.keep.push(scored);
            } else {
                result.skip.push(scored);
            }
        }

        result.stats = FilterStats {
            total: items.len(),
            kept: result.keep.len(),
            skipped: result.skip.len(),
            threshold: self.threshold,
            mean_score: if items.is_empty() {
                0.0
            } else {
                score_sum / items.len() as f64
            },
        };
        info!(
            total = result.stats.total,
            kept = result.stats.kept,
            skipped = result.stats.skipped,
            "Relevance filter applied"
        );
        result
    }
}

fn best_match(item: &InputItem, gaps: &[GapRecord], scorer: &dyn RelevanceScorer) -> RelevanceScore {
    let mut best = RelevanceScore {
        item: item.clone(),
        score: 0.0,
        best_gap: None,
    };
    for gap in gaps {
        let score = sanitize(scorer.score(item, gap));
        if best.best_gap.is_none() || score > best.score {
            best.score = score;
            best.best_gap = Some(gap.key());
        }
    }
    best
}

fn sanitize(score: f64) -> f64 {
    if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) }
}
