//! Relevance scoring functions

use std::collections::HashSet;

use regex::Regex;

use crate::dataset::InputItem;
use crate::gaps::GapRecord;

/// Scores how much an item could help close a gap
///
/// Implementations must return a value in `[0, 1]`; the filter clamps
/// anything else and treats NaN as 0.
pub trait RelevanceScorer: Send + Sync {
    fn score(&self, item: &InputItem, gap: &GapRecord) -> f64;
}

impl<F> RelevanceScorer for F
where
    F: Fn(&InputItem, &GapRecord) -> f64 + Send + Sync,
{
    fn score(&self, item: &InputItem, gap: &GapRecord) -> f64 {
        self(item, gap)
    }
}

const TOKEN_PATTERN: &str = r"[a-z0-9]+";

const STOPWORDS: &[&str] = &[
    "and", "are", "for", "from", "has", "have", "its", "not", "that", "the", "their", "this", "with", "which", "must",
    "should", "shall", "will", "any", "all", "each", "into", "been", "being", "such", "other", "than", "was", "were",
];

/// Default scorer: fraction of gap keywords that appear in the item
///
/// Keywords come from the gap description and its suggested searches,
/// lowercased, at least three characters long and not stopwords.
#[derive(Debug, Clone)]
pub struct KeywordOverlapScorer {
    token_re: Regex,
}

impl KeywordOverlapScorer {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            token_re: Regex::new(TOKEN_PATTERN)?,
        })
    }

    fn keywords(&self, text: &str) -> HashSet<String> {
        let lowered = text.to_lowercase();
        self.token_re
            .find_iter(&lowered)
            .map(|m| m.as_str())
            .filter(|t| t.len() >= 3 && !STOPWORDS.contains(t))
            .map(str::to_string)
            .collect()
    }

    fn gap_keywords(&self, gap: &GapRecord) -> HashSet<String> {
        let mut words = self.keywords(&gap.description);
        for search in gap.suggested_searches.iter().flatten() {
            words.extend(self.keywords(search));
        }
        words
    }
}

impl RelevanceScorer for KeywordOverlapScorer {
    fn score(&self, item: &InputItem, gap: &GapRecord) -> f64 {
        let wanted = self.gap_keywords(gap);
        if wanted.is_empty() {
            return 0.0;
        }
        let present = self.keywords(&item.text);
        let hits = wanted.iter().filter(|w| present.contains(*w)).count();
        hits as f64 / wanted.len() as f64
    }
}
