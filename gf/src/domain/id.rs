//! Run ID generation and resolution
//!
//! Run IDs use the format: `{16-char-hex}-run-{slug}`
//! Example: `0192f3a4b5c69e1d-run-annual-reports`
//!
//! The first 12 hex chars are the millisecond timestamp of a v7 UUID, so IDs
//! sort in creation order. The last 4 come from its random tail and keep runs
//! started within the same millisecond apart.

/// Generate a run ID labelled with the dataset name
pub fn generate_run_id(label: &str) -> String {
    let uuid = uuid::Uuid::now_v7();
    let simple = uuid.simple().to_string();
    let slug = slugify(label);
    let slug = if slug.is_empty() { "dataset".to_string() } else { slug };
    format!("{}{}-run-{}", &simple[..12], &simple[28..], slug)
}

/// Slugify a label for use in IDs
fn slugify(label: &str) -> String {
    label
        .to_lowercase()
        .chars()
        .filter_map(|c| {
            if c.is_ascii_alphanumeric() {
                Some(c)
            } else if c == '\'' || c == '\u{2019}' || c == '\u{2018}' {
                None
            } else {
                Some('-')
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Resolves a partial run reference against known run IDs
pub struct RunIdResolver<'a> {
    ids: &'a [String],
}

impl<'a> RunIdResolver<'a> {
    pub fn new(ids: &'a [String]) -> Self {
        Self { ids }
    }

    /// Resolve a partial reference to a full ID
    ///
    /// Returns:
    /// - Ok(Some(id)) if exactly one match (or an exact match)
    /// - Ok(None) if no matches
    /// - Err with candidates if ambiguous
    pub fn resolve(&self, reference: &str) -> Result<Option<String>, Vec<String>> {
        if let Some(exact) = self.ids.iter().find(|id| id.as_str() == reference) {
            return Ok(Some(exact.clone()));
        }

        let mut matches: Vec<String> = self
            .ids
            .iter()
            .filter(|id| Self::matches(id, reference))
            .cloned()
            .collect();

        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop()),
            _ => Err(matches),
        }
    }

    fn matches(id: &str, reference: &str) -> bool {
        if id.starts_with(reference) {
            return true;
        }
        // Slug match
        match id.split_once("-run-") {
            Some((_, slug)) => slug.contains(reference),
            None => false,
        }
    }
}
