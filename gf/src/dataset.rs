//! Dataset scanning and fingerprinting
//!
//! A dataset is a directory of input items. Each regular, non-hidden file is
//! one item, identified by its path relative to the dataset root.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::domain::DatasetFingerprint;

/// One input item
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct InputItem {
    /// Path relative to the dataset root, `/`-separated
    pub id: String,
    /// File content, lossily decoded as UTF-8
    pub text: String,
}

impl InputItem {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

/// A scanned dataset snapshot
#[derive(Debug, Clone)]
pub struct Dataset {
    root: PathBuf,
    items: Vec<InputItem>,
    fingerprint: DatasetFingerprint,
}

impl Dataset {
    /// Walk `root` and read every item
    pub fn scan(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        debug!(root = %root.display(), "Dataset::scan: called");
        if !root.is_dir() {
            return Err(eyre::eyre!("Dataset directory not found: {}", root.display()));
        }

        let root_for_filter = root.to_path_buf();
        let walker = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |e| {
                if e.path() == root_for_filter {
                    return true;
                }
                // Skip hidden files/directories (starting with .)
                e.file_name().to_str().map(|s| !s.starts_with('.')).unwrap_or(true)
            });

        let mut entries = Vec::new();
        for entry in walker {
            let entry = entry.context("Failed to walk dataset directory")?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let bytes = fs::read(path).context(format!("Failed to read {}", path.display()))?;
            let id = relative_id(root, path);
            entries.push((id, bytes));
        }

        Ok(Self::from_entries(root.to_path_buf(), entries))
    }

    /// Build a dataset from in-memory `(id, content)` pairs
    pub fn from_entries(root: PathBuf, mut entries: Vec<(String, Vec<u8>)>) -> Self {
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut items = Vec::with_capacity(entries.len());
        let mut hashes = BTreeMap::new();
        let mut size_bytes = 0u64;
        for (id, bytes) in entries {
            size_bytes += bytes.len() as u64;
            hashes.insert(id.clone(), sha256_hex(&bytes));
            items.push(InputItem::new(id, String::from_utf8_lossy(&bytes).into_owned()));
        }

        let fingerprint = DatasetFingerprint {
            hash: combined_hash(&hashes),
            size_bytes,
            item_count: items.len(),
            items: hashes,
        };
        info!(
            root = %root.display(),
            items = fingerprint.item_count,
            size_bytes = fingerprint.size_bytes,
            "Scanned dataset"
        );

        Self {
            root,
            items,
            fingerprint,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn items(&self) -> &[InputItem] {
        &self.items
    }

    pub fn fingerprint(&self) -> &DatasetFingerprint {
        &self.fingerprint
    }

    /// Whether the content is identical to a previous fingerprint
    pub fn unchanged_since(&self, previous: &DatasetFingerprint) -> bool {
        !previous.hash.is_empty() && self.fingerprint.hash == previous.hash
    }

    /// Items that are new or changed relative to a previous fingerprint
    pub fn new_items_since(&self, previous: &DatasetFingerprint) -> Vec<InputItem> {
        self.items
            .iter()
            .filter(|item| previous.items.get(&item.id) != self.fingerprint.items.get(&item.id))
            .cloned()
            .collect()
    }
}

fn relative_id(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Lowercase hex SHA-256 of bytes
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

fn combined_hash(items: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (id, hash) in items {
        hasher.update(id.as_bytes());
        hasher.update([0u8]);
        hasher.update(hash.as_bytes());
        hasher.update([b'\n']);
    }
    format!("{:x}", hasher.finalize())
}
