//! Core Store implementation

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::atomic::write_atomic;
use crate::document::{Document, SCHEMA_VERSION_FIELD, stored_version};
use crate::error::{StoreError, StoreResult};

/// File-per-document store rooted at a directory
#[derive(Debug, Clone)]
pub struct Store {
    /// Base path for storage
    root: PathBuf,
}

impl Store {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let root = path.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;
        debug!(?root, "Store::open: opened");
        Ok(Self { root })
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Canonical path for a document id
    pub fn path_for<D: Document>(&self, id: &str) -> StoreResult<PathBuf> {
        validate_id(id)?;
        Ok(self.root.join(D::COLLECTION).join(format!("{}.json", id)))
    }

    /// Check whether a document exists
    pub fn exists<D: Document>(&self, id: &str) -> StoreResult<bool> {
        Ok(self.path_for::<D>(id)?.is_file())
    }

    /// Load a document, migrating it first when it was written by an older schema
    ///
    /// Returns `Ok(None)` when no document with this id exists.
    pub fn load<D: Document>(&self, id: &str) -> StoreResult<Option<D>> {
        debug!(collection = D::COLLECTION, %id, "Store::load: called");
        let path = self.path_for::<D>(id)?;
        if !path.is_file() {
            debug!(path = %path.display(), "Store::load: not found");
            return Ok(None);
        }

        let bytes = fs::read(&path).map_err(|e| StoreError::io(&path, e))?;
        let raw: Value = serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;

        let (doc, migrated) = upgrade::<D>(raw)?;
        if migrated {
            info!(
                collection = D::COLLECTION,
                %id,
                to = D::SCHEMA_VERSION,
                "Migrated stored document to current schema"
            );
            write_atomic(&path, &to_pretty_bytes(&doc)?)?;
        }

        let record: D = serde_json::from_value(doc).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;
        Ok(Some(record))
    }

    /// Save a document, atomically replacing any previous version
    pub fn save<D: Document>(&self, record: &D) -> StoreResult<()> {
        let id = record.id();
        debug!(collection = D::COLLECTION, %id, "Store::save: called");
        let path = self.path_for::<D>(id)?;
        let value = serde_json::to_value(record).map_err(StoreError::Serialize)?;
        write_atomic(&path, &to_pretty_bytes(&value)?)
    }

    /// List document ids in a collection, sorted
    ///
    /// Hidden files (including in-flight temp files) and anything not ending
    /// in `.json` are ignored.
    pub fn list_ids<D: Document>(&self) -> StoreResult<Vec<String>> {
        let dir = self.root.join(D::COLLECTION);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))? {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            if let Some(stem) = name.strip_suffix(".json") {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        debug!(collection = D::COLLECTION, count = ids.len(), "Store::list_ids: done");
        Ok(ids)
    }

    /// Load every document in a collection
    ///
    /// Corrupt documents are skipped with a warning so one bad file does not
    /// hide the rest.
    pub fn load_all<D: Document>(&self) -> StoreResult<Vec<D>> {
        let mut records = Vec::new();
        for id in self.list_ids::<D>()? {
            match self.load::<D>(&id) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e @ StoreError::Corrupt { .. }) => {
                    warn!(%id, error = %e, "Skipping unreadable document");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }
}

/// Bring a raw document up to the current schema
///
/// Returns the upgraded value and whether a migration ran. Applying this to
/// an already-current document is the identity.
pub(crate) fn upgrade<D: Document>(raw: Value) -> StoreResult<(Value, bool)> {
    let found = stored_version(&raw);
    if found > D::SCHEMA_VERSION {
        return Err(StoreError::UnsupportedVersion {
            collection: D::COLLECTION,
            found,
            supported: D::SCHEMA_VERSION,
        });
    }
    if found == D::SCHEMA_VERSION {
        return Ok((raw, false));
    }

    debug!(collection = D::COLLECTION, from = found, to = D::SCHEMA_VERSION, "upgrade: migrating");
    let migrated = D::migrate(raw, found)?;
    let now = stored_version(&migrated);
    if now != D::SCHEMA_VERSION || migrated.get(SCHEMA_VERSION_FIELD).is_none() {
        return Err(StoreError::Migration {
            collection: D::COLLECTION,
            from: found,
            message: format!("migration produced version {} instead of {}", now, D::SCHEMA_VERSION),
        });
    }
    Ok((migrated, true))
}

fn to_pretty_bytes(value: &Value) -> StoreResult<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(StoreError::Serialize)?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn validate_id(id: &str) -> StoreResult<()> {
    let bad = id.is_empty()
        || id.starts_with('.')
        || id.contains(['/', '\\'])
        || id.chars().any(char::is_control);
    if bad {
        return Err(StoreError::InvalidId(id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::io::Write;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        schema_version: u32,
        id: String,
        body: NoteBody,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct NoteBody {
        text: String,
    }

    impl Document for Note {
        const SCHEMA_VERSION: u32 = 2;
        const COLLECTION: &'static str = "notes";

        fn id(&self) -> &str {
            &self.id
        }

        fn migrate(doc: Value, from: u32) -> StoreResult<Value> {
            if from != 1 {
                return Err(StoreError::Migration {
                    collection: Self::COLLECTION,
                    from,
                    message: "unknown version".to_string(),
                });
            }
            Ok(json!({
                "schema_version": 2,
                "id": doc["id"],
                "body": { "text": doc["text"] },
            }))
        }
    }

    fn note(id: &str, text: &str) -> Note {
        Note {
            schema_version: 2,
            id: id.to_string(),
            body: NoteBody { text: text.to_string() },
        }
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path()).unwrap();

        store.save(&note("a", "hello")).unwrap();

        let loaded: Note = store.load("a").unwrap().unwrap();
        assert_eq!(loaded, note("a", "hello"));
    }

    #[test]
    fn test_load_missing_is_none() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path()).unwrap();

        assert!(store.load::<Note>("nope").unwrap().is_none());
    }

    #[test]
    fn test_load_migrates_and_resaves() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path()).unwrap();
        let path = store.path_for::<Note>("old").unwrap();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{"id": "old", "text": "legacy"}"#).unwrap();

        let loaded: Note = store.load("old").unwrap().unwrap();
        assert_eq!(loaded, note("old", "legacy"));

        let on_disk: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk["schema_version"], 2);
        assert_eq!(on_disk["body"]["text"], "legacy");
    }

    #[test]
    fn test_upgrade_is_identity_on_current() {
        let current = serde_json::to_value(note("x", "y")).unwrap();
        let (value, migrated) = upgrade::<Note>(current.clone()).unwrap();
        assert!(!migrated);
        assert_eq!(value, current);
    }

    #[test]
    fn test_newer_version_rejected() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path()).unwrap();
        let path = store.path_for::<Note>("future").unwrap();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{"schema_version": 9, "id": "future"}"#).unwrap();

        let err = store.load::<Note>("future").unwrap_err();
        assert!(matches!(err, StoreError::UnsupportedVersion { found: 9, .. }));
    }

    #[test]
    fn test_interrupted_write_is_invisible() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path()).unwrap();
        store.save(&note("a", "committed")).unwrap();

        // Simulate a crash between temp write and rename: a half-written
        // temp file is left behind in the collection directory.
        let dir = temp.path().join("notes");
        let mut orphan = tempfile::NamedTempFile::new_in(&dir).unwrap();
        orphan.write_all(b"{\"schema_version\": 2, \"id\": \"a\", \"bo").unwrap();
        let (_file, _orphan_path) = orphan.keep().unwrap();

        let loaded: Note = store.load("a").unwrap().unwrap();
        assert_eq!(loaded.body.text, "committed");
        assert_eq!(store.list_ids::<Note>().unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn test_list_and_load_all() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path()).unwrap();
        store.save(&note("b", "2")).unwrap();
        store.save(&note("a", "1")).unwrap();

        assert_eq!(store.list_ids::<Note>().unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(store.load_all::<Note>().unwrap().len(), 2);
    }

    #[test]
    fn test_load_all_skips_corrupt() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path()).unwrap();
        store.save(&note("good", "ok")).unwrap();
        fs::write(temp.path().join("notes").join("bad.json"), "{ not json").unwrap();

        let all = store.load_all::<Note>().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "good");
    }

    #[test]
    fn test_invalid_ids_rejected() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path()).unwrap();

        for id in ["", "../escape", "a/b", ".hidden"] {
            assert!(matches!(store.path_for::<Note>(id), Err(StoreError::InvalidId(_))));
        }
    }
}
