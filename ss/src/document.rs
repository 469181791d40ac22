//! Document trait for versioned records

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::StoreResult;

/// Name of the version field every stored document carries
pub const SCHEMA_VERSION_FIELD: &str = "schema_version";

/// A record that can be persisted in a [`Store`](crate::Store)
///
/// Implementors own their migration logic: the store only detects that a
/// stored document is older than [`Document::SCHEMA_VERSION`] and hands the
/// raw JSON to [`Document::migrate`].
pub trait Document: Serialize + DeserializeOwned {
    /// Schema version written by this build
    const SCHEMA_VERSION: u32;

    /// Collection (directory) name for this document kind
    const COLLECTION: &'static str;

    /// Unique identifier, used as the file stem
    fn id(&self) -> &str;

    /// Bring a document stored at version `from` up to `SCHEMA_VERSION`
    ///
    /// Must be deterministic and must not drop fields present in the old
    /// form. The returned value has to carry the current version.
    fn migrate(doc: Value, from: u32) -> StoreResult<Value>;
}

/// Read the schema version of a raw document
///
/// Documents without the field predate versioning and count as version 1.
pub fn stored_version(doc: &Value) -> u32 {
    doc.get(SCHEMA_VERSION_FIELD)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(1)
}
