//! StateStore - versioned JSON documents with atomic replace
//!
//! Each document kind lives in its own collection directory and every
//! document is one pretty-printed JSON file. Writes go to a temporary file in
//! the same directory and are renamed over the canonical path, so a reader
//! only ever sees a complete old file or a complete new one.
//!
//! # Layout
//!
//! ```text
//! {root}/
//! └── {collection}/
//!     ├── {id}.json
//!     └── .tmpXXXXXX     # in-flight write, ignored by readers
//! ```
//!
//! Documents carry a `schema_version` field. Loading a document written by an
//! older schema runs [`Document::migrate`] and immediately re-saves the
//! migrated form.

mod atomic;
mod document;
mod error;
mod store;

pub use atomic::write_atomic;
pub use document::{Document, SCHEMA_VERSION_FIELD, stored_version};
pub use error::{StoreError, StoreResult};
pub use store::Store;
