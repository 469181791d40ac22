//! Atomic file replacement

use std::fs;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{StoreError, StoreResult};

/// Replace `path` with `bytes` atomically
///
/// The data is written and fsynced to a temporary file created next to the
/// target, then renamed over it. Rename within one directory is atomic on
/// every platform we support, so the canonical path is never observed
/// truncated. If the process dies before the rename, only an orphaned hidden
/// temp file remains.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    debug!(path = %path.display(), len = bytes.len(), "write_atomic: called");
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(|e| StoreError::io(parent, e))?;
    tmp.write_all(bytes).map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.flush().map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.as_file().sync_all().map_err(|e| StoreError::io(tmp.path(), e))?;

    tmp.persist(path).map_err(|e| StoreError::io(path, e.error))?;

    // Make the rename itself durable. Not every platform lets us open a
    // directory for syncing, so failures here are ignored.
    if let Ok(dir) = fs::File::open(parent) {
        let _ = dir.sync_all();
    }

    debug!(path = %path.display(), "write_atomic: replaced");
    Ok(())
}
