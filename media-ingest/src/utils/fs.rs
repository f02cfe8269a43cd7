//! Filesystem helpers shared across modules.
//!
//! Errors carry the operation and the path so a failed task diagnostic or a
//! startup error points at the offending file.

use std::path::Path;

use crate::{Error, Result};

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all_with_op(op: &'static str, path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| Error::io_path(op, path, e))
}

/// Ensure the parent directory of a file path exists.
pub async fn ensure_parent_dir(path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    ensure_dir_all_with_op("creating output directory", parent).await
}

/// Synchronous variant of [`ensure_dir_all_with_op`], used during startup.
pub fn ensure_dir_all_sync_with_op(op: &'static str, path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| Error::io_path(op, path, e))
}

/// Remove a file, treating "already gone" as success.
///
/// Returns `true` when a file was actually removed.
pub async fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io_path("removing file", path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_parent_dir_creates_nested() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a").join("b").join("out.mkv");
        ensure_parent_dir(&file).await.unwrap();
        assert!(dir.path().join("a").join("b").is_dir());
    }

    #[tokio::test]
    async fn test_remove_file_if_exists() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("stale.mp4");
        std::fs::write(&file, b"x").unwrap();

        assert!(remove_file_if_exists(&file).await.unwrap());
        assert!(!remove_file_if_exists(&file).await.unwrap());
    }
}
