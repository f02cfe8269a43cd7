//! Polling directory scanner.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};
use walkdir::WalkDir;

use super::staleness::FileSighting;
use crate::database::time::system_time_to_ms;
use crate::{Error, Result};

/// Walks the rule directories and reports every regular file found.
#[derive(Debug, Clone)]
pub struct Scanner {
    inner: Arc<ScannerInner>,
}

#[derive(Debug)]
struct ScannerInner {
    roots: Vec<PathBuf>,
    output_root: PathBuf,
}

impl Scanner {
    /// Build a scanner over `rule_dirs`.
    ///
    /// Directories nested inside another listed directory are dropped so each
    /// file is reported once.
    pub fn new(rule_dirs: impl IntoIterator<Item = PathBuf>, output_root: impl Into<PathBuf>) -> Self {
        let mut dirs: Vec<PathBuf> = rule_dirs.into_iter().collect();
        dirs.sort();
        dirs.dedup();

        let mut roots: Vec<PathBuf> = Vec::with_capacity(dirs.len());
        for dir in dirs {
            // Sorted order puts a parent before its descendants.
            if roots.iter().any(|root| dir.starts_with(root)) {
                continue;
            }
            roots.push(dir);
        }

        Self {
            inner: Arc::new(ScannerInner {
                roots,
                output_root: output_root.into(),
            }),
        }
    }

    /// Directories actually walked.
    pub fn roots(&self) -> &[PathBuf] {
        &self.inner.roots
    }

    /// Run one scan on the blocking thread pool.
    pub async fn scan(&self) -> Result<Vec<FileSighting>> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.scan_blocking())
            .await
            .map_err(|e| Error::Other(format!("scan task failed: {}", e)))
    }

    /// Run one scan on the current thread.
    pub fn scan_blocking(&self) -> Vec<FileSighting> {
        self.inner.scan_blocking()
    }
}

impl ScannerInner {
    fn scan_blocking(&self) -> Vec<FileSighting> {
        let mut sightings = Vec::new();
        for root in &self.roots {
            self.walk_root(root, &mut sightings);
        }
        trace!(files = sightings.len(), "Scan finished");
        sightings
    }

    fn walk_root(&self, root: &Path, sightings: &mut Vec<FileSighting>) {
        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| !entry.path().starts_with(&self.output_root));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    // Vanished or unreadable entries are picked up again on a later tick.
                    debug!(root = %root.display(), error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    debug!(path = %entry.path().display(), error = %e, "File vanished during scan");
                    continue;
                }
            };
            let modified_ms = metadata.modified().map(system_time_to_ms).unwrap_or(0);

            sightings.push(FileSighting {
                path: entry.into_path(),
                size: metadata.len(),
                modified_ms,
            });
        }
    }
}
