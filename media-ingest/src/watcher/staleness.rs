//! Size-sampling staleness tracker.
//!
//! A file is considered stable once its size has been observed unchanged on
//! `threshold` consecutive scans. The tracker is owned by the polling loop and
//! never shared, so it needs no synchronization.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, trace};

/// One file reported by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSighting {
    pub path: PathBuf,
    pub size: u64,
    /// Last modification time, epoch milliseconds.
    pub modified_ms: i64,
}

/// A file that has stopped changing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StableFile {
    pub path: PathBuf,
    pub size: u64,
    pub modified_ms: i64,
}

/// Sampling state for a file that is still being watched.
#[derive(Debug, Clone)]
pub struct WatchedFile {
    pub path: PathBuf,
    pub last_size: u64,
    pub last_modified_ms: i64,
    pub unchanged_count: u32,
    pub first_seen: Instant,
}

impl WatchedFile {
    fn new(sighting: &FileSighting) -> Self {
        Self {
            path: sighting.path.clone(),
            last_size: sighting.size,
            last_modified_ms: sighting.modified_ms,
            unchanged_count: 1,
            first_seen: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    size: u64,
    modified_ms: i64,
}

#[derive(Debug)]
pub struct StalenessTracker {
    threshold: u32,
    watched: HashMap<PathBuf, WatchedFile>,
    /// Files already handed off, keyed by the fingerprint they had then.
    settled: HashMap<PathBuf, Fingerprint>,
}

impl StalenessTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            watched: HashMap::new(),
            settled: HashMap::new(),
        }
    }

    /// Record one sighting. Returns the file when it just became stable.
    pub fn observe(&mut self, sighting: &FileSighting) -> Option<StableFile> {
        let fingerprint = Fingerprint {
            size: sighting.size,
            modified_ms: sighting.modified_ms,
        };
        if let Some(settled) = self.settled.get(&sighting.path) {
            if *settled == fingerprint {
                return None;
            }
            trace!(path = %sighting.path.display(), "Settled file changed, watching again");
            self.settled.remove(&sighting.path);
        }

        let count = match self.watched.get_mut(&sighting.path) {
            Some(entry) if entry.last_size == sighting.size => {
                entry.unchanged_count += 1;
                entry.last_modified_ms = sighting.modified_ms;
                entry.unchanged_count
            }
            Some(entry) => {
                trace!(
                    path = %sighting.path.display(),
                    from = entry.last_size,
                    to = sighting.size,
                    "Size changed, resetting"
                );
                *entry = WatchedFile::new(sighting);
                1
            }
            None => {
                self.watched
                    .insert(sighting.path.clone(), WatchedFile::new(sighting));
                1
            }
        };

        if count < self.threshold {
            return None;
        }

        self.watched.remove(&sighting.path);
        self.settled.insert(sighting.path.clone(), fingerprint);
        debug!(path = %sighting.path.display(), size = sighting.size, "File is stable");
        Some(StableFile {
            path: sighting.path.clone(),
            size: sighting.size,
            modified_ms: sighting.modified_ms,
        })
    }

    /// Feed a full scan, withdrawing every path the scan did not report.
    ///
    /// Stable files are returned in scan order.
    pub fn observe_scan(&mut self, sightings: &[FileSighting]) -> Vec<StableFile> {
        let stable = sightings
            .iter()
            .filter_map(|sighting| self.observe(sighting))
            .collect();

        let present: HashSet<&Path> = sightings.iter().map(|s| s.path.as_path()).collect();
        self.withdraw_missing(&present);
        stable
    }

    fn withdraw_missing(&mut self, present: &HashSet<&Path>) {
        self.watched.retain(|path, _| {
            let keep = present.contains(path.as_path());
            if !keep {
                debug!(path = %path.display(), "File disappeared before becoming stable");
            }
            keep
        });
        self.settled
            .retain(|path, _| present.contains(path.as_path()));
    }

    /// Drop all state for `path`; its next sighting starts from scratch.
    pub fn forget(&mut self, path: &Path) {
        self.watched.remove(path);
        self.settled.remove(path);
    }

    pub fn watched(&self, path: &Path) -> Option<&WatchedFile> {
        self.watched.get(path)
    }

    pub fn watched_count(&self) -> usize {
        self.watched.len()
    }

    pub fn is_settled(&self, path: &Path) -> bool {
        self.settled.contains_key(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sighting(path: &str, size: u64, modified_ms: i64) -> FileSighting {
        FileSighting {
            path: PathBuf::from(path),
            size,
            modified_ms,
        }
    }

    #[test]
    fn test_stable_on_threshold_tick() {
        let mut tracker = StalenessTracker::new(3);
        let file = sighting("/in/a.mp4", 1000, 1);

        assert!(tracker.observe_scan(&[file.clone()]).is_empty());
        assert!(tracker.observe_scan(&[file.clone()]).is_empty());
        let stable = tracker.observe_scan(&[file.clone()]);
        assert_eq!(stable.len(), 1);
        assert_eq!(stable[0].path, PathBuf::from("/in/a.mp4"));
        assert_eq!(tracker.watched_count(), 0);

        // Further unchanged sightings are ignored.
        for _ in 0..5 {
            assert!(tracker.observe_scan(&[file.clone()]).is_empty());
        }
    }

    #[test]
    fn test_growth_resets_count() {
        let mut tracker = StalenessTracker::new(2);
        assert!(tracker.observe(&sighting("/in/a.mp4", 10, 1)).is_none());
        assert!(tracker.observe(&sighting("/in/a.mp4", 20, 2)).is_none());
        assert_eq!(tracker.watched(Path::new("/in/a.mp4")).unwrap().unchanged_count, 1);
        assert!(tracker.observe(&sighting("/in/a.mp4", 20, 2)).is_some());
    }

    #[test]
    fn test_oscillation_counts_as_change() {
        let mut tracker = StalenessTracker::new(2);
        assert!(tracker.observe(&sighting("/in/a.mp4", 1000, 1)).is_none());
        assert!(tracker.observe(&sighting("/in/a.mp4", 1001, 2)).is_none());
        assert!(tracker.observe(&sighting("/in/a.mp4", 1000, 3)).is_none());
        assert!(tracker.observe(&sighting("/in/a.mp4", 1000, 3)).is_some());
    }

    #[test]
    fn test_zero_byte_file_follows_same_rule() {
        let mut tracker = StalenessTracker::new(2);
        assert!(tracker.observe(&sighting("/in/empty.mp4", 0, 1)).is_none());
        assert!(tracker.observe(&sighting("/in/empty.mp4", 0, 1)).is_some());
    }

    #[test]
    fn test_threshold_one_is_immediate() {
        let mut tracker = StalenessTracker::new(1);
        assert!(tracker.observe(&sighting("/in/a.mp4", 5, 1)).is_some());
    }

    #[test]
    fn test_disappearance_withdraws() {
        let mut tracker = StalenessTracker::new(3);
        tracker.observe_scan(&[sighting("/in/a.mp4", 5, 1)]);
        tracker.observe_scan(&[sighting("/in/a.mp4", 5, 1)]);
        tracker.observe_scan(&[]);
        assert!(tracker.watched(Path::new("/in/a.mp4")).is_none());

        // Starts over from one.
        assert!(tracker.observe_scan(&[sighting("/in/a.mp4", 5, 1)]).is_empty());
        assert_eq!(tracker.watched(Path::new("/in/a.mp4")).unwrap().unchanged_count, 1);
    }

    #[test]
    fn test_recreated_file_is_fresh_discovery() {
        let mut tracker = StalenessTracker::new(1);
        assert_eq!(tracker.observe_scan(&[sighting("/in/a.mp4", 5, 1)]).len(), 1);
        assert!(tracker.is_settled(Path::new("/in/a.mp4")));

        // Purged, then re-created with new content.
        tracker.observe_scan(&[]);
        assert!(!tracker.is_settled(Path::new("/in/a.mp4")));
        assert_eq!(tracker.observe_scan(&[sighting("/in/a.mp4", 7, 9)]).len(), 1);
    }

    #[test]
    fn test_settled_file_modified_in_place_is_watched_again() {
        let mut tracker = StalenessTracker::new(2);
        let first = sighting("/in/a.mp4", 5, 1);
        tracker.observe(&first);
        assert!(tracker.observe(&first).is_some());

        let touched = sighting("/in/a.mp4", 5, 2);
        assert!(tracker.observe(&touched).is_none());
        assert!(!tracker.is_settled(Path::new("/in/a.mp4")));
        assert!(tracker.observe(&touched).is_some());
    }

    #[test]
    fn test_independent_files() {
        let mut tracker = StalenessTracker::new(2);
        let a = sighting("/in/a.mp4", 5, 1);
        let b = sighting("/in/b.mp4", 6, 1);
        tracker.observe_scan(&[a.clone()]);
        let stable = tracker.observe_scan(&[a.clone(), b.clone()]);
        assert_eq!(stable.len(), 1);
        assert_eq!(stable[0].path, a.path);
        let stable = tracker.observe_scan(&[a, b.clone()]);
        assert_eq!(stable.len(), 1);
        assert_eq!(stable[0].path, b.path);
    }
}
