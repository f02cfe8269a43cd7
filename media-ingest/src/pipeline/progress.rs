//! Progress bridge between the transcoder's output and the task store.
//!
//! Recipes feed every output line to a [`ProgressTracker`], which turns
//! elapsed media time into a percentage of the probed duration. Percent
//! changes travel through a [`ProgressReporter`] to a single aggregator task
//! that coalesces them and writes the latest value per task every
//! [`PROGRESS_FLUSH_INTERVAL_MS`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::database::repositories::TaskRepository;

/// Flush cadence of the progress aggregator.
pub const PROGRESS_FLUSH_INTERVAL_MS: u64 = 250;

/// Capacity of the progress channel. Updates are dropped when it is full;
/// a later, larger value supersedes them anyway.
const PROGRESS_CHANNEL_CAPACITY: usize = 1024;

/// Source of media durations.
#[async_trait]
pub trait DurationProbe: Send + Sync {
    /// Duration in seconds, or `None` when it cannot be determined.
    async fn probe_duration(&self, path: &Path) -> Option<f64>;
}

/// Duration probe backed by `ffprobe`.
#[derive(Debug, Clone)]
pub struct FfprobeDurationProbe {
    ffprobe_path: String,
}

impl FfprobeDurationProbe {
    pub fn new(ffprobe_path: impl Into<String>) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
        }
    }
}

#[async_trait]
impl DurationProbe for FfprobeDurationProbe {
    async fn probe_duration(&self, path: &Path) -> Option<f64> {
        let output = Command::new(&self.ffprobe_path)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                warn!(path = %path.display(), error = %e, ffprobe = %self.ffprobe_path, "Failed to run ffprobe");
                return None;
            }
        };
        if !output.status.success() {
            warn!(
                path = %path.display(),
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "ffprobe could not read the duration"
            );
            return None;
        }

        let duration = parse_duration_output(&String::from_utf8_lossy(&output.stdout));
        if duration.is_none() {
            warn!(path = %path.display(), "ffprobe reported no usable duration");
        }
        duration
    }
}

/// Parse the single value printed by `ffprobe -show_entries format=duration`.
pub fn parse_duration_output(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())?
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs > 0.0)
}

/// Parse an `HH:MM:SS.xx` timestamp into seconds.
pub fn parse_time(time_str: &str) -> Option<f64> {
    let mut parts = time_str.trim().split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Extract the elapsed media time, in seconds, from one line of ffmpeg output.
///
/// Understands the `-progress` key/value lines (`out_time_us=`,
/// `out_time_ms=`, both in microseconds, and `out_time=`) as well as the
/// `time=` field of the classic stderr statistics line.
pub fn parse_elapsed(line: &str) -> Option<f64> {
    let line = line.trim();
    for key in ["out_time_us=", "out_time_ms="] {
        if let Some(value) = line.strip_prefix(key) {
            let micros: i64 = value.trim().parse().ok()?;
            return Some(micros as f64 / 1_000_000.0);
        }
    }

    let start = line.find("time=")?;
    let value = &line[start + 5..];
    let end = value.find(char::is_whitespace).unwrap_or(value.len());
    parse_time(&value[..end])
}

/// Percent of `duration` covered by `elapsed`, floored and capped at 100.
pub fn percent_of(elapsed: f64, duration: f64) -> u8 {
    if duration <= 0.0 || !elapsed.is_finite() || elapsed <= 0.0 {
        return 0;
    }
    let percent = (100.0 * elapsed.min(duration) / duration).floor();
    percent.clamp(0.0, 100.0) as u8
}

/// A percent change for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub task_id: String,
    pub percent: u8,
}

/// Per-task handle forwarding percent changes to the aggregator.
#[derive(Clone)]
pub struct ProgressReporter {
    task_id: String,
    tx: mpsc::Sender<ProgressUpdate>,
}

impl ProgressReporter {
    pub fn new(task_id: impl Into<String>, tx: mpsc::Sender<ProgressUpdate>) -> Self {
        Self {
            task_id: task_id.into(),
            tx,
        }
    }

    pub fn noop(task_id: impl Into<String>) -> Self {
        let (tx, _rx) = mpsc::channel::<ProgressUpdate>(1);
        Self::new(task_id, tx)
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Queue an update without waiting. Returns whether it was queued.
    ///
    /// A full channel drops the update; a later, higher value replaces it.
    pub fn report(&self, percent: u8) -> bool {
        match self.tx.try_send(ProgressUpdate {
            task_id: self.task_id.clone(),
            percent,
        }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(update)) => {
                trace!(task_id = %update.task_id, percent = update.percent, "Progress channel full, update dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Turns transcoder output into monotonic percent updates.
pub struct ProgressTracker {
    duration_secs: Option<f64>,
    max_elapsed: f64,
    percent: u8,
    reporter: ProgressReporter,
}

impl ProgressTracker {
    pub fn new(duration_secs: Option<f64>, reporter: ProgressReporter) -> Self {
        Self {
            duration_secs: duration_secs.filter(|d| d.is_finite() && *d > 0.0),
            max_elapsed: 0.0,
            percent: 0,
            reporter,
        }
    }

    /// Feed one output line. Returns the new percent when it increased.
    pub fn observe_line(&mut self, line: &str) -> Option<u8> {
        let elapsed = parse_elapsed(line)?;
        self.observe_elapsed(elapsed)
    }

    /// Feed an elapsed time in seconds. Returns the new percent when it increased.
    pub fn observe_elapsed(&mut self, elapsed: f64) -> Option<u8> {
        if !elapsed.is_finite() || elapsed <= self.max_elapsed {
            return None;
        }
        let duration = self.duration_secs?;
        self.max_elapsed = elapsed.min(duration);

        let percent = percent_of(self.max_elapsed, duration);
        if percent <= self.percent {
            return None;
        }
        self.percent = percent;
        self.reporter.report(percent);
        Some(percent)
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    pub fn duration_secs(&self) -> Option<f64> {
        self.duration_secs
    }

    pub fn task_id(&self) -> &str {
        self.reporter.task_id()
    }
}

/// Sending side of the progress aggregator.
#[derive(Clone)]
pub struct ProgressSender {
    tx: mpsc::Sender<ProgressUpdate>,
}

impl ProgressSender {
    pub fn reporter(&self, task_id: impl Into<String>) -> ProgressReporter {
        ProgressReporter::new(task_id, self.tx.clone())
    }
}

/// Spawn the aggregator that persists progress updates.
///
/// The task exits, after a final flush, once every [`ProgressSender`] and
/// [`ProgressReporter`] has been dropped.
pub fn spawn_progress_aggregator(
    repo: Arc<dyn TaskRepository>,
) -> (ProgressSender, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<ProgressUpdate>(PROGRESS_CHANNEL_CAPACITY);

    let handle = tokio::spawn(async move {
        let mut pending: HashMap<String, u8> = HashMap::new();
        let flush_every = std::time::Duration::from_millis(PROGRESS_FLUSH_INTERVAL_MS);
        let mut tick = tokio::time::interval(flush_every);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    flush(repo.as_ref(), &mut pending).await;
                }
                update = rx.recv() => {
                    let Some(update) = update else { break; };
                    let entry = pending.entry(update.task_id).or_insert(0);
                    *entry = (*entry).max(update.percent);
                }
            }
        }

        flush(repo.as_ref(), &mut pending).await;
        debug!("Progress aggregator stopped");
    });

    (ProgressSender { tx }, handle)
}

async fn flush(repo: &dyn TaskRepository, pending: &mut HashMap<String, u8>) {
    if pending.is_empty() {
        return;
    }
    let updates: Vec<(String, u8)> = pending.drain().collect();
    if let Err(e) = repo.update_progress_batch(&updates).await {
        warn!(error = %e, tasks = updates.len(), "Failed to persist progress");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("00:00:10.50"), Some(10.5));
        assert_eq!(parse_time("01:30:00.00"), Some(5400.0));
        assert_eq!(parse_time("invalid"), None);
        assert_eq!(parse_time("00:10"), None);
        assert_eq!(parse_time("N/A"), None);
    }

    #[test]
    fn test_parse_elapsed_variants() {
        assert_eq!(
            parse_elapsed("frame=  120 fps= 30 q=28.0 size=  256kB time=00:00:04.00 bitrate= 524.3kbits/s speed=1.01x"),
            Some(4.0)
        );
        assert_eq!(parse_elapsed("out_time=00:00:02.500000"), Some(2.5));
        assert_eq!(parse_elapsed("out_time_us=1500000"), Some(1.5));
        assert_eq!(parse_elapsed("out_time_ms=3000000"), Some(3.0));
        assert_eq!(parse_elapsed("time=N/A bitrate=N/A"), None);
        assert_eq!(parse_elapsed("progress=continue"), None);
        assert_eq!(parse_elapsed("out_time_us=N/A"), None);
    }

    #[test]
    fn test_percent_of() {
        assert_eq!(percent_of(5.0, 10.0), 50);
        assert_eq!(percent_of(9.99, 10.0), 99);
        assert_eq!(percent_of(15.0, 10.0), 100);
        assert_eq!(percent_of(-1.0, 10.0), 0);
        assert_eq!(percent_of(1.0, 0.0), 0);
    }

    #[test]
    fn test_parse_duration_output() {
        assert_eq!(parse_duration_output("12.345000\n"), Some(12.345));
        assert_eq!(parse_duration_output("N/A\n"), None);
        assert_eq!(parse_duration_output(""), None);
        assert_eq!(parse_duration_output("0.000000"), None);
    }

    #[test]
    fn test_tracker_is_monotonic_and_capped() {
        let mut tracker = ProgressTracker::new(Some(10.0), ProgressReporter::noop("t"));
        assert_eq!(tracker.observe_line("out_time_us=2000000"), Some(20));
        // Regressions and repeats are ignored.
        assert_eq!(tracker.observe_line("out_time_us=1000000"), None);
        assert_eq!(tracker.observe_line("out_time_us=2000000"), None);
        assert_eq!(tracker.observe_line("garbage"), None);
        assert_eq!(tracker.observe_line("time=00:00:25.00"), Some(100));
        assert_eq!(tracker.observe_line("time=00:00:30.00"), None);
        assert_eq!(tracker.percent(), 100);
    }

    #[test]
    fn test_tracker_without_duration_never_moves() {
        let mut tracker = ProgressTracker::new(None, ProgressReporter::noop("t"));
        assert_eq!(tracker.observe_line("out_time_us=2000000"), None);
        assert_eq!(tracker.percent(), 0);

        let tracker = ProgressTracker::new(Some(0.0), ProgressReporter::noop("t"));
        assert_eq!(tracker.duration_secs(), None);
    }

    #[tokio::test]
    async fn test_reporter_forwards_updates() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut tracker = ProgressTracker::new(Some(4.0), ProgressReporter::new("task-1", tx));
        tracker.observe_elapsed(1.0);
        tracker.observe_elapsed(3.0);

        assert_eq!(
            rx.recv().await,
            Some(ProgressUpdate {
                task_id: "task-1".to_string(),
                percent: 25
            })
        );
        assert_eq!(rx.recv().await.map(|u| u.percent), Some(75));
    }

    #[test]
    fn test_full_channel_drops_update() {
        let (tx, _rx) = mpsc::channel(1);
        let reporter = ProgressReporter::new("task-1", tx);
        assert!(reporter.report(10));
        assert!(!reporter.report(20));
    }
}
