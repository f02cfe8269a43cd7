//! Task database models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::path::{Path, PathBuf};

use crate::database::time::ms_to_datetime;
use crate::{Error, Result};

/// Row of the `task` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TaskDbModel {
    pub id: String,
    pub source_path: String,
    pub rule_name: String,
    /// Status: CLAIMED, RUNNING, COMPLETED, FAILED
    pub status: String,
    pub progress: i64,
    pub duration_secs: Option<f64>,
    pub output_path: Option<String>,
    /// Diagnostic text, only set when FAILED.
    pub error: Option<String>,
    /// Non-fatal note attached to a completed task (purge failure).
    pub warning: Option<String>,
    pub purged: bool,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

/// Task lifecycle states.
///
/// `Discovered` is the transient state between the staleness tracker
/// declaring a file stable and the claim; it is never persisted.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Discovered,
    Claimed,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "DISCOVERED",
            Self::Claimed => "CLAIMED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DISCOVERED" => Some(Self::Discovered),
            "CLAIMED" => Some(Self::Claimed),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// COMPLETED and FAILED accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Any non-terminal state may fail; a re-assertion of the current
    /// non-terminal state is allowed so progress updates can reuse it.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Completed | Failed, _) => false,
            (_, Failed) => true,
            (Discovered, Claimed) => true,
            (Claimed, Claimed | Running) => true,
            (Running, Running | Completed) => true,
            _ => false,
        }
    }
}

/// A task as seen by the rest of the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub source_path: PathBuf,
    pub rule_name: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub duration_secs: Option<f64>,
    pub output_path: Option<PathBuf>,
    pub error: Option<String>,
    pub warning: Option<String>,
    pub purged: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<TaskDbModel> for Task {
    type Error = Error;

    fn try_from(row: TaskDbModel) -> Result<Self> {
        let status = TaskStatus::parse(&row.status).ok_or_else(|| {
            Error::validation(format!("task {} has unknown status '{}'", row.id, row.status))
        })?;
        Ok(Self {
            status,
            progress: row.progress.clamp(0, 100) as u8,
            source_path: PathBuf::from(row.source_path),
            output_path: row.output_path.map(PathBuf::from),
            created_at: ms_to_datetime(row.created_at),
            updated_at: ms_to_datetime(row.updated_at),
            started_at: row.started_at.map(ms_to_datetime),
            completed_at: row.completed_at.map(ms_to_datetime),
            id: row.id,
            rule_name: row.rule_name,
            duration_secs: row.duration_secs,
            error: row.error,
            warning: row.warning,
            purged: row.purged,
        })
    }
}

/// Stable task identifier for a source file.
///
/// Derived from the path plus the size and last-modification time the file
/// had when it was declared stable, so an unchanged file always maps to the
/// same id while a re-created file at the same path gets a fresh one, even on
/// filesystems with coarse mtime granularity.
pub fn task_id_for(source_path: &Path, size: u64, modified_ms: i64) -> String {
    let key = format!(
        "{}\u{0}{}\u{0}{}",
        source_path.to_string_lossy(),
        size,
        modified_ms
    );
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_URL, key.as_bytes()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Claimed.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Discovered.is_terminal());
    }

    #[test]
    fn test_status_transitions() {
        assert!(TaskStatus::Discovered.can_transition_to(TaskStatus::Claimed));
        assert!(TaskStatus::Claimed.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Claimed.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Claimed.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Running));
    }

    #[test]
    fn test_status_string_forms_agree() {
        for status in [
            TaskStatus::Discovered,
            TaskStatus::Claimed,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.to_string(), status.as_str());
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_task_id_is_stable_per_fingerprint() {
        let path = Path::new("/in/video/a/clip.mp4");
        assert_eq!(task_id_for(path, 10, 1000), task_id_for(path, 10, 1000));
        assert_ne!(task_id_for(path, 10, 1000), task_id_for(path, 10, 1001));
        assert_ne!(
            task_id_for(path, 10, 1000),
            task_id_for(Path::new("/in/video/a/other.mp4"), 10, 1000)
        );
    }

    #[test]
    fn test_task_id_differs_by_size_within_same_mtime() {
        let path = Path::new("/in/video/a/clip.mp4");
        assert_ne!(task_id_for(path, 10, 1000), task_id_for(path, 11, 1000));
    }

    #[test]
    fn test_unknown_status_rejected() {
        let row = TaskDbModel {
            id: "t".to_string(),
            source_path: "/x".to_string(),
            rule_name: "r".to_string(),
            status: "PENDING".to_string(),
            progress: 0,
            duration_secs: None,
            output_path: None,
            error: None,
            warning: None,
            purged: false,
            created_at: 0,
            updated_at: 0,
            started_at: None,
            completed_at: None,
        };
        assert!(Task::try_from(row).is_err());
    }
}
