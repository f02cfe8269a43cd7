//! Task repository.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::database::models::{Task, TaskDbModel, TaskStatus};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::database::{DbPool, begin_immediate};
use crate::{Error, Result};

/// Diagnostic stored on tasks swept at startup.
pub const INTERRUPTED_BY_RESTART: &str = "interrupted by restart";

/// A stable file about to be claimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub id: String,
    pub source_path: PathBuf,
    pub rule_name: String,
}

/// Result of a claim attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// A fresh CLAIMED row was written.
    Claimed(Task),
    /// A row with this exact id exists; the file was already handled.
    AlreadyClaimed,
    /// Another task for the same source is still CLAIMED or RUNNING.
    SourceBusy { active_id: String },
}

/// Task repository trait.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Atomically record a new CLAIMED task unless the file is already owned.
    async fn claim(&self, task: &NewTask) -> Result<ClaimOutcome>;

    /// Move a task to `status`, optionally setting progress and a diagnostic.
    ///
    /// Terminal rows are never modified; such attempts fail with
    /// [`Error::InvalidStateTransition`].
    async fn update(
        &self,
        id: &str,
        status: TaskStatus,
        progress: Option<u8>,
        error: Option<&str>,
    ) -> Result<Task>;

    /// Raise the progress of a RUNNING task. Returns whether a row changed.
    async fn update_progress(&self, id: &str, progress: u8) -> Result<bool>;

    /// Apply a batch of progress updates in one transaction.
    async fn update_progress_batch(&self, updates: &[(String, u8)]) -> Result<usize>;

    async fn set_duration(&self, id: &str, duration_secs: f64) -> Result<()>;
    async fn set_output_path(&self, id: &str, output_path: &Path) -> Result<()>;
    async fn mark_purged(&self, id: &str) -> Result<()>;
    async fn set_warning(&self, id: &str, warning: &str) -> Result<()>;

    async fn get_task(&self, id: &str) -> Result<Task>;

    /// Mark every CLAIMED or RUNNING task FAILED with `reason`.
    async fn sweep_non_terminal(&self, reason: &str) -> Result<u64>;

    /// All tasks, newest first.
    async fn list_all(&self) -> Result<Vec<Task>>;
}

/// SQLx implementation of TaskRepository.
#[derive(Clone)]
pub struct SqlxTaskRepository {
    pool: DbPool,
}

impl SqlxTaskRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn try_claim(&self, task: &NewTask) -> Result<ClaimOutcome> {
        let source = task.source_path.to_string_lossy().into_owned();
        let mut tx = begin_immediate(&self.pool).await?;

        let existing: Option<(String, String)> = sqlx::query_as(
            r#"
            SELECT id, status FROM task
            WHERE id = ? OR (source_path = ? AND status IN ('CLAIMED', 'RUNNING'))
            ORDER BY id = ? DESC
            LIMIT 1
            "#,
        )
        .bind(&task.id)
        .bind(&source)
        .bind(&task.id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((id, status)) = existing {
            tx.rollback().await?;
            if id == task.id {
                debug!(task_id = %id, status = %status, source = %source, "Claim skipped, task already recorded");
                return Ok(ClaimOutcome::AlreadyClaimed);
            }
            debug!(active_id = %id, source = %source, "Claim skipped, source has an active task");
            return Ok(ClaimOutcome::SourceBusy { active_id: id });
        }

        let now = now_ms();
        sqlx::query(
            r#"
            INSERT INTO task (id, source_path, rule_name, status, progress, created_at, updated_at)
            VALUES (?, ?, ?, 'CLAIMED', 0, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&source)
        .bind(&task.rule_name)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, TaskDbModel>("SELECT * FROM task WHERE id = ?")
            .bind(&task.id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(ClaimOutcome::Claimed(Task::try_from(row)?))
    }

    async fn try_update(
        &self,
        id: &str,
        status: TaskStatus,
        progress: Option<u8>,
        error: Option<&str>,
    ) -> Result<Task> {
        if error.is_some() && status != TaskStatus::Failed {
            return Err(Error::validation(format!(
                "a diagnostic can only be recorded on FAILED tasks, not {}",
                status
            )));
        }
        if status == TaskStatus::Discovered {
            return Err(Error::validation("DISCOVERED is never persisted"));
        }

        let mut tx = begin_immediate(&self.pool).await?;
        let current: Option<(String,)> = sqlx::query_as("SELECT status FROM task WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some((current,)) = current else {
            tx.rollback().await?;
            return Err(Error::not_found("Task", id));
        };
        let Some(current_status) = TaskStatus::parse(&current) else {
            tx.rollback().await?;
            return Err(Error::validation(format!(
                "task {} has unknown status '{}'",
                id, current
            )));
        };
        if !current_status.can_transition_to(status) {
            tx.rollback().await?;
            return Err(Error::invalid_transition(current_status, status));
        }

        let now = now_ms();
        let started_at = (status == TaskStatus::Running).then_some(now);
        let completed_at = status.is_terminal().then_some(now);
        sqlx::query(
            r#"
            UPDATE task SET
                status = ?,
                progress = COALESCE(?, progress),
                error = COALESCE(?, error),
                started_at = COALESCE(started_at, ?),
                completed_at = COALESCE(?, completed_at),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(progress.map(|p| i64::from(p.min(100))))
        .bind(error)
        .bind(started_at)
        .bind(completed_at)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, TaskDbModel>("SELECT * FROM task WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        Task::try_from(row)
    }

    async fn try_update_progress_batch(&self, updates: &[(String, u8)]) -> Result<usize> {
        let mut tx = begin_immediate(&self.pool).await?;
        let now = now_ms();
        let mut changed = 0usize;
        for (id, progress) in updates {
            let result = sqlx::query(
                "UPDATE task SET progress = MAX(progress, ?), updated_at = ? WHERE id = ? AND status = 'RUNNING'",
            )
            .bind(i64::from((*progress).min(100)))
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() > 0 {
                changed += 1;
            }
        }
        tx.commit().await?;
        Ok(changed)
    }
}

#[async_trait]
impl TaskRepository for SqlxTaskRepository {
    async fn claim(&self, task: &NewTask) -> Result<ClaimOutcome> {
        retry_on_sqlite_busy("claim_task", || self.try_claim(task)).await
    }

    async fn update(
        &self,
        id: &str,
        status: TaskStatus,
        progress: Option<u8>,
        error: Option<&str>,
    ) -> Result<Task> {
        retry_on_sqlite_busy("update_task", || {
            self.try_update(id, status, progress, error)
        })
        .await
    }

    async fn update_progress(&self, id: &str, progress: u8) -> Result<bool> {
        let updates = [(id.to_string(), progress)];
        let changed = self.update_progress_batch(&updates).await?;
        Ok(changed > 0)
    }

    async fn update_progress_batch(&self, updates: &[(String, u8)]) -> Result<usize> {
        if updates.is_empty() {
            return Ok(0);
        }
        retry_on_sqlite_busy("update_task_progress", || {
            self.try_update_progress_batch(updates)
        })
        .await
    }

    async fn set_duration(&self, id: &str, duration_secs: f64) -> Result<()> {
        retry_on_sqlite_busy("set_task_duration", || async move {
            sqlx::query(
                "UPDATE task SET duration_secs = ?, updated_at = ? WHERE id = ? AND status IN ('CLAIMED', 'RUNNING')",
            )
            .bind(duration_secs)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn set_output_path(&self, id: &str, output_path: &Path) -> Result<()> {
        let output_path = output_path.to_string_lossy().into_owned();
        let output_path = output_path.as_str();
        retry_on_sqlite_busy("set_task_output_path", || async move {
            sqlx::query(
                "UPDATE task SET output_path = ?, updated_at = ? WHERE id = ? AND status IN ('CLAIMED', 'RUNNING')",
            )
            .bind(output_path)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn mark_purged(&self, id: &str) -> Result<()> {
        retry_on_sqlite_busy("mark_task_purged", || async move {
            sqlx::query("UPDATE task SET purged = 1, updated_at = ? WHERE id = ?")
                .bind(now_ms())
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn set_warning(&self, id: &str, warning: &str) -> Result<()> {
        retry_on_sqlite_busy("set_task_warning", || async move {
            sqlx::query("UPDATE task SET warning = ?, updated_at = ? WHERE id = ?")
                .bind(warning)
                .bind(now_ms())
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn get_task(&self, id: &str) -> Result<Task> {
        let row = sqlx::query_as::<_, TaskDbModel>("SELECT * FROM task WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Task", id))?;
        Task::try_from(row)
    }

    async fn sweep_non_terminal(&self, reason: &str) -> Result<u64> {
        retry_on_sqlite_busy("sweep_non_terminal_tasks", || async move {
            let now = now_ms();
            let result = sqlx::query(
                r#"
                UPDATE task SET
                    status = 'FAILED',
                    error = ?,
                    completed_at = ?,
                    updated_at = ?
                WHERE status IN ('CLAIMED', 'RUNNING')
                "#,
            )
            .bind(reason)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn list_all(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskDbModel>(
            "SELECT * FROM task ORDER BY created_at DESC, rowid DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Task::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{init_pool, run_migrations};

    async fn setup() -> (tempfile::TempDir, SqlxTaskRepository) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!(
            "sqlite:{}?mode=rwc",
            dir.path().join("tasks.db").to_string_lossy()
        );
        let pool = init_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        (dir, SqlxTaskRepository::new(pool))
    }

    fn new_task(id: &str, source: &str) -> NewTask {
        NewTask {
            id: id.to_string(),
            source_path: PathBuf::from(source),
            rule_name: "scale".to_string(),
        }
    }

    #[tokio::test]
    async fn test_claim_then_duplicate_is_already_claimed() {
        let (_dir, repo) = setup().await;
        let task = new_task("t1", "/in/scale/a.mp4");

        let ClaimOutcome::Claimed(claimed) = repo.claim(&task).await.unwrap() else {
            panic!("first claim should succeed");
        };
        assert_eq!(claimed.status, TaskStatus::Claimed);
        assert_eq!(claimed.progress, 0);
        assert_eq!(claimed.rule_name, "scale");

        assert_eq!(repo.claim(&task).await.unwrap(), ClaimOutcome::AlreadyClaimed);
        assert_eq!(repo.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_active_source_blocks_second_id() {
        let (_dir, repo) = setup().await;
        repo.claim(&new_task("t1", "/in/scale/a.mp4")).await.unwrap();
        let outcome = repo.claim(&new_task("t2", "/in/scale/a.mp4")).await.unwrap();
        assert_eq!(
            outcome,
            ClaimOutcome::SourceBusy {
                active_id: "t1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_terminal_source_allows_new_id() {
        let (_dir, repo) = setup().await;
        repo.claim(&new_task("t1", "/in/scale/a.mp4")).await.unwrap();
        repo.update("t1", TaskStatus::Failed, None, Some("boom"))
            .await
            .unwrap();

        let outcome = repo.claim(&new_task("t2", "/in/scale/a.mp4")).await.unwrap();
        assert!(matches!(outcome, ClaimOutcome::Claimed(_)));
        // The terminal id itself stays taken.
        let again = repo.claim(&new_task("t1", "/in/scale/a.mp4")).await.unwrap();
        assert_eq!(again, ClaimOutcome::AlreadyClaimed);
    }

    #[tokio::test]
    async fn test_full_lifecycle_and_terminal_is_final() {
        let (_dir, repo) = setup().await;
        repo.claim(&new_task("t1", "/in/scale/a.mp4")).await.unwrap();

        let running = repo.update("t1", TaskStatus::Running, None, None).await.unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert!(running.started_at.is_some());

        assert!(repo.update_progress("t1", 40).await.unwrap());
        let done = repo
            .update("t1", TaskStatus::Completed, Some(100), None)
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.progress, 100);
        assert!(done.completed_at.is_some());
        assert!(done.error.is_none());

        let err = repo
            .update("t1", TaskStatus::Running, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
        let err = repo
            .update("t1", TaskStatus::Failed, None, Some("late"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));

        assert!(!repo.update_progress("t1", 10).await.unwrap());
        assert_eq!(repo.get_task("t1").await.unwrap().progress, 100);
    }

    #[tokio::test]
    async fn test_progress_never_decreases() {
        let (_dir, repo) = setup().await;
        repo.claim(&new_task("t1", "/in/scale/a.mp4")).await.unwrap();

        // Not RUNNING yet.
        assert!(!repo.update_progress("t1", 10).await.unwrap());

        repo.update("t1", TaskStatus::Running, None, None).await.unwrap();
        repo.update_progress("t1", 60).await.unwrap();
        repo.update_progress("t1", 20).await.unwrap();
        assert_eq!(repo.get_task("t1").await.unwrap().progress, 60);
    }

    #[tokio::test]
    async fn test_error_only_on_failed() {
        let (_dir, repo) = setup().await;
        repo.claim(&new_task("t1", "/in/scale/a.mp4")).await.unwrap();
        let err = repo
            .update("t1", TaskStatus::Running, None, Some("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_claimed_cannot_complete_directly() {
        let (_dir, repo) = setup().await;
        repo.claim(&new_task("t1", "/in/scale/a.mp4")).await.unwrap();
        let err = repo
            .update("t1", TaskStatus::Completed, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_update_missing_task_is_not_found() {
        let (_dir, repo) = setup().await;
        let err = repo
            .update("missing", TaskStatus::Running, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_sweep_non_terminal() {
        let (_dir, repo) = setup().await;
        repo.claim(&new_task("claimed", "/in/scale/a.mp4")).await.unwrap();
        repo.claim(&new_task("running", "/in/scale/b.mp4")).await.unwrap();
        repo.claim(&new_task("done", "/in/scale/c.mp4")).await.unwrap();
        repo.update("running", TaskStatus::Running, None, None).await.unwrap();
        repo.update("done", TaskStatus::Running, None, None).await.unwrap();
        repo.update("done", TaskStatus::Completed, Some(100), None)
            .await
            .unwrap();

        let swept = repo.sweep_non_terminal(INTERRUPTED_BY_RESTART).await.unwrap();
        assert_eq!(swept, 2);

        for id in ["claimed", "running"] {
            let task = repo.get_task(id).await.unwrap();
            assert_eq!(task.status, TaskStatus::Failed);
            assert_eq!(task.error.as_deref(), Some(INTERRUPTED_BY_RESTART));
        }
        assert_eq!(
            repo.get_task("done").await.unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_metadata_setters() {
        let (_dir, repo) = setup().await;
        repo.claim(&new_task("t1", "/in/scale/a.mp4")).await.unwrap();
        repo.set_duration("t1", 12.5).await.unwrap();
        repo.set_output_path("t1", Path::new("/out/scaled/a.mkv"))
            .await
            .unwrap();
        repo.update("t1", TaskStatus::Running, None, None).await.unwrap();
        repo.update("t1", TaskStatus::Completed, Some(100), None)
            .await
            .unwrap();
        repo.mark_purged("t1").await.unwrap();
        repo.set_warning("t1", "purge failed").await.unwrap();

        let task = repo.get_task("t1").await.unwrap();
        assert_eq!(task.duration_secs, Some(12.5));
        assert_eq!(task.output_path, Some(PathBuf::from("/out/scaled/a.mkv")));
        assert!(task.purged);
        assert_eq!(task.warning.as_deref(), Some("purge failed"));
    }

    #[tokio::test]
    async fn test_list_all_newest_first() {
        let (_dir, repo) = setup().await;
        repo.claim(&new_task("first", "/in/scale/a.mp4")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        repo.claim(&new_task("second", "/in/scale/b.mp4")).await.unwrap();

        let ids: Vec<String> = repo
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec!["second".to_string(), "first".to_string()]);
    }
}
