//! Task lifecycle: claim, run, record the outcome.
//!
//! ```text
//! DISCOVERED -> CLAIMED -> RUNNING -> COMPLETED (+ optional purge)
//!                  |          |
//!                  +----------+-----> FAILED
//! ```
//!
//! Every claimed task reaches COMPLETED or FAILED. Internal errors met while
//! running (store errors, output directory creation) are turned into FAILED
//! with the error text as diagnostic.

use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::processors::RecipeRequest;
use super::progress::{DurationProbe, ProgressSender, ProgressTracker};
use super::registry::ProcessorRegistry;
use crate::database::models::{Task, TaskStatus, task_id_for};
use crate::database::time::system_time_to_ms;
use crate::database::repositories::{ClaimOutcome, NewTask, TaskRepository};
use crate::utils::fs::ensure_parent_dir;
use crate::watcher::StableFile;
use crate::{Error, Result};

/// Diagnostic for files that no rule owns.
pub const UNMANAGED_PATH: &str = "unmanaged path";
/// Diagnostic for sources deleted between the claim and the run.
pub const SOURCE_VANISHED: &str = "source vanished";
/// Diagnostic for tasks whose processing panicked.
pub const RECIPE_PANICKED: &str = "recipe panicked";
/// Warning for completed tasks whose source was rewritten while they ran.
pub const SOURCE_CHANGED: &str = "purge skipped: source changed since discovery";

pub struct TaskLifecycleManager {
    repo: Arc<dyn TaskRepository>,
    registry: Arc<ProcessorRegistry>,
    probe: Arc<dyn DurationProbe>,
    progress: ProgressSender,
    purge_on_success: bool,
}

impl TaskLifecycleManager {
    pub fn new(
        repo: Arc<dyn TaskRepository>,
        registry: Arc<ProcessorRegistry>,
        probe: Arc<dyn DurationProbe>,
        progress: ProgressSender,
        purge_on_success: bool,
    ) -> Self {
        Self {
            repo,
            registry,
            probe,
            progress,
            purge_on_success,
        }
    }

    /// Claim a file the staleness tracker declared stable.
    pub async fn discover(&self, stable: &StableFile) -> Result<ClaimOutcome> {
        let rule_name = self
            .registry
            .resolve(&stable.path)
            .map(|resolved| resolved.rule.name.clone())
            .unwrap_or_default();
        let candidate = NewTask {
            id: task_id_for(&stable.path, stable.size, stable.modified_ms),
            source_path: stable.path.clone(),
            rule_name,
        };

        let outcome = self.repo.claim(&candidate).await?;
        match &outcome {
            ClaimOutcome::Claimed(task) => {
                info!(
                    task_id = %task.id,
                    rule = %task.rule_name,
                    source = %task.source_path.display(),
                    "Task claimed"
                );
            }
            ClaimOutcome::AlreadyClaimed => {
                debug!(source = %stable.path.display(), "Already claimed");
            }
            ClaimOutcome::SourceBusy { active_id } => {
                debug!(
                    source = %stable.path.display(),
                    active_id = %active_id,
                    "Source changed while an earlier task is active, will retry"
                );
            }
        }
        Ok(outcome)
    }

    /// Drive a claimed task to a terminal status.
    pub async fn process(&self, task: Task) -> Task {
        match self.execute(&task).await {
            Ok(task) => task,
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Task failed with an internal error");
                match self.fail(&task.id, &e.to_string()).await {
                    Ok(task) => task,
                    Err(e) => {
                        error!(task_id = %task.id, error = %e, "Could not record task failure");
                        task
                    }
                }
            }
        }
    }

    async fn execute(&self, task: &Task) -> Result<Task> {
        let Some(resolved) = self.registry.resolve(&task.source_path) else {
            warn!(task_id = %task.id, source = %task.source_path.display(), "No rule owns this path");
            return self.fail(&task.id, UNMANAGED_PATH).await;
        };

        if !source_exists(&task.source_path).await? {
            warn!(task_id = %task.id, source = %task.source_path.display(), "Source vanished before processing");
            return self.fail(&task.id, SOURCE_VANISHED).await;
        }

        let duration_secs = self.probe.probe_duration(&task.source_path).await;
        match duration_secs {
            Some(duration) => self.repo.set_duration(&task.id, duration).await?,
            None => warn!(task_id = %task.id, "Duration unknown, progress will not be reported"),
        }

        let output_path = self.registry.output_path(&resolved);
        ensure_parent_dir(&output_path).await?;
        self.repo.set_output_path(&task.id, &output_path).await?;

        self.repo
            .update(&task.id, TaskStatus::Running, None, None)
            .await?;
        info!(
            task_id = %task.id,
            recipe = resolved.recipe().name(),
            output = %output_path.display(),
            "Task running"
        );

        let request = RecipeRequest {
            task_id: task.id.clone(),
            source_path: task.source_path.clone(),
            output_path,
            options: resolved.rule.options.clone(),
            path_param: resolved.path_param.clone(),
            duration_secs,
        };
        let mut tracker = ProgressTracker::new(duration_secs, self.progress.reporter(&task.id));
        let outcome = resolved.recipe().invoke(&request, &mut tracker).await;

        if !outcome.success {
            let diagnostic = outcome
                .diagnostic
                .unwrap_or_else(|| format!("{} failed", resolved.recipe().name()));
            warn!(task_id = %task.id, diagnostic = %diagnostic, "Recipe failed");
            return self.fail(&task.id, &diagnostic).await;
        }

        // Without a duration there is no meaningful percentage to finalize.
        let final_progress = tracker.duration_secs().map(|_| 100u8);
        let completed = self
            .repo
            .update(&task.id, TaskStatus::Completed, final_progress, None)
            .await?;
        info!(task_id = %task.id, output = %request.output_path.display(), "Task completed");

        if self.purge_on_success {
            self.purge_source(&completed).await;
            return Ok(self.repo.get_task(&task.id).await.unwrap_or(completed));
        }
        Ok(completed)
    }

    /// Fail a task whose processing panicked.
    pub async fn record_panic(&self, id: &str) {
        if let Err(e) = self.fail(id, RECIPE_PANICKED).await {
            error!(task_id = %id, error = %e, "Could not record task failure");
        }
    }

    async fn fail(&self, id: &str, diagnostic: &str) -> Result<Task> {
        self.repo
            .update(id, TaskStatus::Failed, None, Some(diagnostic))
            .await
    }

    /// Delete the source of a completed task. Failures only leave a warning.
    ///
    /// A source rewritten since it was claimed no longer matches the task id
    /// and is kept for its own task.
    async fn purge_source(&self, task: &Task) {
        if !source_matches_task(task).await {
            warn!(task_id = %task.id, source = %task.source_path.display(), "Source changed since discovery, not purging");
            if let Err(e) = self.repo.set_warning(&task.id, SOURCE_CHANGED).await {
                warn!(task_id = %task.id, error = %e, "Failed to record purge warning");
            }
            return;
        }
        match tokio::fs::remove_file(&task.source_path).await {
            Ok(()) => {
                info!(task_id = %task.id, source = %task.source_path.display(), "Source purged");
                if let Err(e) = self.repo.mark_purged(&task.id).await {
                    warn!(task_id = %task.id, error = %e, "Failed to record purge");
                }
            }
            Err(e) => {
                let warning = format!("purge failed: {}", e);
                warn!(task_id = %task.id, source = %task.source_path.display(), error = %e, "Failed to purge source");
                if let Err(e) = self.repo.set_warning(&task.id, &warning).await {
                    warn!(task_id = %task.id, error = %e, "Failed to record purge warning");
                }
            }
        }
    }
}

/// Whether the source still has the size and mtime it was claimed with.
async fn source_matches_task(task: &Task) -> bool {
    let Ok(metadata) = tokio::fs::metadata(&task.source_path).await else {
        return true;
    };
    let modified_ms = metadata.modified().map(system_time_to_ms).unwrap_or(0);
    task_id_for(&task.source_path, metadata.len(), modified_ms) == task.id
}

async fn source_exists(path: &Path) -> Result<bool> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => Ok(metadata.is_file()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io_path("checking source", path, e)),
    }
}
