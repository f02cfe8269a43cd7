//! The watch service: startup reconciliation and the polling loop.
//!
//! One instance owns everything a running watcher needs: configuration,
//! registry, store, lifecycle manager, worker pool and the in-memory
//! staleness state. Each tick scans, samples sizes and claims the files that
//! just became stable; claimed tasks go to the worker pool and the tick
//! returns without waiting for them.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::scanner::Scanner;
use super::staleness::StalenessTracker;
use crate::Result;
use crate::config::AppConfig;
use crate::database::repositories::{ClaimOutcome, INTERRUPTED_BY_RESTART, TaskRepository};
use crate::pipeline::progress::{DurationProbe, spawn_progress_aggregator};
use crate::pipeline::{ProcessorRegistry, TaskLifecycleManager, WorkerPool};

/// What a single tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Files reported by the scanner.
    pub files_seen: usize,
    /// Files that became stable on this tick.
    pub stable: usize,
    pub claimed: usize,
    pub already_claimed: usize,
    /// Stable files whose source still had an earlier active task.
    pub source_busy: usize,
    /// Claims that failed with a store error.
    pub claim_errors: usize,
}

pub struct WatchService {
    config: Arc<AppConfig>,
    repo: Arc<dyn TaskRepository>,
    scanner: Scanner,
    tracker: StalenessTracker,
    lifecycle: Arc<TaskLifecycleManager>,
    pool: WorkerPool,
    progress_aggregator: JoinHandle<()>,
    cancellation_token: CancellationToken,
}

impl WatchService {
    /// Wire up the service. Must be called inside a Tokio runtime.
    pub fn new(
        config: Arc<AppConfig>,
        repo: Arc<dyn TaskRepository>,
        registry: Arc<ProcessorRegistry>,
        probe: Arc<dyn DurationProbe>,
        cancellation_token: CancellationToken,
    ) -> Self {
        let scanner = Scanner::new(registry.rule_dirs(), config.output_root.clone());
        let (progress, progress_aggregator) = spawn_progress_aggregator(repo.clone());
        let lifecycle = Arc::new(TaskLifecycleManager::new(
            repo.clone(),
            registry,
            probe,
            progress,
            config.purge_on_success,
        ));
        let pool = WorkerPool::start(
            lifecycle.clone(),
            config.worker_pool_size,
            cancellation_token.child_token(),
        );

        Self {
            tracker: StalenessTracker::new(config.staleness_threshold_count),
            config,
            repo,
            scanner,
            lifecycle,
            pool,
            progress_aggregator,
            cancellation_token,
        }
    }

    /// Fail every task left non-terminal by a previous run.
    pub async fn reconcile_startup(&self) -> Result<u64> {
        let swept = self.repo.sweep_non_terminal(INTERRUPTED_BY_RESTART).await?;
        if swept > 0 {
            warn!(count = swept, "Marked tasks interrupted by restart as failed");
        } else {
            debug!("No interrupted tasks to reconcile");
        }
        Ok(swept)
    }

    /// Run one scan and claim the files that became stable.
    pub async fn tick(&mut self) -> Result<TickReport> {
        let sightings = self.scanner.scan().await?;
        let stable = self.tracker.observe_scan(&sightings);

        let mut report = TickReport {
            files_seen: sightings.len(),
            stable: stable.len(),
            ..Default::default()
        };

        for file in stable {
            match self.lifecycle.discover(&file).await {
                Ok(ClaimOutcome::Claimed(task)) => {
                    report.claimed += 1;
                    let task_id = task.id.clone();
                    if let Err(e) = self.pool.submit(task) {
                        // The row stays CLAIMED and is swept on the next start.
                        error!(task_id = %task_id, error = %e, "Failed to queue task");
                    }
                }
                Ok(ClaimOutcome::AlreadyClaimed) => report.already_claimed += 1,
                Ok(ClaimOutcome::SourceBusy { .. }) => {
                    // Watched again from scratch so the new content is claimed
                    // once the active task has finished.
                    report.source_busy += 1;
                    self.tracker.forget(&file.path);
                }
                Err(e) => {
                    report.claim_errors += 1;
                    warn!(path = %file.path.display(), error = %e, "Claim failed, will retry once stable again");
                    self.tracker.forget(&file.path);
                }
            }
        }

        Ok(report)
    }

    /// Reconcile, then tick every polling interval until cancelled.
    ///
    /// In-flight transforms are not awaited on shutdown.
    pub async fn run(mut self) -> Result<()> {
        self.reconcile_startup().await?;

        let mut interval = tokio::time::interval(self.config.polling_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            roots = self.scanner.roots().len(),
            interval_secs = self.config.polling_interval_seconds,
            threshold = self.config.staleness_threshold_count,
            "Watching for new files"
        );

        loop {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.tick().await {
                Ok(report) if report.claimed > 0 || report.claim_errors > 0 => {
                    info!(
                        seen = report.files_seen,
                        claimed = report.claimed,
                        errors = report.claim_errors,
                        "Tick finished"
                    );
                }
                Ok(report) => debug!(seen = report.files_seen, stable = report.stable, "Tick finished"),
                Err(e) => warn!(error = %e, "Tick failed"),
            }
        }

        self.pool.stop();
        info!("Watch service stopped");
        Ok(())
    }

    /// Stop scanning and wait for every submitted task to finish, then for the
    /// final progress flush.
    pub async fn drain(self) {
        let Self {
            pool,
            lifecycle,
            progress_aggregator,
            ..
        } = self;
        pool.drain().await;
        drop(lifecycle);
        if let Err(e) = progress_aggregator.await {
            error!("Progress aggregator failed: {}", e);
        }
    }

    pub fn tracker(&self) -> &StalenessTracker {
        &self.tracker
    }
}
