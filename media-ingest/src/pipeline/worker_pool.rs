//! Bounded worker pool for claimed tasks.
//!
//! Claimed tasks are queued on an unbounded FIFO channel. A single dispatcher
//! takes them in order, waits for a semaphore permit and spawns the task into
//! a `JoinSet`, so at most `max_workers` transforms run at once and they
//! start in discovery order. Submitting never blocks the polling loop.

use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info};

use super::lifecycle::TaskLifecycleManager;
use crate::database::models::Task;
use crate::{Error, Result};

pub struct WorkerPool {
    tx: mpsc::UnboundedSender<Task>,
    dispatcher: JoinHandle<()>,
    cancellation_token: CancellationToken,
    max_workers: usize,
}

impl WorkerPool {
    /// Start the dispatcher.
    ///
    /// Cancelling `cancellation_token` stops dispatching and aborts running
    /// tasks; they are reconciled as interrupted on the next start.
    pub fn start(
        lifecycle: Arc<TaskLifecycleManager>,
        max_workers: usize,
        cancellation_token: CancellationToken,
    ) -> Self {
        let max_workers = max_workers.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        info!("Starting worker pool with {} max workers", max_workers);

        let dispatcher = tokio::spawn(dispatch(
            lifecycle,
            rx,
            Arc::new(Semaphore::new(max_workers)),
            cancellation_token.clone(),
        ));

        Self {
            tx,
            dispatcher,
            cancellation_token,
            max_workers,
        }
    }

    /// Queue a claimed task.
    pub fn submit(&self, task: Task) -> Result<()> {
        let id = task.id.clone();
        self.tx
            .send(task)
            .map_err(|_| Error::Other(format!("worker pool is stopped, cannot run task {}", id)))
    }

    /// Stop dispatching without waiting for running tasks.
    pub fn stop(&self) {
        info!("Stopping worker pool");
        self.cancellation_token.cancel();
    }

    /// Close the queue and wait until every queued task has finished.
    pub async fn drain(self) {
        let Self { tx, dispatcher, .. } = self;
        drop(tx);
        if let Err(e) = dispatcher.await {
            error!("Worker pool dispatcher failed: {}", e);
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled() && !self.dispatcher.is_finished()
    }
}

async fn dispatch(
    lifecycle: Arc<TaskLifecycleManager>,
    mut rx: mpsc::UnboundedReceiver<Task>,
    semaphore: Arc<Semaphore>,
    cancellation_token: CancellationToken,
) {
    let mut workers: JoinSet<()> = JoinSet::new();

    loop {
        let task = tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => {
                debug!(running = workers.len(), "Dispatcher cancelled");
                return;
            }
            task = rx.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };

        let permit = tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => return,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        while let Some(result) = workers.try_join_next() {
            log_join_result(result);
        }

        let lifecycle = lifecycle.clone();
        debug!(task_id = %task.id, "Dispatching task");
        workers.spawn(async move {
            let _permit = permit;
            run_task(lifecycle, task).await;
        });
    }

    // Queue closed: let the remaining tasks finish unless cancelled.
    loop {
        tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => return,
            result = workers.join_next() => match result {
                Some(result) => log_join_result(result),
                None => break,
            },
        }
    }
    debug!("Worker pool drained");
}

/// Run one task on its own Tokio task so a panicking recipe surfaces as a
/// `JoinError` and the row can still be failed. Aborting the pool entry
/// aborts the inner task too.
async fn run_task(lifecycle: Arc<TaskLifecycleManager>, task: Task) {
    let task_id = task.id.clone();
    let inner = lifecycle.clone();
    let handle = AbortOnDropHandle::new(tokio::spawn(async move {
        inner.process(task).await;
    }));

    if let Err(e) = handle.await
        && e.is_panic()
    {
        error!(task_id = %task_id, "Task panicked: {}", e);
        lifecycle.record_panic(&task_id).await;
    }
}

fn log_join_result(result: std::result::Result<(), JoinError>) {
    if let Err(e) = result
        && e.is_panic()
    {
        error!("Task worker panicked: {}", e);
    }
}
