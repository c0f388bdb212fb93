//! Background refresh queue for logically expired entries.
//!
//! A bounded channel drained by a fixed pool of refresher tasks. Submitting
//! never blocks: when the channel is full the request is handed back to the
//! caller, which keeps serving the stale value.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;

/// A unit of refresh work.
pub struct RefreshTask {
    pub key: String,
    pub job: BoxFuture<'static, Result<()>>,
}

impl std::fmt::Debug for RefreshTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshTask")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Producer side of the refresh queue.
#[derive(Debug, Clone)]
pub struct RefreshQueue {
    tx: mpsc::Sender<RefreshTask>,
}

impl RefreshQueue {
    /// Start `workers` refresher tasks draining a queue of `capacity`.
    pub fn start(
        capacity: usize,
        workers: usize,
        cancel: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { run_worker(worker, rx, cancel).await })
            })
            .collect();

        (Self { tx }, handles)
    }

    /// Enqueue without waiting. Returns the task if the queue is full or closed.
    pub fn try_submit(&self, task: RefreshTask) -> std::result::Result<(), RefreshTask> {
        self.tx.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(task) | mpsc::error::TrySendError::Closed(task) => {
                task
            }
        })
    }
}

async fn run_worker(
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<RefreshTask>>>,
    cancel: CancellationToken,
) {
    loop {
        let task = tokio::select! {
            _ = cancel.cancelled() => break,
            task = async { rx.lock().await.recv().await } => task,
        };
        let Some(task) = task else { break };

        match task.job.await {
            Ok(()) => debug!(worker, key = %task.key, "Cache entry refreshed"),
            Err(e) => warn!(worker, key = %task.key, error = %e, "Cache refresh failed"),
        }
    }
    debug!(worker, "Cache refresher stopped");
}
