//! Lease renewal task for a held lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::distributed::{DistributedLock, LockToken};

/// Handle to a running watchdog.
#[derive(Debug)]
pub struct Watchdog {
    key: String,
    cancel: CancellationToken,
    lost: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Watchdog {
    pub(super) fn spawn(
        lock: DistributedLock,
        key: String,
        token: LockToken,
        ttl: Duration,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let lost = Arc::new(AtomicBool::new(false));
        let period = (ttl / 2).max(Duration::from_millis(1));

        let task_cancel = cancel.clone();
        let task_lost = lost.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => {
                        debug!(key = %task_key, "Watchdog stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        match lock.renew(&task_key, &token, ttl).await {
                            Ok(true) => debug!(key = %task_key, "Lock lease renewed"),
                            Ok(false) => {
                                warn!(key = %task_key, "Lock renewal failed: ownership lost");
                                task_lost.store(true, Ordering::SeqCst);
                                return;
                            }
                            Err(e) => {
                                warn!(key = %task_key, error = %e, "Lock renewal failed");
                                task_lost.store(true, Ordering::SeqCst);
                                return;
                            }
                        }
                    }
                }
            }
        });

        Self {
            key,
            cancel,
            lost,
            handle,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether a renewal failed, meaning exclusivity can no longer be assumed.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Whether the renewal task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop renewing and wait for the task to exit. Returns whether ownership
    /// was lost while the watchdog ran.
    pub async fn stop(self) -> bool {
        self.cancel.cancel();
        let _ = self.handle.await;
        self.lost.load(Ordering::SeqCst)
    }
}
