//! Token-owned lock over the shared key/value store.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::watchdog::Watchdog;
use crate::domain::ports::KeyValueStore;
use crate::error::{Error, Result};

/// Lock key prefix for inventory items.
pub const LOCK_KEY_PREFIX: &str = "lock:voucher:";

/// Configuration for lock acquisition
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Lease length set on acquisition and on every renewal
    pub ttl: Duration,

    /// Deadline for a contended acquisition
    pub acquire_timeout: Duration,

    /// Pause between contended acquisition attempts
    pub retry_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(15),
            retry_interval: Duration::from_millis(50),
        }
    }
}

/// Proof of ownership. Never reused across acquisitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for LockToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Cross-instance mutual exclusion over a shared store.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn KeyValueStore>,
    config: LockConfig,
}

impl fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedLock")
            .field("config", &self.config)
            .finish()
    }
}

impl DistributedLock {
    pub fn new(store: Arc<dyn KeyValueStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Key under which an inventory item's lock lives.
    pub fn item_key(item_id: i64) -> String {
        format!("{}{}", LOCK_KEY_PREFIX, item_id)
    }

    /// Single attempt: set `key -> token` only if absent, expiring after `ttl`.
    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let token = LockToken::generate();
        if self.store.set_nx(key, token.as_str(), ttl).await? {
            debug!(key = %key, token = %token, "Lock acquired");
            Ok(Some(token))
        } else {
            Ok(None)
        }
    }

    /// Retry [`try_acquire`](Self::try_acquire) until `timeout` elapses.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn acquire(&self, key: &str, ttl: Duration, timeout: Duration) -> Result<LockToken> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_acquire(key, ttl).await {
                Ok(Some(token)) => return Ok(token),
                Ok(None) => {}
                // A flaky store is retried like contention until the deadline.
                Err(e) if e.is_transient() => {
                    debug!(key = %key, error = %e, "Lock attempt failed");
                }
                Err(e) => return Err(e),
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::LockTimeout {
                    key: key.to_string(),
                });
            }
            tokio::time::sleep(self.config.retry_interval.min(deadline - now)).await;
        }
    }

    /// Delete `key` only if it still holds `token`. Returns whether it did;
    /// releasing with a stale or foreign token is a no-op.
    pub async fn release(&self, key: &str, token: &LockToken) -> Result<bool> {
        let released = self.store.compare_and_delete(key, token.as_str()).await?;
        if !released {
            warn!(key = %key, token = %token, "Lock release skipped: not the owner");
        }
        Ok(released)
    }

    /// Extend the lease only if `key` still holds `token`.
    pub async fn renew(&self, key: &str, token: &LockToken, ttl: Duration) -> Result<bool> {
        self.store
            .compare_and_expire(key, token.as_str(), ttl)
            .await
    }

    /// Start a watchdog renewing `key` every `ttl / 2` until stopped,
    /// `parent` is cancelled, or a renewal fails.
    pub fn watchdog(
        &self,
        key: &str,
        token: &LockToken,
        ttl: Duration,
        parent: &CancellationToken,
    ) -> Watchdog {
        Watchdog::spawn(self.clone(), key.to_string(), token.clone(), ttl, parent)
    }
}
