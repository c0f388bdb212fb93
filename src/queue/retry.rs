//! Per-entry retry counters kept in the fast store.

use std::sync::Arc;
use std::time::Duration;

use crate::domain::model::EntryId;
use crate::domain::ports::KeyValueStore;
use crate::error::{Error, Result};

#[derive(Clone)]
pub struct RetryTracker {
    store: Arc<dyn KeyValueStore>,
    stream: String,
    ttl: Duration,
}

impl std::fmt::Debug for RetryTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryTracker")
            .field("stream", &self.stream)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl RetryTracker {
    pub fn new(store: Arc<dyn KeyValueStore>, stream: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            stream: stream.into(),
            ttl,
        }
    }

    pub fn key(&self, id: &EntryId) -> String {
        format!("retry:{}:{}", self.stream, id)
    }

    /// Failed redeliveries recorded so far; zero if none.
    pub async fn get(&self, id: &EntryId) -> Result<u32> {
        let key = self.key(id);
        match self.store.get(&key).await? {
            None => Ok(0),
            Some(raw) => raw
                .parse()
                .map_err(|_| Error::Internal(format!("retry counter {} is not a number", key))),
        }
    }

    /// Record one more failure and refresh the counter's expiry.
    pub async fn increment(&self, id: &EntryId) -> Result<u32> {
        let key = self.key(id);
        let next = self.store.incr(&key).await?;
        self.store.expire(&key, self.ttl).await?;
        u32::try_from(next)
            .map_err(|_| Error::Internal(format!("retry counter {} out of range: {}", key, next)))
    }

    pub async fn clear(&self, id: &EntryId) -> Result<()> {
        self.store.del(&self.key(id)).await?;
        Ok(())
    }
}
