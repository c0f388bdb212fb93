//! Order stream access: consumer-group reads, acks and the dead-letter log.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::domain::model::{EntryId, Fields, PurchaseIntent, StreamEntry};
use crate::domain::ports::{ReadCursor, StreamStore};
use crate::error::Result;

/// Stream carrying admitted purchase intents.
pub const ORDER_STREAM: &str = "stream.orders";
/// Stream receiving entries that cannot be fulfilled.
pub const DEAD_LETTER_STREAM: &str = "stream.orders.dead";
pub const DEFAULT_GROUP: &str = "g1";
pub const DEFAULT_CONSUMER: &str = "c1";

/// Queue and redelivery settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub stream: String,
    pub dead_letter_stream: String,
    pub group: String,
    pub consumer: String,

    /// Batch size of the new-entry loop
    pub new_batch: usize,

    /// Block time of the new-entry loop
    pub new_block: Duration,

    /// Batch size of the pending loop
    pub pending_batch: usize,

    /// Block time of the pending loop
    pub pending_block: Duration,

    /// Idle time after delivery before an entry counts as stuck.
    ///
    /// Must exceed [`FulfillmentConfig::max_duration`] of the consumers, or
    /// the pending loop redelivers entries whose first delivery is still
    /// waiting on the item lock.
    ///
    /// [`FulfillmentConfig::max_duration`]: crate::fulfillment::FulfillmentConfig::max_duration
    pub pending_min_idle: Duration,

    /// Failed redeliveries before an entry is dead-lettered
    pub max_retries: u32,

    /// Expiry of the per-entry retry counter
    pub retry_ttl: Duration,

    /// Pause after a failed read
    pub error_backoff: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            stream: ORDER_STREAM.to_string(),
            dead_letter_stream: DEAD_LETTER_STREAM.to_string(),
            group: DEFAULT_GROUP.to_string(),
            consumer: DEFAULT_CONSUMER.to_string(),
            new_batch: 100,
            new_block: Duration::from_millis(200),
            pending_batch: 50,
            pending_block: Duration::from_secs(5),
            pending_min_idle: Duration::from_secs(90),
            max_retries: 3,
            retry_ttl: Duration::from_secs(24 * 60 * 60),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Durable order queue over a [`StreamStore`].
#[derive(Clone)]
pub struct OrderQueue {
    streams: Arc<dyn StreamStore>,
    config: QueueConfig,
}

impl std::fmt::Debug for OrderQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderQueue")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OrderQueue {
    pub fn new(streams: Arc<dyn StreamStore>, config: QueueConfig) -> Self {
        Self { streams, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Create the consumer group if it does not exist yet.
    pub async fn ensure_group(&self) -> Result<()> {
        let created = self
            .streams
            .create_group(&self.config.stream, &self.config.group)
            .await?;
        if created {
            debug!(stream = %self.config.stream, group = %self.config.group, "Consumer group created");
        }
        Ok(())
    }

    pub async fn append(&self, intent: &PurchaseIntent) -> Result<EntryId> {
        self.streams
            .append(&self.config.stream, intent.to_fields())
            .await
    }

    /// Entries never delivered to the group.
    pub async fn read_new(&self) -> Result<Vec<StreamEntry>> {
        self.streams
            .read_group(
                &self.config.stream,
                &self.config.group,
                &self.config.consumer,
                ReadCursor::New,
                self.config.new_batch,
                self.config.new_block,
            )
            .await
    }

    /// Delivered but unacknowledged entries that have sat idle long enough.
    pub async fn read_pending(&self) -> Result<Vec<StreamEntry>> {
        self.streams
            .read_group(
                &self.config.stream,
                &self.config.group,
                &self.config.consumer,
                ReadCursor::Pending {
                    min_idle: self.config.pending_min_idle,
                },
                self.config.pending_batch,
                self.config.pending_block,
            )
            .await
    }

    pub async fn ack(&self, id: &EntryId) -> Result<bool> {
        let acked = self
            .streams
            .ack(&self.config.stream, &self.config.group, std::slice::from_ref(id))
            .await?;
        Ok(acked > 0)
    }

    pub async fn pending_count(&self) -> Result<usize> {
        self.streams
            .pending_count(&self.config.stream, &self.config.group)
            .await
    }

    /// Copy `entry` with failure metadata to the dead-letter stream, then
    /// acknowledge the original.
    pub async fn to_dead_letter(&self, entry: &StreamEntry, reason: &str) -> Result<EntryId> {
        let mut fields = Fields::new();
        fields.insert("original_id".to_string(), entry.id.to_string());
        fields.insert("values".to_string(), serde_json::to_string(&entry.fields)?);
        fields.insert("error".to_string(), reason.to_string());
        fields.insert("time".to_string(), Utc::now().to_rfc3339());

        let dead_id = self
            .streams
            .append(&self.config.dead_letter_stream, fields)
            .await?;
        if !self.ack(&entry.id).await? {
            warn!(entry_id = %entry.id, "Dead-lettered entry was not pending");
        }
        Ok(dead_id)
    }

    pub async fn dead_letters(&self) -> Result<Vec<StreamEntry>> {
        self.streams.range(&self.config.dead_letter_stream).await
    }
}
