//! Queue consumers.
//!
//! Two loops share one consumer identity. The new-entry loop handles fresh
//! deliveries and leaves failures pending. The pending loop picks up
//! entries that stayed unacknowledged past the idle threshold, counts
//! failed redeliveries, and dead-letters an entry once the count reaches
//! the configured maximum.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::retry::RetryTracker;
use super::stream::OrderQueue;
use crate::domain::events::DomainEvent;
use crate::domain::model::{PurchaseIntent, StreamEntry};
use crate::domain::ports::EventPublisher;
use crate::error::{Error, ErrorCategory, Result};
use crate::fulfillment::{FulfillmentOutcome, OrderFulfiller};
use crate::metrics::PipelineMetrics;

/// What happened to an entry after one processing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    DeadLettered,
    LeftPending,
}

/// Drains the order stream into the fulfillment worker.
pub struct QueueProcessor {
    queue: OrderQueue,
    retries: RetryTracker,
    fulfiller: Arc<OrderFulfiller>,
    metrics: PipelineMetrics,
    events: Arc<dyn EventPublisher>,
}

impl std::fmt::Debug for QueueProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueProcessor")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl QueueProcessor {
    pub fn new(
        queue: OrderQueue,
        retries: RetryTracker,
        fulfiller: Arc<OrderFulfiller>,
        metrics: PipelineMetrics,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            queue,
            retries,
            fulfiller,
            metrics,
            events,
        }
    }

    pub fn queue(&self) -> &OrderQueue {
        &self.queue
    }

    /// Ensure the consumer group exists and spawn both loops.
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<Vec<JoinHandle<()>>> {
        self.queue.ensure_group().await?;

        let new_loop = {
            let this = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { this.run_new_entries(cancel).await })
        };
        let pending_loop = {
            let this = self.clone();
            tokio::spawn(async move { this.run_pending_entries(cancel).await })
        };
        Ok(vec![new_loop, pending_loop])
    }

    pub async fn run_new_entries(&self, cancel: CancellationToken) {
        info!(stream = %self.queue.config().stream, "New-entry loop started");
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = self.queue.read_new() => read,
            };
            match read {
                Ok(entries) => {
                    for entry in &entries {
                        if cancel.is_cancelled() {
                            break;
                        }
                        self.process_new(entry).await;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Reading new entries failed");
                    if self.pause(&cancel).await {
                        break;
                    }
                }
            }
        }
        info!("New-entry loop stopped");
    }

    pub async fn run_pending_entries(&self, cancel: CancellationToken) {
        info!(stream = %self.queue.config().stream, "Pending loop started");
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = self.queue.read_pending() => read,
            };
            match read {
                Ok(entries) => {
                    for entry in &entries {
                        if cancel.is_cancelled() {
                            break;
                        }
                        self.process_pending(entry).await;
                    }
                    self.refresh_pending_gauge().await;
                }
                Err(e) => {
                    error!(error = %e, "Reading pending entries failed");
                    if self.pause(&cancel).await {
                        break;
                    }
                }
            }
        }
        info!("Pending loop stopped");
    }

    /// First delivery: ack on success, dead-letter what can never succeed,
    /// leave everything else for the pending loop.
    pub async fn process_new(&self, entry: &StreamEntry) -> Disposition {
        match self.handle(entry).await {
            Ok(handled) => {
                self.on_handled(entry, handled).await;
                self.ack(entry).await
            }
            Err(e) if is_terminal(&e) => self.dead_letter(entry, &e.to_string()).await,
            Err(e) => {
                warn!(entry_id = %entry.id, error = %e, "Entry failed, left pending");
                Disposition::LeftPending
            }
        }
    }

    /// Redelivery: the retry counter bounds how often an entry is tried.
    pub async fn process_pending(&self, entry: &StreamEntry) -> Disposition {
        let max_retries = self.queue.config().max_retries;
        let retries = match self.retries.get(&entry.id).await {
            Ok(count) => count,
            Err(e) => {
                warn!(entry_id = %entry.id, error = %e, "Retry count unavailable, left pending");
                return Disposition::LeftPending;
            }
        };

        if retries >= max_retries {
            let reason = format!("max retries ({}) reached", max_retries);
            let disposition = self.dead_letter(entry, &reason).await;
            self.clear_retries(entry).await;
            return disposition;
        }

        match self.handle(entry).await {
            Ok(handled) => {
                self.on_handled(entry, handled).await;
                let disposition = self.ack(entry).await;
                self.clear_retries(entry).await;
                disposition
            }
            Err(e) if is_terminal(&e) => {
                let disposition = self.dead_letter(entry, &e.to_string()).await;
                self.clear_retries(entry).await;
                disposition
            }
            Err(e) => {
                match self.retries.increment(&entry.id).await {
                    Ok(count) => warn!(
                        entry_id = %entry.id,
                        retries = count,
                        error = %e,
                        "Redelivery failed"
                    ),
                    Err(inc) => warn!(
                        entry_id = %entry.id,
                        error = %e,
                        counter_error = %inc,
                        "Redelivery failed and retry count was not recorded"
                    ),
                }
                Disposition::LeftPending
            }
        }
    }

    async fn handle(&self, entry: &StreamEntry) -> Result<(PurchaseIntent, FulfillmentOutcome)> {
        let intent = PurchaseIntent::from_fields(&entry.id, &entry.fields)?;
        let outcome = self.fulfiller.fulfill(&intent).await?;
        Ok((intent, outcome))
    }

    async fn on_handled(
        &self,
        entry: &StreamEntry,
        (intent, outcome): (PurchaseIntent, FulfillmentOutcome),
    ) {
        let entry_id = entry.id.to_string();
        let event = match outcome {
            FulfillmentOutcome::Created(order_id) => DomainEvent::order_created(
                intent.item_id,
                intent.user_id,
                order_id.0,
                &entry_id,
            ),
            FulfillmentOutcome::Duplicate => {
                DomainEvent::duplicate_order_ignored(intent.item_id, intent.user_id, &entry_id)
            }
        };
        self.publish(event).await;
    }

    async fn ack(&self, entry: &StreamEntry) -> Disposition {
        match self.queue.ack(&entry.id).await {
            Ok(_) => {
                debug!(entry_id = %entry.id, "Entry acknowledged");
                Disposition::Acked
            }
            Err(e) => {
                // Redelivery will hit the duplicate-order guard.
                warn!(entry_id = %entry.id, error = %e, "Ack failed");
                Disposition::LeftPending
            }
        }
    }

    async fn dead_letter(&self, entry: &StreamEntry, reason: &str) -> Disposition {
        match self.queue.to_dead_letter(entry, reason).await {
            Ok(dead_id) => {
                warn!(entry_id = %entry.id, dead_id = %dead_id, reason = %reason, "Entry dead-lettered");
                self.metrics.record_dead_letter();
                self.publish(DomainEvent::entry_dead_lettered(&entry.id.to_string(), reason))
                    .await;
                Disposition::DeadLettered
            }
            Err(e) => {
                error!(entry_id = %entry.id, error = %e, "Dead-lettering failed");
                Disposition::LeftPending
            }
        }
    }

    async fn clear_retries(&self, entry: &StreamEntry) {
        if let Err(e) = self.retries.clear(&entry.id).await {
            warn!(entry_id = %entry.id, error = %e, "Clearing retry count failed");
        }
    }

    async fn refresh_pending_gauge(&self) {
        match self.queue.pending_count().await {
            Ok(count) => self.metrics.set_pending(count),
            Err(e) => debug!(error = %e, "Pending count unavailable"),
        }
    }

    async fn publish(&self, event: DomainEvent) {
        if let Err(e) = self.events.publish(event).await {
            warn!(error = %e, "Failed to publish queue event");
        }
    }

    /// Sleep for the error backoff. Returns `true` if cancelled meanwhile.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(self.queue.config().error_backoff) => false,
        }
    }
}

/// Errors that no amount of redelivery can fix.
fn is_terminal(e: &Error) -> bool {
    matches!(
        e.category(),
        ErrorCategory::Permanent | ErrorCategory::Rejection
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryEventCollector, MemoryFastStore, MemoryOrderStore};
    use crate::domain::model::{Fields, InventoryItem, OrderId};
    use crate::domain::ports::{OrderStore, StreamStore};
    use crate::fulfillment::FulfillmentConfig;
    use crate::lock::{DistributedLock, LockConfig};
    use crate::queue::QueueConfig;
    use chrono::Utc;
    use std::time::Duration;

    struct Fixture {
        fast: Arc<MemoryFastStore>,
        db: Arc<MemoryOrderStore>,
        events: Arc<InMemoryEventCollector>,
        processor: QueueProcessor,
    }

    async fn fixture(stock: i64) -> Fixture {
        let fast = Arc::new(MemoryFastStore::new());
        let db = Arc::new(MemoryOrderStore::new());
        let events = Arc::new(InMemoryEventCollector::new());
        let metrics = PipelineMetrics::new().unwrap();

        let now = Utc::now();
        let mut tx = db.begin().await.unwrap();
        tx.insert_item(&InventoryItem::new(1, stock, now, now + chrono::Duration::hours(1)))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let config = QueueConfig {
            pending_min_idle: Duration::ZERO,
            pending_block: Duration::from_millis(10),
            new_block: Duration::from_millis(10),
            ..QueueConfig::default()
        };
        let queue = OrderQueue::new(fast.clone(), config.clone());
        queue.ensure_group().await.unwrap();
        let fulfiller = OrderFulfiller::new(
            db.clone(),
            DistributedLock::new(fast.clone(), LockConfig::default()),
            metrics.clone(),
            events.clone(),
            FulfillmentConfig {
                initial_backoff: Duration::from_millis(1),
                ..FulfillmentConfig::default()
            },
            CancellationToken::new(),
        );
        let retries = RetryTracker::new(fast.clone(), config.stream.clone(), config.retry_ttl);
        let processor =
            QueueProcessor::new(queue, retries, Arc::new(fulfiller), metrics, events.clone());
        Fixture {
            fast,
            db,
            events,
            processor,
        }
    }

    async fn deliver(f: &Fixture, fields: Fields) -> StreamEntry {
        f.fast.append("stream.orders", fields).await.unwrap();
        let mut entries = f.processor.queue().read_new().await.unwrap();
        assert_eq!(entries.len(), 1);
        entries.remove(0)
    }

    #[tokio::test]
    async fn test_success_acks_and_publishes() {
        let f = fixture(3).await;
        let entry = deliver(&f, PurchaseIntent::new(1, 7, OrderId(100)).to_fields()).await;

        assert_eq!(f.processor.process_new(&entry).await, Disposition::Acked);
        assert_eq!(f.processor.queue().pending_count().await.unwrap(), 0);
        assert_eq!(f.db.order_count().await, 1);
        assert_eq!(f.events.events_of_type("OrderCreated").len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_entry_goes_straight_to_dead_letter() {
        let f = fixture(3).await;
        let mut fields = Fields::new();
        fields.insert("userId".into(), "7".into());
        let entry = deliver(&f, fields).await;

        assert_eq!(f.processor.process_new(&entry).await, Disposition::DeadLettered);
        let dead = f.processor.queue().dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].fields["error"].contains("Malformed"));
        assert_eq!(f.processor.queue().pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_stays_pending_then_dead_letters() {
        let f = fixture(3).await;
        let entry = deliver(&f, PurchaseIntent::new(1, 7, OrderId(100)).to_fields()).await;
        f.db.faults().fail_always(true);

        assert_eq!(f.processor.process_new(&entry).await, Disposition::LeftPending);

        for _ in 0..3 {
            let pending = f.processor.queue().read_pending().await.unwrap();
            assert_eq!(pending.len(), 1);
            assert_eq!(
                f.processor.process_pending(&pending[0]).await,
                Disposition::LeftPending
            );
        }

        let pending = f.processor.queue().read_pending().await.unwrap();
        assert_eq!(
            f.processor.process_pending(&pending[0]).await,
            Disposition::DeadLettered
        );

        let dead = f.processor.queue().dead_letters().await.unwrap();
        assert_eq!(dead[0].fields["error"], "max retries (3) reached");
        assert_eq!(dead[0].fields["original_id"], entry.id.to_string());
        assert_eq!(f.processor.retries.get(&entry.id).await.unwrap(), 0);
        assert_eq!(f.processor.queue().pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_retry_count_leaves_entry_untouched() {
        let f = fixture(3).await;
        let entry = deliver(&f, PurchaseIntent::new(1, 7, OrderId(100)).to_fields()).await;
        f.processor.retries.increment(&entry.id).await.unwrap();
        f.processor.retries.increment(&entry.id).await.unwrap();

        let pending = f.processor.queue().read_pending().await.unwrap();
        f.fast.faults().fail_next(1);
        assert_eq!(
            f.processor.process_pending(&pending[0]).await,
            Disposition::LeftPending
        );

        assert_eq!(f.db.order_count().await, 0);
        assert_eq!(f.processor.retries.get(&entry.id).await.unwrap(), 2);
        assert_eq!(f.processor.queue().pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pending_recovery_after_outage() {
        let f = fixture(3).await;
        let entry = deliver(&f, PurchaseIntent::new(1, 7, OrderId(100)).to_fields()).await;
        f.db.faults().fail_always(true);
        assert_eq!(f.processor.process_new(&entry).await, Disposition::LeftPending);

        f.db.faults().reset();
        let pending = f.processor.queue().read_pending().await.unwrap();
        assert_eq!(f.processor.process_pending(&pending[0]).await, Disposition::Acked);
        assert_eq!(f.db.order_count().await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_acked_without_second_order() {
        let f = fixture(3).await;
        let fields = PurchaseIntent::new(1, 7, OrderId(100)).to_fields();

        let first = deliver(&f, fields.clone()).await;
        assert_eq!(f.processor.process_new(&first).await, Disposition::Acked);
        let second = deliver(&f, fields).await;
        assert_eq!(f.processor.process_new(&second).await, Disposition::Acked);

        assert_eq!(f.db.order_count().await, 1);
        assert_eq!(f.events.events_of_type("DuplicateOrderIgnored").len(), 1);
    }

    #[tokio::test]
    async fn test_loops_stop_on_cancel() {
        let f = fixture(3).await;
        let processor = Arc::new(f.processor);
        let cancel = CancellationToken::new();
        let handles = processor.clone().start(cancel.clone()).await.unwrap();

        f.fast
            .append("stream.orders", PurchaseIntent::new(1, 8, OrderId(200)).to_fields())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.db.order_count().await, 1);

        cancel.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
