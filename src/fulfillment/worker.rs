//! Fulfillment worker.
//!
//! One attempt runs as:
//!
//! ```text
//! acquire lock:voucher:{item} ──► start watchdog
//!   begin
//!     existing order for (user, item)?   -> DuplicateOrder
//!     stock = stock - 1 WHERE stock > 0  -> 0 rows: classify
//!     insert order
//!   lock still ours? commit : rollback
//! stop watchdog ──► release (token checked)
//! ```
//!
//! Transient failures are retried a few times with exponential backoff
//! before the error is handed back to the queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::domain::events::DomainEvent;
use crate::domain::model::{Order, OrderId, PurchaseIntent};
use crate::domain::ports::{EventPublisher, OrderStore, StoreTransaction};
use crate::error::{Error, Result};
use crate::lock::{DistributedLock, Watchdog};
use crate::metrics::PipelineMetrics;

/// Fulfillment settings.
#[derive(Debug, Clone)]
pub struct FulfillmentConfig {
    /// Lease of the per-item lock
    pub lock_ttl: Duration,

    /// How long to wait for the per-item lock
    pub lock_timeout: Duration,

    /// Deadline of one durable transaction
    pub tx_timeout: Duration,

    /// Attempts per delivery, including the first
    pub max_attempts: u32,

    /// Backoff before the second attempt; doubles afterwards
    pub initial_backoff: Duration,
}

impl Default for FulfillmentConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(10),
            lock_timeout: Duration::from_secs(15),
            tx_timeout: Duration::from_secs(5),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
        }
    }
}

impl FulfillmentConfig {
    /// Longest a single `fulfill` call can run: every attempt waiting out
    /// the lock and the transaction deadline, plus the backoffs between.
    pub fn max_duration(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        let per_attempt = (self.lock_timeout + self.tx_timeout) * attempts;
        let backoffs: Duration = (0..attempts - 1)
            .map(|n| self.initial_backoff * 2u32.saturating_pow(n))
            .sum();
        per_attempt + backoffs
    }
}

/// Result of handling one intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FulfillmentOutcome {
    /// A new order row was committed.
    Created(OrderId),
    /// The order already existed; nothing was written.
    Duplicate,
}

/// Persists orders for admitted intents.
pub struct OrderFulfiller {
    store: Arc<dyn OrderStore>,
    lock: DistributedLock,
    metrics: PipelineMetrics,
    events: Arc<dyn EventPublisher>,
    config: FulfillmentConfig,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for OrderFulfiller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderFulfiller")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OrderFulfiller {
    pub fn new(
        store: Arc<dyn OrderStore>,
        lock: DistributedLock,
        metrics: PipelineMetrics,
        events: Arc<dyn EventPublisher>,
        config: FulfillmentConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            lock,
            metrics,
            events,
            config,
            shutdown,
        }
    }

    pub fn config(&self) -> &FulfillmentConfig {
        &self.config
    }

    /// Fulfill an intent, retrying transient failures within this call.
    #[instrument(skip(self, intent), fields(item_id = intent.item_id, user_id = intent.user_id, order_id = %intent.order_id))]
    pub async fn fulfill(&self, intent: &PurchaseIntent) -> Result<FulfillmentOutcome> {
        let started = Instant::now();
        let mut backoff = self.config.initial_backoff;
        let mut attempt = 1;

        loop {
            match self.fulfill_once(intent).await {
                Ok(order_id) => {
                    self.metrics.record_fulfillment("created", started.elapsed());
                    info!(order_id = %order_id, "Order created");
                    return Ok(FulfillmentOutcome::Created(order_id));
                }
                Err(Error::DuplicateOrder { .. }) => {
                    self.metrics
                        .record_fulfillment("duplicate", started.elapsed());
                    info!("Order already exists, skipping");
                    return Ok(FulfillmentOutcome::Duplicate);
                }
                Err(e) if e.is_transient() && attempt < self.config.max_attempts => {
                    debug!(attempt, error = %e, "Fulfillment attempt failed, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    self.metrics.record_fulfillment("failed", started.elapsed());
                    warn!(attempt, error = %e, "Fulfillment failed");
                    return Err(e);
                }
            }
        }
    }

    async fn fulfill_once(&self, intent: &PurchaseIntent) -> Result<OrderId> {
        let key = DistributedLock::item_key(intent.item_id);
        let token = match self
            .lock
            .acquire(&key, self.config.lock_ttl, self.config.lock_timeout)
            .await
        {
            Ok(token) => token,
            Err(e) => {
                if matches!(e, Error::LockTimeout { .. }) {
                    self.metrics.record_lock_contention();
                }
                return Err(e);
            }
        };

        let watchdog = self
            .lock
            .watchdog(&key, &token, self.config.lock_ttl, &self.shutdown);

        let result = match tokio::time::timeout(
            self.config.tx_timeout,
            self.write_order(intent, &watchdog),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "order transaction for item {}",
                intent.item_id
            ))),
        };

        watchdog.stop().await;
        if let Err(e) = self.lock.release(&key, &token).await {
            warn!(key = %key, error = %e, "Lock release failed");
        }
        result
    }

    async fn write_order(&self, intent: &PurchaseIntent, watchdog: &Watchdog) -> Result<OrderId> {
        let mut tx = self.store.begin().await?;

        if let Err(e) = apply(tx.as_mut(), intent).await {
            rollback(tx).await;
            return Err(e);
        }

        if watchdog.is_lost() {
            rollback(tx).await;
            let key = watchdog.key().to_string();
            if let Err(e) = self.events.publish(DomainEvent::lock_lost(&key)).await {
                warn!(error = %e, "Failed to publish lock event");
            }
            return Err(Error::LockLost { key });
        }

        tx.commit().await?;
        Ok(intent.order_id)
    }
}

async fn apply(tx: &mut dyn StoreTransaction, intent: &PurchaseIntent) -> Result<()> {
    let item_id = intent.item_id;

    if tx.has_order(intent.user_id, item_id).await? {
        return Err(Error::DuplicateOrder {
            item_id,
            user_id: intent.user_id,
        });
    }

    if tx.decrement_stock(item_id).await? == 0 {
        return Err(match tx.item_stock(item_id).await? {
            None => Error::ItemNotFound(item_id),
            Some(stock) if stock <= 0 => Error::InsufficientStock { item_id },
            Some(_) => Error::StockConflict { item_id },
        });
    }

    let mut order = Order::from_intent(intent);
    order.create_time = intent.created_at;
    tx.insert_order(&order).await
}

async fn rollback(tx: Box<dyn StoreTransaction>) {
    if let Err(e) = tx.rollback().await {
        warn!(error = %e, "Rollback failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryEventCollector, MemoryFastStore, MemoryOrderStore};
    use crate::domain::model::InventoryItem;
    use crate::domain::ports::KeyValueStore;
    use crate::lock::LockConfig;
    use chrono::Utc;

    struct Fixture {
        fast: Arc<MemoryFastStore>,
        db: Arc<MemoryOrderStore>,
        events: Arc<InMemoryEventCollector>,
        fulfiller: OrderFulfiller,
    }

    async fn fixture(stock: i64, config: FulfillmentConfig) -> Fixture {
        let fast = Arc::new(MemoryFastStore::new());
        let db = Arc::new(MemoryOrderStore::new());
        let events = Arc::new(InMemoryEventCollector::new());

        let now = Utc::now();
        let mut tx = db.begin().await.unwrap();
        tx.insert_item(&InventoryItem::new(1, stock, now, now + chrono::Duration::hours(1)))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let fulfiller = OrderFulfiller::new(
            db.clone(),
            DistributedLock::new(fast.clone(), LockConfig::default()),
            PipelineMetrics::new().unwrap(),
            events.clone(),
            config,
            CancellationToken::new(),
        );
        Fixture {
            fast,
            db,
            events,
            fulfiller,
        }
    }

    /// Order store whose order inserts stall, keeping the transaction open.
    struct StallingOrders {
        inner: Arc<MemoryOrderStore>,
        stall: Duration,
    }

    struct StallingTx {
        inner: Box<dyn StoreTransaction>,
        stall: Duration,
    }

    #[async_trait::async_trait]
    impl OrderStore for StallingOrders {
        async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
            Ok(Box::new(StallingTx {
                inner: self.inner.begin().await?,
                stall: self.stall,
            }))
        }

        async fn find_item(&self, id: i64) -> Result<Option<InventoryItem>> {
            self.inner.find_item(id).await
        }

        async fn find_shop(&self, id: i64) -> Result<Option<crate::domain::model::Shop>> {
            self.inner.find_shop(id).await
        }

        async fn item_ids(&self) -> Result<Vec<i64>> {
            self.inner.item_ids().await
        }

        async fn shop_ids(&self) -> Result<Vec<i64>> {
            self.inner.shop_ids().await
        }

        async fn orders_for_item(&self, item_id: i64) -> Result<Vec<Order>> {
            self.inner.orders_for_item(item_id).await
        }
    }

    #[async_trait::async_trait]
    impl StoreTransaction for StallingTx {
        async fn has_order(&mut self, user_id: i64, item_id: i64) -> Result<bool> {
            self.inner.has_order(user_id, item_id).await
        }

        async fn decrement_stock(&mut self, item_id: i64) -> Result<u64> {
            self.inner.decrement_stock(item_id).await
        }

        async fn item_stock(&mut self, item_id: i64) -> Result<Option<i64>> {
            self.inner.item_stock(item_id).await
        }

        async fn insert_order(&mut self, order: &Order) -> Result<()> {
            tokio::time::sleep(self.stall).await;
            self.inner.insert_order(order).await
        }

        async fn insert_item(&mut self, item: &InventoryItem) -> Result<()> {
            self.inner.insert_item(item).await
        }

        async fn update_item(&mut self, item: &InventoryItem) -> Result<u64> {
            self.inner.update_item(item).await
        }

        async fn upsert_shop(&mut self, shop: &crate::domain::model::Shop) -> Result<()> {
            self.inner.upsert_shop(shop).await
        }

        async fn commit(self: Box<Self>) -> Result<()> {
            self.inner.commit().await
        }

        async fn rollback(self: Box<Self>) -> Result<()> {
            self.inner.rollback().await
        }
    }

    fn intent(user_id: i64, order_id: i64) -> PurchaseIntent {
        PurchaseIntent::new(1, user_id, OrderId(order_id))
    }

    #[test]
    fn test_max_duration_covers_every_attempt() {
        let config = FulfillmentConfig::default();
        // 3 x (15s lock wait + 5s tx) + 50ms + 100ms of backoff
        assert_eq!(config.max_duration(), Duration::from_millis(60_150));

        let single = FulfillmentConfig {
            max_attempts: 1,
            ..FulfillmentConfig::default()
        };
        assert_eq!(single.max_duration(), Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_creates_order_and_releases_lock() {
        let f = fixture(2, FulfillmentConfig::default()).await;

        let outcome = f.fulfiller.fulfill(&intent(7, 100)).await.unwrap();
        assert_eq!(outcome, FulfillmentOutcome::Created(OrderId(100)));

        assert_eq!(f.db.order_count().await, 1);
        assert_eq!(f.db.find_item(1).await.unwrap().unwrap().stock, 1);
        assert!(!f.fast.exists("lock:voucher:1"));
    }

    #[tokio::test]
    async fn test_redelivery_is_idempotent() {
        let f = fixture(5, FulfillmentConfig::default()).await;

        f.fulfiller.fulfill(&intent(7, 100)).await.unwrap();
        let again = f.fulfiller.fulfill(&intent(7, 100)).await.unwrap();

        assert_eq!(again, FulfillmentOutcome::Duplicate);
        assert_eq!(f.db.order_count().await, 1);
        assert_eq!(f.db.find_item(1).await.unwrap().unwrap().stock, 4);
    }

    #[tokio::test]
    async fn test_zero_stock_is_not_retried() {
        let f = fixture(0, FulfillmentConfig::default()).await;

        let err = f.fulfiller.fulfill(&intent(7, 100)).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientStock { item_id: 1 }));
        assert_eq!(f.db.order_count().await, 0);
    }

    #[tokio::test]
    async fn test_transient_store_failure_is_retried() {
        let f = fixture(1, FulfillmentConfig::default()).await;
        f.db.faults().fail_next(2);

        let outcome = f.fulfiller.fulfill(&intent(7, 100)).await.unwrap();
        assert_eq!(outcome, FulfillmentOutcome::Created(OrderId(100)));
    }

    #[tokio::test]
    async fn test_persistent_failure_surfaces_after_attempts() {
        let f = fixture(1, FulfillmentConfig::default()).await;
        f.db.faults().fail_always(true);

        let err = f.fulfiller.fulfill(&intent(7, 100)).await.unwrap_err();
        assert!(err.is_transient());
        assert!(!f.fast.exists("lock:voucher:1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_held_elsewhere_times_out() {
        let config = FulfillmentConfig {
            lock_timeout: Duration::from_millis(200),
            max_attempts: 1,
            ..FulfillmentConfig::default()
        };
        let f = fixture(1, config).await;
        f.fast
            .set("lock:voucher:1", "other-holder", Some(Duration::from_secs(60)))
            .await
            .unwrap();

        let err = f.fulfiller.fulfill(&intent(7, 100)).await.unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));
        assert_eq!(f.db.order_count().await, 0);
        // The foreign lock is untouched.
        assert_eq!(
            f.fast.get("lock:voucher:1").await.unwrap().as_deref(),
            Some("other-holder")
        );
        assert!(f.events.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_taken_over_mid_transaction_rolls_back() {
        let config = FulfillmentConfig {
            lock_ttl: Duration::from_millis(60),
            max_attempts: 1,
            ..FulfillmentConfig::default()
        };
        let f = fixture(3, config.clone()).await;
        let fulfiller = OrderFulfiller::new(
            Arc::new(StallingOrders {
                inner: f.db.clone(),
                stall: Duration::from_millis(200),
            }),
            DistributedLock::new(f.fast.clone(), LockConfig::default()),
            PipelineMetrics::new().unwrap(),
            f.events.clone(),
            config,
            CancellationToken::new(),
        );

        // Another holder grabs the key while the insert is stalled.
        let fast = f.fast.clone();
        let usurper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            fast.set("lock:voucher:1", "usurper", Some(Duration::from_secs(60)))
                .await
                .unwrap();
        });

        let err = fulfiller.fulfill(&intent(7, 100)).await.unwrap_err();
        usurper.await.unwrap();

        assert!(matches!(err, Error::LockLost { ref key } if key == "lock:voucher:1"));
        assert_eq!(f.db.order_count().await, 0);
        assert_eq!(f.db.find_item(1).await.unwrap().unwrap().stock, 3);
        assert_eq!(f.events.events_of_type("LockLost").len(), 1);
        // The usurper's lock survives our release.
        assert_eq!(
            f.fast.get("lock:voucher:1").await.unwrap().as_deref(),
            Some("usurper")
        );
    }
}
