//! Flash-sale item registration and updates.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use super::admission::stock_key;
use crate::cache::EntityCache;
use crate::domain::model::InventoryItem;
use crate::domain::ports::{KeyValueStore, OrderStore};
use crate::error::{Error, Result};

/// Inventory settings.
#[derive(Debug, Clone)]
pub struct InventoryConfig {
    /// Retries of the stock publish after the first failure
    pub publish_retries: u32,

    /// Linear backoff step: retry `n` waits `n * publish_backoff`
    pub publish_backoff: Duration,

    /// Expiry of the published stock counter
    pub stock_ttl: Option<Duration>,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            publish_retries: 3,
            publish_backoff: Duration::from_secs(1),
            stock_ttl: Some(Duration::from_secs(24 * 60 * 60)),
        }
    }
}

/// Writes inventory to the durable store and mirrors stock into the fast
/// store.
pub struct InventoryService {
    store: Arc<dyn OrderStore>,
    fast: Arc<dyn KeyValueStore>,
    items: EntityCache<InventoryItem>,
    config: InventoryConfig,
}

impl std::fmt::Debug for InventoryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InventoryService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl InventoryService {
    pub fn new(
        store: Arc<dyn OrderStore>,
        fast: Arc<dyn KeyValueStore>,
        items: EntityCache<InventoryItem>,
        config: InventoryConfig,
    ) -> Self {
        Self {
            store,
            fast,
            items,
            config,
        }
    }

    /// Register a flash-sale item: durable insert first, then publish its
    /// stock for admission.
    #[instrument(skip(self, item), fields(item_id = item.id, stock = item.stock))]
    pub async fn add_item(&self, item: &InventoryItem) -> Result<()> {
        let mut tx = self.store.begin().await?;
        if let Err(e) = tx.insert_item(item).await {
            tx.rollback().await?;
            return Err(e);
        }
        tx.commit().await?;

        self.items.record_created(item.id);
        self.publish_stock(item.id, item.stock).await?;
        info!(item_id = item.id, stock = item.stock, "Flash-sale item registered");
        Ok(())
    }

    /// Update an item's window or stock, dropping its cache entry before the
    /// write commits. The admission counter is not touched.
    #[instrument(skip(self, item), fields(item_id = item.id))]
    pub async fn update_item(&self, item: &InventoryItem) -> Result<()> {
        let mut tx = self.store.begin().await?;
        match tx.update_item(item).await {
            Ok(0) => {
                tx.rollback().await?;
                Err(Error::ItemNotFound(item.id))
            }
            Ok(_) => self.items.commit_invalidating(tx, item.id).await,
            Err(e) => {
                tx.rollback().await?;
                Err(e)
            }
        }
    }

    async fn publish_stock(&self, item_id: i64, stock: i64) -> Result<()> {
        let key = stock_key(item_id);
        let value = stock.to_string();

        let mut last = match self.fast.set(&key, &value, self.config.stock_ttl).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        warn!(key = %key, error = %last, "Stock publish failed");

        for attempt in 1..=self.config.publish_retries {
            tokio::time::sleep(self.config.publish_backoff * attempt).await;
            match self.fast.set(&key, &value, self.config.stock_ttl).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(key = %key, attempt, error = %e, "Stock publish retry failed");
                    last = e;
                }
            }
        }
        Err(last)
    }
}
