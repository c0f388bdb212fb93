//! Wiring of the full order pipeline over a pair of stores.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{
    BloomConfig, BloomGate, CacheClient, CacheConfig, EntityCache, ItemSource, RefreshQueue,
    ShopSource,
};
use crate::domain::model::InventoryItem;
use crate::domain::ports::{EventPublisher, KeyValueStore, OrderStore, ScriptRunner, StreamStore};
use crate::error::Result;
use crate::fulfillment::{FulfillmentConfig, OrderFulfiller};
use crate::lock::{DistributedLock, LockConfig};
use crate::metrics::PipelineMetrics;
use crate::queue::{OrderQueue, QueueConfig, QueueProcessor, RetryTracker};
use crate::seckill::{
    AdmissionConfig, AdmissionGate, InventoryConfig, InventoryService, OrderIdGenerator,
};
use crate::shop::ShopDirectory;

/// Configuration of every component.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub cache: CacheConfig,
    pub bloom: BloomConfig,
    pub lock: LockConfig,
    pub queue: QueueConfig,
    pub fulfillment: FulfillmentConfig,
    pub admission: AdmissionConfig,
    pub inventory: InventoryConfig,
}

/// The assembled pipeline.
#[derive(Debug)]
pub struct Pipeline {
    pub metrics: PipelineMetrics,
    pub items: EntityCache<InventoryItem>,
    pub shops: ShopDirectory,
    pub admission: Arc<AdmissionGate>,
    pub inventory: InventoryService,
    pub processor: Arc<QueueProcessor>,
    cancel: CancellationToken,
    refreshers: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Build every component. `fast` serves key/value, stream and script
    /// traffic; `durable` holds items, shops and orders. Cancelling `cancel`
    /// stops all background tasks.
    pub fn build<F>(
        fast: Arc<F>,
        durable: Arc<dyn OrderStore>,
        events: Arc<dyn EventPublisher>,
        config: PipelineConfig,
        cancel: CancellationToken,
    ) -> Result<Self>
    where
        F: KeyValueStore + StreamStore + ScriptRunner + 'static,
    {
        let metrics = PipelineMetrics::new()?;
        let kv: Arc<dyn KeyValueStore> = fast.clone();
        let streams: Arc<dyn StreamStore> = fast.clone();
        let scripts: Arc<dyn ScriptRunner> = fast;

        let (refresh_queue, refreshers) = RefreshQueue::start(
            config.cache.refresh_queue_capacity,
            config.cache.refresh_workers,
            cancel.clone(),
        );
        let cache = CacheClient::new(
            kv.clone(),
            refresh_queue,
            config.cache.clone(),
            metrics.clone(),
            events.clone(),
        );

        let item_bloom = Arc::new(BloomGate::new(&config.bloom)?);
        let items: EntityCache<InventoryItem> =
            EntityCache::new(cache.clone(), Arc::new(ItemSource::new(durable.clone())))
                .with_bloom(item_bloom);
        let shop_bloom = Arc::new(BloomGate::new(&config.bloom)?);
        let shops = ShopDirectory::new(
            durable.clone(),
            EntityCache::new(cache, Arc::new(ShopSource::new(durable.clone())))
                .with_bloom(shop_bloom),
        );

        let admission = Arc::new(AdmissionGate::new(
            scripts,
            items.clone(),
            OrderIdGenerator::new(kv.clone()),
            metrics.clone(),
            events.clone(),
            config.admission.clone(),
        ));
        let inventory = InventoryService::new(
            durable.clone(),
            kv.clone(),
            items.clone(),
            config.inventory.clone(),
        );

        let fulfiller = OrderFulfiller::new(
            durable,
            DistributedLock::new(kv.clone(), config.lock.clone()),
            metrics.clone(),
            events.clone(),
            config.fulfillment.clone(),
            cancel.clone(),
        );
        let worst_case = config.fulfillment.max_duration();
        if config.queue.pending_min_idle < worst_case {
            warn!(
                pending_min_idle_ms = config.queue.pending_min_idle.as_millis() as u64,
                fulfillment_max_ms = worst_case.as_millis() as u64,
                "Pending min idle is shorter than a worst-case fulfillment; live deliveries may be redelivered"
            );
        }
        let queue = OrderQueue::new(streams, config.queue.clone());
        let retries = RetryTracker::new(kv, config.queue.stream.clone(), config.queue.retry_ttl);
        let processor = Arc::new(QueueProcessor::new(
            queue,
            retries,
            Arc::new(fulfiller),
            metrics.clone(),
            events,
        ));

        Ok(Self {
            metrics,
            items,
            shops,
            admission,
            inventory,
            processor,
            cancel,
            refreshers,
        })
    }

    /// Load the bloom filter from the durable store, create the consumer
    /// group and spawn both queue loops.
    pub async fn start(&self) -> Result<Vec<JoinHandle<()>>> {
        let items = self.items.populate_bloom().await?;
        let shops = self.shops.cache().populate_bloom().await?;
        info!(items, shops, "Bloom filters populated");
        self.processor.clone().start(self.cancel.clone()).await
    }

    /// Cancel background work and wait for the refreshers to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.refreshers {
            let _ = handle.await;
        }
    }
}
