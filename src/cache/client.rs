//! Read-through cache with selectable miss policies.
//!
//! Every strategy shares the same write rule: an entity update deletes its
//! cache key before the durable transaction commits.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use super::bloom::BloomGate;
use super::entry::{cache_key, lock_key, Cached, LogicalEntry, NULL_MARKER};
use super::refresher::{RefreshQueue, RefreshTask};
use crate::domain::events::DomainEvent;
use crate::domain::ports::{EventPublisher, KeyValueStore, StoreTransaction};
use crate::error::{Error, Result};
use crate::lock::{DistributedLock, LockConfig, LockToken};
use crate::metrics::PipelineMetrics;

/// Read policy applied on lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheStrategy {
    /// Populate on miss with a time-based expiry.
    CacheAside,
    /// Like cache-aside, plus a short-lived marker for absent ids.
    NullCaching,
    /// Only the holder of a per-key lock reads the store on a miss.
    MutexRebuild,
    /// Entries never expire in the store; stale hits trigger a background refresh.
    LogicalExpiration,
}

impl CacheStrategy {
    pub fn label(&self) -> &'static str {
        match self {
            CacheStrategy::CacheAside => "cache_aside",
            CacheStrategy::NullCaching => "null_caching",
            CacheStrategy::MutexRebuild => "mutex_rebuild",
            CacheStrategy::LogicalExpiration => "logical_expiration",
        }
    }
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Cache timing configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Expiry of populated entries
    pub ttl: Duration,

    /// Expiry of null markers
    pub null_ttl: Duration,

    /// Lease of the per-key rebuild lock
    pub lock_ttl: Duration,

    /// Sleep between rebuild attempts when the lock is held elsewhere
    pub rebuild_wait: Duration,

    /// Rebuild attempts before giving up
    pub max_rebuild_attempts: u32,

    /// Logical freshness window of wrapped entries
    pub logical_ttl: Duration,

    /// Pending refresh requests before new ones are dropped
    pub refresh_queue_capacity: usize,

    /// Background refresher tasks
    pub refresh_workers: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
            null_ttl: Duration::from_secs(2 * 60),
            lock_ttl: Duration::from_secs(10),
            rebuild_wait: Duration::from_millis(50),
            max_rebuild_attempts: 40,
            logical_ttl: Duration::from_secs(10),
            refresh_queue_capacity: 10,
            refresh_workers: 1,
        }
    }
}

/// Where cached values come from on a miss.
#[async_trait]
pub trait EntitySource<T>: Send + Sync {
    /// Key namespace, e.g. `cache:shop:`.
    fn prefix(&self) -> &'static str;

    async fn load(&self, id: i64) -> Result<Option<T>>;

    /// Every valid id, used to populate the bloom filter.
    async fn ids(&self) -> Result<Vec<i64>>;
}

/// Shared cache machinery: the fast store, the rebuild lock, and the
/// refresh queue.
#[derive(Clone)]
pub struct CacheClient {
    store: Arc<dyn KeyValueStore>,
    lock: DistributedLock,
    refresher: RefreshQueue,
    config: CacheConfig,
    metrics: PipelineMetrics,
    events: Arc<dyn EventPublisher>,
}

impl fmt::Debug for CacheClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CacheClient {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        refresher: RefreshQueue,
        config: CacheConfig,
        metrics: PipelineMetrics,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        let lock = DistributedLock::new(
            store.clone(),
            LockConfig {
                ttl: config.lock_ttl,
                ..LockConfig::default()
            },
        );
        Self {
            store,
            lock,
            refresher,
            config,
            metrics,
            events,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    /// Delete `key`, then commit `tx`. If the delete fails the transaction
    /// is rolled back and the delete error returned.
    pub async fn update_with_invalidation(
        &self,
        tx: Box<dyn StoreTransaction>,
        key: &str,
    ) -> Result<()> {
        if let Err(e) = self.store.del(key).await {
            warn!(key = %key, error = %e, "Cache invalidation failed, rolling back");
            if let Err(rollback) = tx.rollback().await {
                warn!(key = %key, error = %rollback, "Rollback failed");
            }
            return Err(e);
        }
        tx.commit().await?;
        debug!(key = %key, "Cache entry invalidated");
        Ok(())
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Cached<T>>> {
        match self.store.get(key).await? {
            None => Ok(None),
            Some(raw) if raw == NULL_MARKER => Ok(Some(Cached::Absent)),
            Some(raw) => Ok(Some(Cached::Value(serde_json::from_str(&raw)?))),
        }
    }

    async fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.store.set(key, &raw, Some(self.config.ttl)).await
    }

    async fn write_null(&self, key: &str) -> Result<()> {
        self.store
            .set(key, NULL_MARKER, Some(self.config.null_ttl))
            .await
    }

    async fn write_logical<T: Serialize>(&self, key: &str, value: T) -> Result<()> {
        let expire_time = Utc::now()
            + chrono::Duration::from_std(self.config.logical_ttl)
                .map_err(|e| Error::Config(format!("logical ttl out of range: {}", e)))?;
        let raw = serde_json::to_string(&LogicalEntry::new(value, expire_time))?;
        self.store.set(key, &raw, None).await
    }

    async fn publish(&self, event: DomainEvent) {
        if let Err(e) = self.events.publish(event).await {
            warn!(error = %e, "Failed to publish cache event");
        }
    }
}

/// Typed view of the cache for one entity kind.
pub struct EntityCache<T> {
    client: CacheClient,
    source: Arc<dyn EntitySource<T>>,
    bloom: Option<Arc<BloomGate>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for EntityCache<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            source: self.source.clone(),
            bloom: self.bloom.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for EntityCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityCache")
            .field("prefix", &self.source.prefix())
            .field("bloom", &self.bloom.is_some())
            .finish()
    }
}

impl<T> EntityCache<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(client: CacheClient, source: Arc<dyn EntitySource<T>>) -> Self {
        Self {
            client,
            source,
            bloom: None,
            _marker: PhantomData,
        }
    }

    /// Consult `bloom` before touching the cache or the store.
    pub fn with_bloom(mut self, bloom: Arc<BloomGate>) -> Self {
        self.bloom = Some(bloom);
        self
    }

    pub fn client(&self) -> &CacheClient {
        &self.client
    }

    pub fn key(&self, id: i64) -> String {
        cache_key(self.source.prefix(), id)
    }

    /// Load every valid id into the bloom filter. Returns how many were added.
    pub async fn populate_bloom(&self) -> Result<usize> {
        let Some(bloom) = &self.bloom else {
            return Ok(0);
        };
        let ids = self.source.ids().await?;
        let count = bloom.populate(ids);
        debug!(prefix = %self.source.prefix(), count, "Bloom filter populated");
        Ok(count)
    }

    /// Mark a newly created id as valid for the bloom filter.
    pub fn record_created(&self, id: i64) {
        if let Some(bloom) = &self.bloom {
            bloom.insert(id);
        }
    }

    /// Look up an entity. `Ok(None)` means it does not exist.
    #[instrument(skip(self), fields(prefix = %self.source.prefix()))]
    pub async fn get(&self, id: i64, strategy: CacheStrategy) -> Result<Option<T>> {
        if let Some(bloom) = &self.bloom {
            if !bloom.might_contain(id) {
                self.record(strategy, "bloom_rejected");
                return Ok(None);
            }
        }

        match strategy {
            CacheStrategy::CacheAside => self.get_cache_aside(id, false).await,
            CacheStrategy::NullCaching => self.get_cache_aside(id, true).await,
            CacheStrategy::MutexRebuild => self.get_mutex_rebuild(id).await,
            CacheStrategy::LogicalExpiration => self.get_logical(id).await,
        }
    }

    /// Drop the cached entry for `id`.
    pub async fn invalidate(&self, id: i64) -> Result<bool> {
        self.client.store.del(&self.key(id)).await
    }

    /// Delete the cached entry for `id`, then commit `tx`.
    pub async fn commit_invalidating(&self, tx: Box<dyn StoreTransaction>, id: i64) -> Result<()> {
        self.client
            .update_with_invalidation(tx, &self.key(id))
            .await
    }

    /// Write a logically expiring entry for `id` ahead of traffic. Returns
    /// whether the entity exists.
    pub async fn warm_logical(&self, id: i64) -> Result<bool> {
        match self.source.load(id).await? {
            Some(value) => {
                self.client.write_logical(&self.key(id), value).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn record(&self, strategy: CacheStrategy, result: &str) {
        self.client
            .metrics
            .record_cache_lookup(strategy.label(), result);
    }

    async fn get_cache_aside(&self, id: i64, cache_null: bool) -> Result<Option<T>> {
        let strategy = if cache_null {
            CacheStrategy::NullCaching
        } else {
            CacheStrategy::CacheAside
        };
        let key = self.key(id);

        match self.client.read::<T>(&key).await? {
            Some(Cached::Value(value)) => {
                self.record(strategy, "hit");
                return Ok(Some(value));
            }
            Some(Cached::Absent) => {
                self.record(strategy, "null");
                return Ok(None);
            }
            None => {}
        }

        self.record(strategy, "miss");
        match self.source.load(id).await? {
            Some(value) => {
                self.client.write(&key, &value).await?;
                Ok(Some(value))
            }
            None => {
                if cache_null {
                    self.client.write_null(&key).await?;
                }
                Ok(None)
            }
        }
    }

    async fn get_mutex_rebuild(&self, id: i64) -> Result<Option<T>> {
        let strategy = CacheStrategy::MutexRebuild;
        let key = self.key(id);
        let rebuild_key = lock_key(self.source.prefix(), id);
        let attempts = self.client.config.max_rebuild_attempts.max(1);

        for attempt in 0..attempts {
            match self.client.read::<T>(&key).await? {
                Some(Cached::Value(value)) => {
                    self.record(strategy, "hit");
                    return Ok(Some(value));
                }
                Some(Cached::Absent) => {
                    self.record(strategy, "null");
                    return Ok(None);
                }
                None => {}
            }

            let Some(token) = self
                .client
                .lock
                .try_acquire(&rebuild_key, self.client.config.lock_ttl)
                .await?
            else {
                debug!(key = %key, attempt, "Rebuild in progress elsewhere, waiting");
                tokio::time::sleep(self.client.config.rebuild_wait).await;
                continue;
            };

            self.record(strategy, "miss");
            let rebuilt = self.rebuild(id, &key).await;
            // An unreleased lock lapses with its TTL.
            if let Err(e) = self.client.lock.release(&rebuild_key, &token).await {
                warn!(key = %rebuild_key, error = %e, "Rebuild lock release failed");
            }
            return rebuilt;
        }

        Err(Error::CacheRebuildTimeout { key, attempts })
    }

    /// Runs with the rebuild lock held.
    async fn rebuild(&self, id: i64, key: &str) -> Result<Option<T>> {
        // Another holder may have finished between our miss and our acquire.
        match self.client.read::<T>(key).await? {
            Some(Cached::Value(value)) => return Ok(Some(value)),
            Some(Cached::Absent) => return Ok(None),
            None => {}
        }

        match self.source.load(id).await? {
            Some(value) => {
                self.client.write(key, &value).await?;
                Ok(Some(value))
            }
            None => {
                self.client.write_null(key).await?;
                Ok(None)
            }
        }
    }

    async fn get_logical(&self, id: i64) -> Result<Option<T>> {
        let strategy = CacheStrategy::LogicalExpiration;
        let key = self.key(id);

        let raw = match self.client.store.get(&key).await? {
            Some(raw) if raw == NULL_MARKER => {
                self.record(strategy, "null");
                return Ok(None);
            }
            Some(raw) => raw,
            None => {
                // Not warmed yet: load inline and install the wrapper.
                self.record(strategy, "miss");
                return match self.source.load(id).await? {
                    Some(value) => {
                        self.client.write_logical(&key, value.clone()).await?;
                        Ok(Some(value))
                    }
                    None => Ok(None),
                };
            }
        };

        let entry: LogicalEntry<T> = serde_json::from_str(&raw)?;
        if entry.is_fresh(Utc::now()) {
            self.record(strategy, "hit");
            return Ok(Some(entry.data));
        }

        // The stale value is served whatever happens to the refresh attempt.
        self.record(strategy, "stale");
        let rebuild_key = lock_key(self.source.prefix(), id);
        match self
            .client
            .lock
            .try_acquire(&rebuild_key, self.client.config.lock_ttl)
            .await
        {
            Ok(Some(token)) => {
                if let Err(e) = self.schedule_refresh(id, key.clone(), rebuild_key, token).await {
                    warn!(key = %key, error = %e, "Scheduling cache refresh failed");
                }
            }
            Ok(None) => debug!(key = %key, "Refresh already in progress"),
            Err(e) => warn!(key = %key, error = %e, "Refresh lock unavailable"),
        }
        Ok(Some(entry.data))
    }

    async fn schedule_refresh(
        &self,
        id: i64,
        key: String,
        rebuild_key: String,
        token: LockToken,
    ) -> Result<()> {
        let client = self.client.clone();
        let source = self.source.clone();
        let job_key = key.clone();
        let job_rebuild_key = rebuild_key.clone();
        let job_token = token.clone();

        let job = async move {
            let refreshed = match source.load(id).await {
                Ok(Some(value)) => client.write_logical(&job_key, value).await,
                Ok(None) => client.store.del(&job_key).await.map(|_| ()),
                Err(e) => Err(e),
            };
            client.lock.release(&job_rebuild_key, &job_token).await?;
            refreshed
        }
        .boxed();

        if let Err(rejected) = self.client.refresher.try_submit(RefreshTask { key, job }) {
            warn!(key = %rejected.key, "Refresh queue full, serving stale value");
            self.client.lock.release(&rebuild_key, &token).await?;
            self.client.metrics.record_refresh_dropped();
            self.client
                .publish(DomainEvent::cache_refresh_dropped(&rejected.key))
                .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryEventCollector, MemoryFastStore};
    use crate::cache::bloom::BloomConfig;
    use crate::domain::model::Shop;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct FakeSource {
        rows: Mutex<HashMap<i64, Shop>>,
        loads: AtomicUsize,
        delay: Option<Duration>,
    }

    impl FakeSource {
        fn put(&self, id: i64, name: &str) {
            self.rows.lock().insert(
                id,
                Shop {
                    id,
                    name: name.to_string(),
                    type_id: 1,
                    address: "somewhere".to_string(),
                    score: 40,
                },
            );
        }

        fn loads(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EntitySource<Shop> for FakeSource {
        fn prefix(&self) -> &'static str {
            "cache:shop:"
        }

        async fn load(&self, id: i64) -> Result<Option<Shop>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.rows.lock().get(&id).cloned())
        }

        async fn ids(&self) -> Result<Vec<i64>> {
            Ok(self.rows.lock().keys().copied().collect())
        }
    }

    struct Fixture {
        store: Arc<MemoryFastStore>,
        source: Arc<FakeSource>,
        events: Arc<InMemoryEventCollector>,
        cache: EntityCache<Shop>,
        cancel: CancellationToken,
    }

    fn fixture(source: FakeSource, config: CacheConfig) -> Fixture {
        let store = Arc::new(MemoryFastStore::new());
        let source = Arc::new(source);
        let events = Arc::new(InMemoryEventCollector::new());
        let cancel = CancellationToken::new();
        let (queue, _handles) = RefreshQueue::start(
            config.refresh_queue_capacity,
            config.refresh_workers,
            cancel.clone(),
        );
        let client = CacheClient::new(
            store.clone(),
            queue,
            config,
            PipelineMetrics::new().unwrap(),
            events.clone(),
        );
        let cache: EntityCache<Shop> = EntityCache::new(client, source.clone());
        Fixture {
            store,
            source,
            events,
            cache,
            cancel,
        }
    }

    #[tokio::test]
    async fn test_cache_aside_populates_with_ttl() {
        let f = fixture(FakeSource::default(), CacheConfig::default());
        f.source.put(1, "noodles");

        let shop = f.cache.get(1, CacheStrategy::CacheAside).await.unwrap();
        assert_eq!(shop.unwrap().name, "noodles");
        let again = f.cache.get(1, CacheStrategy::CacheAside).await.unwrap();
        assert!(again.is_some());

        assert_eq!(f.source.loads(), 1);
        assert!(f.store.ttl("cache:shop:1").is_some());
    }

    #[tokio::test]
    async fn test_cache_aside_does_not_cache_absent() {
        let f = fixture(FakeSource::default(), CacheConfig::default());

        for _ in 0..3 {
            assert!(f.cache.get(9, CacheStrategy::CacheAside).await.unwrap().is_none());
        }
        assert_eq!(f.source.loads(), 3);
    }

    #[tokio::test]
    async fn test_null_caching_reads_store_once() {
        let f = fixture(FakeSource::default(), CacheConfig::default());

        for _ in 0..5 {
            assert!(f.cache.get(9, CacheStrategy::NullCaching).await.unwrap().is_none());
        }
        assert_eq!(f.source.loads(), 1);
        assert_eq!(
            f.store.get("cache:shop:9").await.unwrap().as_deref(),
            Some(NULL_MARKER)
        );
    }

    #[tokio::test]
    async fn test_mutex_rebuild_single_load_under_contention() {
        let source = FakeSource {
            delay: Some(Duration::from_millis(100)),
            ..FakeSource::default()
        };
        let f = fixture(source, CacheConfig::default());
        f.source.put(3, "hot");

        let lookups: Vec<_> = (0..16)
            .map(|_| {
                let cache = f.cache.clone();
                tokio::spawn(async move { cache.get(3, CacheStrategy::MutexRebuild).await })
            })
            .collect();
        for lookup in lookups {
            let shop = lookup.await.unwrap().unwrap();
            assert_eq!(shop.unwrap().name, "hot");
        }

        assert_eq!(f.source.loads(), 1);
        assert!(!f.store.exists("lock:cache:cache:shop:3"));
    }

    #[tokio::test]
    async fn test_mutex_rebuild_gives_up_after_bounded_attempts() {
        let config = CacheConfig {
            rebuild_wait: Duration::from_millis(1),
            max_rebuild_attempts: 3,
            ..CacheConfig::default()
        };
        let f = fixture(FakeSource::default(), config);
        f.source.put(3, "hot");
        f.store
            .set("lock:cache:cache:shop:3", "someone-else", Some(Duration::from_secs(10)))
            .await
            .unwrap();

        let err = f.cache.get(3, CacheStrategy::MutexRebuild).await.unwrap_err();
        assert!(matches!(err, Error::CacheRebuildTimeout { attempts: 3, .. }));
        assert_eq!(f.source.loads(), 0);
    }

    #[tokio::test]
    async fn test_logical_stale_hit_then_refresh() {
        let f = fixture(FakeSource::default(), CacheConfig::default());
        f.source.put(4, "old");
        assert!(f.cache.warm_logical(4).await.unwrap());
        assert!(f.store.ttl("cache:shop:4").is_none());

        // Force the entry past its logical expiry and change the source row.
        let stale = LogicalEntry::new(
            f.source.rows.lock()[&4].clone(),
            Utc::now() - chrono::Duration::seconds(1),
        );
        f.store
            .set("cache:shop:4", &serde_json::to_string(&stale).unwrap(), None)
            .await
            .unwrap();
        f.source.put(4, "new");

        let served = f.cache.get(4, CacheStrategy::LogicalExpiration).await.unwrap();
        assert_eq!(served.unwrap().name, "old");

        tokio::time::sleep(Duration::from_millis(50)).await;
        let served = f.cache.get(4, CacheStrategy::LogicalExpiration).await.unwrap();
        assert_eq!(served.unwrap().name, "new");
        assert!(!f.store.exists("lock:cache:cache:shop:4"));
        f.cancel.cancel();
    }

    #[tokio::test]
    async fn test_logical_stale_with_lock_held_skips_refresh() {
        let f = fixture(FakeSource::default(), CacheConfig::default());
        f.source.put(4, "old");
        let stale = LogicalEntry::new(
            f.source.rows.lock()[&4].clone(),
            Utc::now() - chrono::Duration::seconds(1),
        );
        f.store
            .set("cache:shop:4", &serde_json::to_string(&stale).unwrap(), None)
            .await
            .unwrap();
        f.store
            .set("lock:cache:cache:shop:4", "other", Some(Duration::from_secs(10)))
            .await
            .unwrap();

        let served = f.cache.get(4, CacheStrategy::LogicalExpiration).await.unwrap();
        assert_eq!(served.unwrap().name, "old");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.source.loads(), 0);
    }

    /// Fast store whose lock primitives can be made to fail.
    #[derive(Default)]
    struct LockFaultStore {
        inner: MemoryFastStore,
        fail_set_nx: std::sync::atomic::AtomicBool,
        fail_release: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl KeyValueStore for LockFaultStore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
            self.inner.set(key, value, ttl).await
        }

        async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
            if self.fail_set_nx.load(Ordering::SeqCst) {
                return Err(Error::StoreUnavailable("set_nx refused".into()));
            }
            self.inner.set_nx(key, value, ttl).await
        }

        async fn del(&self, key: &str) -> Result<bool> {
            self.inner.del(key).await
        }

        async fn incr(&self, key: &str) -> Result<i64> {
            self.inner.incr(key).await
        }

        async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
            self.inner.expire(key, ttl).await
        }

        async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
            if self.fail_release.load(Ordering::SeqCst) {
                return Err(Error::StoreUnavailable("compare_and_delete refused".into()));
            }
            self.inner.compare_and_delete(key, expected).await
        }

        async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
            self.inner.compare_and_expire(key, expected, ttl).await
        }
    }

    fn cache_over(store: Arc<LockFaultStore>, source: Arc<FakeSource>) -> EntityCache<Shop> {
        let config = CacheConfig::default();
        let (queue, _handles) = RefreshQueue::start(
            config.refresh_queue_capacity,
            config.refresh_workers,
            CancellationToken::new(),
        );
        let client = CacheClient::new(
            store,
            queue,
            config,
            PipelineMetrics::new().unwrap(),
            Arc::new(InMemoryEventCollector::new()),
        );
        EntityCache::new(client, source)
    }

    #[tokio::test]
    async fn test_logical_stale_served_when_refresh_lock_errors() {
        let store = Arc::new(LockFaultStore::default());
        let source = Arc::new(FakeSource::default());
        source.put(4, "old");
        let cache = cache_over(store.clone(), source.clone());

        let stale = LogicalEntry::new(
            source.rows.lock()[&4].clone(),
            Utc::now() - chrono::Duration::seconds(1),
        );
        store
            .set("cache:shop:4", &serde_json::to_string(&stale).unwrap(), None)
            .await
            .unwrap();
        store.fail_set_nx.store(true, Ordering::SeqCst);

        let served = cache.get(4, CacheStrategy::LogicalExpiration).await.unwrap();
        assert_eq!(served.unwrap().name, "old");
        assert_eq!(source.loads(), 0);
    }

    #[tokio::test]
    async fn test_rebuilt_value_kept_when_lock_release_fails() {
        let store = Arc::new(LockFaultStore::default());
        let source = Arc::new(FakeSource::default());
        source.put(2, "fresh");
        let cache = cache_over(store.clone(), source.clone());
        store.fail_release.store(true, Ordering::SeqCst);

        let served = cache.get(2, CacheStrategy::MutexRebuild).await.unwrap();
        assert_eq!(served.unwrap().name, "fresh");
        assert_eq!(source.loads(), 1);

        // The orphaned lock only lapses with its TTL.
        assert!(store.inner.ttl("lock:cache:cache:shop:2").is_some());
        let again = cache.get(2, CacheStrategy::MutexRebuild).await.unwrap();
        assert_eq!(again.unwrap().name, "fresh");
        assert_eq!(source.loads(), 1);
    }

    #[tokio::test]
    async fn test_bloom_short_circuits_unknown_ids() {
        let f = fixture(FakeSource::default(), CacheConfig::default());
        f.source.put(1, "real");
        let bloom = Arc::new(BloomGate::new(&BloomConfig::default()).unwrap());
        let cache = f.cache.clone().with_bloom(bloom);
        assert_eq!(cache.populate_bloom().await.unwrap(), 1);

        assert!(cache.get(777, CacheStrategy::CacheAside).await.unwrap().is_none());
        assert_eq!(f.source.loads(), 0);
        assert!(cache.get(1, CacheStrategy::CacheAside).await.unwrap().is_some());
        assert_eq!(
            cache
                .client()
                .metrics()
                .cache_lookups("cache_aside", "bloom_rejected"),
            1
        );
    }

    #[tokio::test]
    async fn test_invalidation_delete_failure_rolls_back() {
        use crate::adapters::MemoryOrderStore;
        use crate::domain::ports::OrderStore;

        let f = fixture(FakeSource::default(), CacheConfig::default());
        let db = MemoryOrderStore::new();
        let shop = Shop {
            id: 5,
            name: "before".into(),
            type_id: 1,
            address: "x".into(),
            score: 10,
        };

        let mut tx = db.begin().await.unwrap();
        tx.upsert_shop(&shop).await.unwrap();
        f.store.faults().fail_next(1);
        assert!(f.cache.commit_invalidating(tx, 5).await.is_err());
        assert!(db.find_shop(5).await.unwrap().is_none());

        let mut tx = db.begin().await.unwrap();
        tx.upsert_shop(&shop).await.unwrap();
        f.cache.commit_invalidating(tx, 5).await.unwrap();
        assert!(db.find_shop(5).await.unwrap().is_some());
        assert!(f.events.is_empty());
    }
}
