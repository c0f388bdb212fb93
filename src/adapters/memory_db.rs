//! In-Memory Durable Store
//!
//! Transactional stand-in for the relational store. A transaction holds the
//! table lock for its whole lifetime and buffers its writes in a per-row
//! log merged on commit, so transactions are serializable and an
//! uncommitted transaction leaves no trace.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::fault::FaultInjector;
use crate::domain::model::{InventoryItem, Order, Shop};
use crate::domain::ports::{OrderStore, StoreTransaction};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
struct Tables {
    items: BTreeMap<i64, InventoryItem>,
    orders: BTreeMap<i64, Order>,
    shops: BTreeMap<i64, Shop>,
}

/// Table names used for read accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Items,
    Shops,
}

/// In-memory durable store.
#[derive(Debug, Default)]
pub struct MemoryOrderStore {
    tables: Arc<Mutex<Tables>>,
    reads: DashMap<(Table, i64), u64>,
    read_delay: Option<Duration>,
    faults: FaultInjector,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every point read, to widen race windows in tests and demos.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    /// Fault injector for simulating store outages.
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Number of point reads served for an entity.
    pub fn reads(&self, table: Table, id: i64) -> u64 {
        self.reads.get(&(table, id)).map(|r| *r).unwrap_or(0)
    }

    pub async fn order_count(&self) -> usize {
        self.tables.lock().await.orders.len()
    }

    async fn record_read(&self, table: Table, id: i64) -> Result<()> {
        self.faults.check("select")?;
        *self.reads.entry((table, id)).or_insert(0) += 1;
        if let Some(delay) = self.read_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        self.faults.check("begin")?;
        let guard = self.tables.clone().lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            guard,
            log: Tables::default(),
        }))
    }

    async fn find_item(&self, id: i64) -> Result<Option<InventoryItem>> {
        self.record_read(Table::Items, id).await?;
        Ok(self.tables.lock().await.items.get(&id).cloned())
    }

    async fn find_shop(&self, id: i64) -> Result<Option<Shop>> {
        self.record_read(Table::Shops, id).await?;
        Ok(self.tables.lock().await.shops.get(&id).cloned())
    }

    async fn item_ids(&self) -> Result<Vec<i64>> {
        self.faults.check("select")?;
        Ok(self.tables.lock().await.items.keys().copied().collect())
    }

    async fn shop_ids(&self) -> Result<Vec<i64>> {
        self.faults.check("select")?;
        Ok(self.tables.lock().await.shops.keys().copied().collect())
    }

    async fn orders_for_item(&self, item_id: i64) -> Result<Vec<Order>> {
        self.faults.check("select")?;
        Ok(self
            .tables
            .lock()
            .await
            .orders
            .values()
            .filter(|o| o.item_id == item_id)
            .cloned()
            .collect())
    }
}

/// Open transaction over [`MemoryOrderStore`].
///
/// `log` holds the rows this transaction wrote; reads check it before the
/// committed tables.
struct MemoryTransaction {
    guard: OwnedMutexGuard<Tables>,
    log: Tables,
}

impl MemoryTransaction {
    fn item(&self, id: i64) -> Option<&InventoryItem> {
        self.log.items.get(&id).or_else(|| self.guard.items.get(&id))
    }

    /// Writable copy of an item row, pulled into the log on first touch.
    fn item_mut(&mut self, id: i64) -> Option<&mut InventoryItem> {
        if !self.log.items.contains_key(&id) {
            let committed = self.guard.items.get(&id)?.clone();
            self.log.items.insert(id, committed);
        }
        self.log.items.get_mut(&id)
    }

    fn order_exists(&self, id: i64) -> bool {
        self.log.orders.contains_key(&id) || self.guard.orders.contains_key(&id)
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn has_order(&mut self, user_id: i64, item_id: i64) -> Result<bool> {
        Ok(self
            .log
            .orders
            .values()
            .chain(self.guard.orders.values())
            .any(|o| o.user_id == user_id && o.item_id == item_id))
    }

    async fn decrement_stock(&mut self, item_id: i64) -> Result<u64> {
        match self.item_mut(item_id) {
            Some(item) if item.stock > 0 => {
                item.stock -= 1;
                item.update_time = Utc::now();
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn item_stock(&mut self, item_id: i64) -> Result<Option<i64>> {
        Ok(self.item(item_id).map(|item| item.stock))
    }

    async fn insert_order(&mut self, order: &Order) -> Result<()> {
        if self.order_exists(order.id.0) {
            return Err(Error::Internal(format!(
                "duplicate primary key for order {}",
                order.id
            )));
        }
        self.log.orders.insert(order.id.0, order.clone());
        Ok(())
    }

    async fn insert_item(&mut self, item: &InventoryItem) -> Result<()> {
        if self.item(item.id).is_some() {
            return Err(Error::Internal(format!(
                "duplicate primary key for item {}",
                item.id
            )));
        }
        self.log.items.insert(item.id, item.clone());
        Ok(())
    }

    async fn update_item(&mut self, item: &InventoryItem) -> Result<u64> {
        match self.item_mut(item.id) {
            Some(existing) => {
                *existing = item.clone();
                existing.update_time = Utc::now();
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn upsert_shop(&mut self, shop: &Shop) -> Result<()> {
        self.log.shops.insert(shop.id, shop.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction { mut guard, log } = *self;
        guard.items.extend(log.items);
        guard.orders.extend(log.orders);
        guard.shops.extend(log.shops);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{OrderId, PurchaseIntent};
    use chrono::Duration as ChronoDuration;

    fn item(id: i64, stock: i64) -> InventoryItem {
        let now = Utc::now();
        InventoryItem::new(id, stock, now, now + ChronoDuration::hours(1))
    }

    #[tokio::test]
    async fn test_commit_applies_rollback_discards() {
        let store = MemoryOrderStore::new();

        let mut tx = store.begin().await.unwrap();
        tx.insert_item(&item(1, 5)).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.find_item(1).await.unwrap().unwrap().stock, 5);

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.decrement_stock(1).await.unwrap(), 1);
        tx.rollback().await.unwrap();
        assert_eq!(store.find_item(1).await.unwrap().unwrap().stock, 5);
    }

    #[tokio::test]
    async fn test_conditional_decrement_stops_at_zero() {
        let store = MemoryOrderStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_item(&item(1, 1)).await.unwrap();
        assert_eq!(tx.decrement_stock(1).await.unwrap(), 1);
        assert_eq!(tx.decrement_stock(1).await.unwrap(), 0);
        assert_eq!(tx.decrement_stock(99).await.unwrap(), 0);
        tx.commit().await.unwrap();
        assert_eq!(store.find_item(1).await.unwrap().unwrap().stock, 0);
    }

    #[tokio::test]
    async fn test_has_order_sees_own_writes() {
        let store = MemoryOrderStore::new();
        let order = Order::from_intent(&PurchaseIntent::new(1, 2, OrderId(10)));

        let mut tx = store.begin().await.unwrap();
        assert!(!tx.has_order(2, 1).await.unwrap());
        tx.insert_order(&order).await.unwrap();
        assert!(tx.has_order(2, 1).await.unwrap());
        assert!(tx.insert_order(&order).await.is_err());
        tx.commit().await.unwrap();

        assert_eq!(store.orders_for_item(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_merges_only_written_rows() {
        let store = MemoryOrderStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_item(&item(1, 3)).await.unwrap();
        tx.insert_item(&item(2, 3)).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.decrement_stock(1).await.unwrap(), 1);
        assert_eq!(tx.decrement_stock(1).await.unwrap(), 1);
        assert_eq!(tx.item_stock(1).await.unwrap(), Some(1));
        assert_eq!(tx.item_stock(2).await.unwrap(), Some(3));
        assert!(tx.insert_item(&item(2, 9)).await.is_err());
        tx.upsert_shop(&Shop {
            id: 5,
            name: "corner".to_string(),
            type_id: 1,
            address: "here".to_string(),
            score: 30,
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.find_item(1).await.unwrap().unwrap().stock, 1);
        assert_eq!(store.find_item(2).await.unwrap().unwrap().stock, 3);
        assert_eq!(store.find_shop(5).await.unwrap().unwrap().name, "corner");
        assert_eq!(store.item_ids().await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_rollback_leaves_committed_rows_intact() {
        let store = MemoryOrderStore::new();
        let order = Order::from_intent(&PurchaseIntent::new(1, 2, OrderId(10)));
        let mut tx = store.begin().await.unwrap();
        tx.insert_item(&item(1, 2)).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.decrement_stock(1).await.unwrap();
        tx.insert_order(&order).await.unwrap();
        tx.insert_item(&item(7, 1)).await.unwrap();
        assert_eq!(tx.update_item(&item(1, 50)).await.unwrap(), 1);
        assert_eq!(tx.item_stock(1).await.unwrap(), Some(50));
        tx.rollback().await.unwrap();

        assert_eq!(store.find_item(1).await.unwrap().unwrap().stock, 2);
        assert!(store.find_item(7).await.unwrap().is_none());
        assert_eq!(store.order_count().await, 0);

        // Committed orders stay visible to later transactions.
        let mut tx = store.begin().await.unwrap();
        tx.insert_order(&order).await.unwrap();
        tx.commit().await.unwrap();
        let mut tx = store.begin().await.unwrap();
        assert!(tx.has_order(2, 1).await.unwrap());
        assert!(tx.insert_order(&order).await.is_err());
    }

    #[tokio::test]
    async fn test_read_accounting() {
        let store = MemoryOrderStore::new();
        store.find_shop(3).await.unwrap();
        store.find_shop(3).await.unwrap();
        assert_eq!(store.reads(Table::Shops, 3), 2);
        assert_eq!(store.reads(Table::Items, 3), 0);
    }
}
