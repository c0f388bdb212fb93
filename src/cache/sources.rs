//! Durable-store backed entity sources.

use std::sync::Arc;

use async_trait::async_trait;

use super::client::EntitySource;
use super::entry::{CACHE_ITEM_PREFIX, CACHE_SHOP_PREFIX};
use crate::domain::model::{InventoryItem, Shop};
use crate::domain::ports::OrderStore;
use crate::error::Result;

/// Flash-sale inventory items.
#[derive(Clone)]
pub struct ItemSource {
    store: Arc<dyn OrderStore>,
}

impl ItemSource {
    pub fn new(store: Arc<dyn OrderStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EntitySource<InventoryItem> for ItemSource {
    fn prefix(&self) -> &'static str {
        CACHE_ITEM_PREFIX
    }

    async fn load(&self, id: i64) -> Result<Option<InventoryItem>> {
        self.store.find_item(id).await
    }

    async fn ids(&self) -> Result<Vec<i64>> {
        self.store.item_ids().await
    }
}

/// Shop listings.
#[derive(Clone)]
pub struct ShopSource {
    store: Arc<dyn OrderStore>,
}

impl ShopSource {
    pub fn new(store: Arc<dyn OrderStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EntitySource<Shop> for ShopSource {
    fn prefix(&self) -> &'static str {
        CACHE_SHOP_PREFIX
    }

    async fn load(&self, id: i64) -> Result<Option<Shop>> {
        self.store.find_shop(id).await
    }

    async fn ids(&self) -> Result<Vec<i64>> {
        self.store.shop_ids().await
    }
}
