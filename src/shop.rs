//! Shop lookups through the cache layer.

use std::sync::Arc;

use tracing::instrument;

use crate::cache::{CacheStrategy, EntityCache};
use crate::domain::model::Shop;
use crate::domain::ports::OrderStore;
use crate::error::{Error, Result};

/// Read and write access to shop listings.
#[derive(Clone)]
pub struct ShopDirectory {
    store: Arc<dyn OrderStore>,
    shops: EntityCache<Shop>,
}

impl std::fmt::Debug for ShopDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShopDirectory")
            .field("shops", &self.shops)
            .finish_non_exhaustive()
    }
}

impl ShopDirectory {
    pub fn new(store: Arc<dyn OrderStore>, shops: EntityCache<Shop>) -> Self {
        Self { store, shops }
    }

    pub fn cache(&self) -> &EntityCache<Shop> {
        &self.shops
    }

    #[instrument(skip(self))]
    pub async fn query(&self, id: i64, strategy: CacheStrategy) -> Result<Shop> {
        self.shops
            .get(id, strategy)
            .await?
            .ok_or(Error::ShopNotFound(id))
    }

    /// Create or replace a shop, invalidating its cache entry before commit.
    pub async fn update_shop(&self, shop: &Shop) -> Result<()> {
        let mut tx = self.store.begin().await?;
        if let Err(e) = tx.upsert_shop(shop).await {
            tx.rollback().await?;
            return Err(e);
        }
        self.shops.commit_invalidating(tx, shop.id).await?;
        self.shops.record_created(shop.id);
        Ok(())
    }
}
