//! Cache entry encoding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cache key prefix for shops.
pub const CACHE_SHOP_PREFIX: &str = "cache:shop:";
/// Cache key prefix for flash-sale inventory items.
pub const CACHE_ITEM_PREFIX: &str = "cache:seckill:";
/// Rebuild lock key prefix.
pub const CACHE_LOCK_PREFIX: &str = "lock:cache:";

/// Stored value marking an id known to be absent from the durable store.
pub const NULL_MARKER: &str = "";

/// Wrapper carrying a logical expiry next to the cached value. The store
/// key itself never expires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalEntry<T> {
    pub expire_time: DateTime<Utc>,
    pub data: T,
}

impl<T> LogicalEntry<T> {
    pub fn new(data: T, expire_time: DateTime<Utc>) -> Self {
        Self { expire_time, data }
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expire_time > now
    }
}

/// What a raw cached string decodes to.
#[derive(Debug, Clone, PartialEq)]
pub enum Cached<T> {
    /// The null marker: the id is known not to exist.
    Absent,
    Value(T),
}

pub fn cache_key(prefix: &str, id: i64) -> String {
    format!("{}{}", prefix, id)
}

pub fn lock_key(prefix: &str, id: i64) -> String {
    format!("{}{}{}", CACHE_LOCK_PREFIX, prefix, id)
}
