//! Cache Layer
//!
//! Read-through caching over entity lookups with four miss policies, a
//! bloom filter gate for ids that cannot exist, and a bounded background
//! refresher for logically expired entries.

pub mod bloom;
mod client;
mod entry;
mod refresher;
mod sources;

pub use bloom::{BloomConfig, BloomFilter, BloomGate};
pub use client::{CacheClient, CacheConfig, CacheStrategy, EntityCache, EntitySource};
pub use entry::{
    cache_key, lock_key, LogicalEntry, CACHE_ITEM_PREFIX, CACHE_LOCK_PREFIX, CACHE_SHOP_PREFIX,
    NULL_MARKER,
};
pub use refresher::{RefreshQueue, RefreshTask};
pub use sources::{ItemSource, ShopSource};
