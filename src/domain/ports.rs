//! Domain Ports (DDD Port/Adapter Pattern)
//!
//! The pipeline depends on two external stores, reached only through the
//! traits in this module:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                           │
//! │  KeyValueStore │ StreamStore │ ScriptRunner │ OrderStore    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │        MemoryFastStore (fast)  │  MemoryOrderStore (durable) │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The fast store offers key/value, stream and scripted operations (the
//! three traits are usually implemented by one adapter). The durable store
//! offers transactional reads and writes.

use std::time::Duration;

use async_trait::async_trait;

use super::events::DomainEvent;
use super::model::{EntryId, Fields, InventoryItem, Order, Shop, StreamEntry};
use crate::error::Result;

// =============================================================================
// Key/Value Port
// =============================================================================

/// Port for the fast in-memory key/value store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get a string value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a string value, optionally with an expiry. `None` means the key
    /// never expires at the store level.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Set only if absent. Returns whether the key was set.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete a key. Returns whether it existed.
    async fn del(&self, key: &str) -> Result<bool>;

    /// Atomically increment an integer value, creating it at 0 first.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Reset the expiry of an existing key. Returns whether the key exists.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` only if its current value equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    /// Reset the expiry of `key` only if its current value equals `expected`.
    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool>;
}

// =============================================================================
// Stream Port
// =============================================================================

/// Which entries a consumer-group read returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCursor {
    /// Entries never delivered to the group.
    New,
    /// Entries delivered to this consumer but not acknowledged, idle for at
    /// least `min_idle` since their last delivery.
    Pending { min_idle: Duration },
}

/// Port for the append-only log with consumer groups.
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Create a consumer group (and the stream if absent). Returns `false`
    /// if the group already existed.
    async fn create_group(&self, stream: &str, group: &str) -> Result<bool>;

    /// Append an entry, returning its queue-assigned id.
    async fn append(&self, stream: &str, fields: Fields) -> Result<EntryId>;

    /// Read up to `count` entries for `consumer` in `group`, waiting up to
    /// `block` when nothing is available. Returned entries are (re)marked as
    /// pending for that consumer.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>>;

    /// Acknowledge entries. Returns how many were pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<usize>;

    /// Number of delivered-but-unacknowledged entries in the group.
    async fn pending_count(&self, stream: &str, group: &str) -> Result<usize>;

    /// All entries of a stream, oldest first.
    async fn range(&self, stream: &str) -> Result<Vec<StreamEntry>>;
}

// =============================================================================
// Script Port
// =============================================================================

/// Operations visible to a script while it runs. Everything a script does
/// happens in one indivisible step with respect to all other store clients.
pub trait ScriptContext {
    fn get(&mut self, key: &str) -> Option<String>;
    fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64>;
    fn set_contains(&mut self, key: &str, member: &str) -> bool;
    fn set_add(&mut self, key: &str, member: &str) -> bool;
    fn stream_append(&mut self, stream: &str, fields: Fields) -> EntryId;
}

/// Script entrypoint: `(context, keys, args) -> status`.
pub type ScriptFn = fn(&mut dyn ScriptContext, &[String], &[String]) -> Result<i64>;

/// A server-side script. Adapters either run `body` under their own
/// exclusive section or dispatch on `name` to an equivalent script
/// registered with the server.
#[derive(Debug, Clone, Copy)]
pub struct Script {
    pub name: &'static str,
    pub body: ScriptFn,
}

impl Script {
    pub const fn new(name: &'static str, body: ScriptFn) -> Self {
        Self { name, body }
    }
}

/// Port for atomic, single-round-trip scripted evaluation.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn eval(&self, script: &Script, keys: &[String], args: &[String]) -> Result<i64>;
}

// =============================================================================
// Durable Store Port
// =============================================================================

/// Port for the durable relational store.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Begin a transaction.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;

    async fn find_item(&self, id: i64) -> Result<Option<InventoryItem>>;

    async fn find_shop(&self, id: i64) -> Result<Option<Shop>>;

    async fn item_ids(&self) -> Result<Vec<i64>>;

    async fn shop_ids(&self) -> Result<Vec<i64>>;

    async fn orders_for_item(&self, item_id: i64) -> Result<Vec<Order>>;
}

/// An open transaction. Dropping it without `commit` discards its writes.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn has_order(&mut self, user_id: i64, item_id: i64) -> Result<bool>;

    /// `UPDATE stock = stock - 1 WHERE id = ? AND stock > 0`; returns rows affected.
    async fn decrement_stock(&mut self, item_id: i64) -> Result<u64>;

    /// Current stock as seen by this transaction, `None` if the item is absent.
    async fn item_stock(&mut self, item_id: i64) -> Result<Option<i64>>;

    async fn insert_order(&mut self, order: &Order) -> Result<()>;

    async fn insert_item(&mut self, item: &InventoryItem) -> Result<()>;

    /// Returns rows affected.
    async fn update_item(&mut self, item: &InventoryItem) -> Result<u64>;

    async fn upsert_shop(&mut self, shop: &Shop) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Port for publishing domain events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a domain event.
    async fn publish(&self, event: DomainEvent) -> Result<()>;

    /// Publish multiple events.
    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()>;
}
