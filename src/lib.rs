//! Flash-Sale Order Pipeline
//!
//! Admits purchase attempts against a limited, time-windowed inventory,
//! guarantees no overselling and at most one order per user and item, and
//! durably turns admitted attempts into persisted orders under partial
//! failure.
//!
//! # Architecture
//!
//! ```text
//! admit ─► AdmissionGate ──(atomic script)──► stream.orders
//!                                                  │
//!                          ┌───────────────────────┴──────┐
//!                          ▼                              ▼
//!                   new-entry loop                  pending loop
//!                          └──────────► OrderFulfiller ◄──┘
//!                                  (lock:voucher:{id} + tx)
//! ```
//!
//! Entity reads go through the cache layer (cache-aside, null caching,
//! mutex rebuild, logical expiration) behind a bloom filter.
//!
//! # Modules
//!
//! - [`adapters`] - In-memory fast store, durable store and event publishers
//! - [`cache`] - Cache strategies, bloom filter and background refresher
//! - [`domain`] - Value objects, events and store ports
//! - [`error`] - Error types and their retry categories
//! - [`fulfillment`] - Lock-guarded order persistence
//! - [`lock`] - Token-owned distributed lock with watchdog renewal
//! - [`metrics`] - Prometheus instruments
//! - [`pipeline`] - Component wiring
//! - [`queue`] - Consumer loops, retry bookkeeping and dead letters
//! - [`seckill`] - Admission gate, order ids and inventory registration
//! - [`shop`] - Cached shop lookups

pub mod adapters;
pub mod cache;
pub mod domain;
pub mod error;
pub mod fulfillment;
pub mod lock;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod seckill;
pub mod shop;

// Re-export commonly used types
pub use cache::{CacheStrategy, EntityCache};
pub use error::{Error, ErrorCategory, Result};
pub use fulfillment::{FulfillmentOutcome, OrderFulfiller};
pub use lock::DistributedLock;
pub use metrics::PipelineMetrics;
pub use pipeline::{Pipeline, PipelineConfig};
pub use queue::{OrderQueue, QueueProcessor};
pub use seckill::{AdmissionGate, InventoryService};
pub use shop::ShopDirectory;
