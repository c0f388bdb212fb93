//! Durable Order Queue
//!
//! Consumer-group reads over the order stream, bounded redelivery with a
//! per-entry retry counter, and a dead-letter stream for entries that
//! cannot be fulfilled.

mod processor;
mod retry;
mod stream;

pub use processor::{Disposition, QueueProcessor};
pub use retry::RetryTracker;
pub use stream::{
    OrderQueue, QueueConfig, DEAD_LETTER_STREAM, DEFAULT_CONSUMER, DEFAULT_GROUP, ORDER_STREAM,
};
