//! Order fulfillment: turns an admitted intent into a persisted order under
//! the item's distributed lock.

mod worker;

pub use worker::{FulfillmentConfig, FulfillmentOutcome, OrderFulfiller};
