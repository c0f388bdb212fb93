//! Domain Layer
//!
//! Core value objects, events and port traits following Domain-Driven
//! Design principles.
//!
//! - **Model** (`model.rs`) - inventory items, intents, orders, stream entries
//! - **Ports** (`ports.rs`) - trait abstractions for the fast and durable stores
//! - **Events** (`events.rs`) - domain events for audit and decoupling

pub mod events;
pub mod model;
pub mod ports;

pub use events::DomainEvent;
pub use model::{
    EntryId, Fields, InventoryItem, Order, OrderId, PurchaseIntent, SaleWindow, Shop,
    StreamEntry,
};
pub use ports::{
    EventPublisher, KeyValueStore, OrderStore, ReadCursor, Script, ScriptContext, ScriptRunner,
    StoreTransaction, StreamStore,
};
