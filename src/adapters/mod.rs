//! Infrastructure Adapters
//!
//! Adapter implementations for the domain ports, following the
//! Port/Adapter (Hexagonal) architecture pattern.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │   KeyValueStore │ StreamStore │ ScriptRunner │ OrderStore        │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │   MemoryFastStore │ MemoryOrderStore │ LoggingEventPublisher     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

mod event_publisher;
mod fault;
mod memory_db;
mod memory_store;

pub use event_publisher::{InMemoryEventCollector, LoggingEventPublisher};
pub use fault::FaultInjector;
pub use memory_db::{MemoryOrderStore, Table};
pub use memory_store::MemoryFastStore;
