//! Flash-sale admission and inventory.

mod admission;
mod id_worker;
mod inventory;

pub use admission::{
    admitted_key, stock_key, AdmissionConfig, AdmissionGate, AdmissionResult, ADMISSION_SCRIPT,
    ADMITTED_KEY_PREFIX, STATUS_ADMITTED, STATUS_DUPLICATE_ADMISSION, STATUS_INSUFFICIENT_STOCK,
    STOCK_KEY_PREFIX,
};
pub use id_worker::OrderIdGenerator;
pub use inventory::{InventoryConfig, InventoryService};
