//! Error types for the flash-sale pipeline

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// How an error should be treated by the component that observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// User-facing refusal; surfaced to the caller, never retried.
    Rejection,
    /// Infrastructure hiccup; retried with bounded backoff.
    Transient,
    /// Retrying cannot help; the entry is treated as handled.
    Permanent,
    /// Misconfiguration or a bug.
    Fatal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Rejection => write!(f, "rejection"),
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::Permanent => write!(f, "permanent"),
            ErrorCategory::Fatal => write!(f, "fatal"),
        }
    }
}

/// Errors that can occur in the flash-sale pipeline
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Admission Rejections
    // =========================================================================
    /// Sale window has not opened yet
    #[error("Sale for item {item_id} has not started")]
    SaleNotStarted { item_id: i64 },

    /// Sale window already closed
    #[error("Sale for item {item_id} has ended")]
    SaleEnded { item_id: i64 },

    /// No stock left
    #[error("Insufficient stock for item {item_id}")]
    InsufficientStock { item_id: i64 },

    /// User was already admitted for this item
    #[error("User {user_id} already admitted for item {item_id}")]
    DuplicateAdmission { item_id: i64, user_id: i64 },

    /// Item does not exist
    #[error("Item not found: {0}")]
    ItemNotFound(i64),

    /// Shop does not exist
    #[error("Shop not found: {0}")]
    ShopNotFound(i64),

    // =========================================================================
    // Transient Infrastructure Errors
    // =========================================================================
    /// Could not acquire a lock before the deadline
    #[error("Timed out acquiring lock {key}")]
    LockTimeout { key: String },

    /// Watchdog failed to renew; exclusivity can no longer be assumed
    #[error("Lost ownership of lock {key}")]
    LockLost { key: String },

    /// Conditional stock decrement affected no rows
    #[error("Stock update conflict for item {item_id}")]
    StockConflict { item_id: i64 },

    /// Backing store unreachable or refused the operation
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Blocking queue read exceeded its deadline
    #[error("Queue read timed out on stream {stream}")]
    QueueTimeout { stream: String },

    /// Cache rebuild lock never became available
    #[error("Cache rebuild for {key} did not complete after {attempts} attempts")]
    CacheRebuildTimeout { key: String, attempts: u32 },

    /// Operation exceeded its deadline
    #[error("Operation timed out: {0}")]
    Timeout(String),

    // =========================================================================
    // Permanent Fulfillment Errors
    // =========================================================================
    /// An order already exists for this (user, item)
    #[error("Order already exists for user {user_id} on item {item_id}")]
    DuplicateOrder { item_id: i64, user_id: i64 },

    /// Queue entry could not be mapped to a purchase intent
    #[error("Malformed queue entry {entry_id}: {reason}")]
    MalformedEntry { entry_id: String, reason: String },

    // =========================================================================
    // Fatal / Internal
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify this error for retry and propagation decisions.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::SaleNotStarted { .. }
            | Error::SaleEnded { .. }
            | Error::InsufficientStock { .. }
            | Error::DuplicateAdmission { .. }
            | Error::ItemNotFound(_)
            | Error::ShopNotFound(_) => ErrorCategory::Rejection,

            Error::LockTimeout { .. }
            | Error::LockLost { .. }
            | Error::StockConflict { .. }
            | Error::StoreUnavailable(_)
            | Error::QueueTimeout { .. }
            | Error::CacheRebuildTimeout { .. }
            | Error::Timeout(_)
            | Error::Io(_) => ErrorCategory::Transient,

            Error::DuplicateOrder { .. } | Error::MalformedEntry { .. } => {
                ErrorCategory::Permanent
            }

            Error::Config(_)
            | Error::Serialization(_)
            | Error::Metrics(_)
            | Error::Internal(_) => ErrorCategory::Fatal,
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// Whether this is a user-facing rejection.
    pub fn is_rejection(&self) -> bool {
        self.category() == ErrorCategory::Rejection
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            Error::InsufficientStock { item_id: 1 }.category(),
            ErrorCategory::Rejection
        );
        assert!(Error::StockConflict { item_id: 1 }.is_transient());
        assert!(Error::LockTimeout { key: "k".into() }.is_transient());
        assert_eq!(
            Error::DuplicateOrder {
                item_id: 1,
                user_id: 2
            }
            .category(),
            ErrorCategory::Permanent
        );
        assert!(!Error::Config("bad".into()).is_transient());
    }

    #[test]
    fn test_display() {
        let err = Error::DuplicateAdmission {
            item_id: 7,
            user_id: 9,
        };
        assert_eq!(err.to_string(), "User 9 already admitted for item 7");
        assert!(err.is_rejection());
    }
}
