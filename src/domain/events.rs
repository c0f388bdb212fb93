//! Domain Events
//!
//! Immutable records of significant pipeline occurrences, used for audit
//! logging and for asserting outcomes in tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Domain event representing a significant occurrence in the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    // =========================================================================
    // Admission Events
    // =========================================================================
    /// A purchase attempt was admitted and enqueued.
    OrderAdmitted {
        item_id: i64,
        user_id: i64,
        order_id: i64,
        timestamp: DateTime<Utc>,
    },

    /// A purchase attempt was rejected.
    AdmissionRejected {
        item_id: i64,
        user_id: i64,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Fulfillment Events
    // =========================================================================
    /// An order row was persisted.
    OrderCreated {
        item_id: i64,
        user_id: i64,
        order_id: i64,
        entry_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A redelivered intent was already fulfilled.
    DuplicateOrderIgnored {
        item_id: i64,
        user_id: i64,
        entry_id: String,
        timestamp: DateTime<Utc>,
    },

    /// An entry was moved to the dead-letter stream.
    EntryDeadLettered {
        entry_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Infrastructure Events
    // =========================================================================
    /// A watchdog failed to renew a lock.
    LockLost {
        key: String,
        timestamp: DateTime<Utc>,
    },

    /// A logical-expiry refresh request was dropped because the queue was full.
    CacheRefreshDropped {
        key: String,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    pub fn order_admitted(item_id: i64, user_id: i64, order_id: i64) -> Self {
        DomainEvent::OrderAdmitted {
            item_id,
            user_id,
            order_id,
            timestamp: Utc::now(),
        }
    }

    pub fn admission_rejected(item_id: i64, user_id: i64, reason: impl Into<String>) -> Self {
        DomainEvent::AdmissionRejected {
            item_id,
            user_id,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn order_created(item_id: i64, user_id: i64, order_id: i64, entry_id: &str) -> Self {
        DomainEvent::OrderCreated {
            item_id,
            user_id,
            order_id,
            entry_id: entry_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn duplicate_order_ignored(item_id: i64, user_id: i64, entry_id: &str) -> Self {
        DomainEvent::DuplicateOrderIgnored {
            item_id,
            user_id,
            entry_id: entry_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn entry_dead_lettered(entry_id: &str, reason: impl Into<String>) -> Self {
        DomainEvent::EntryDeadLettered {
            entry_id: entry_id.to_string(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn lock_lost(key: &str) -> Self {
        DomainEvent::LockLost {
            key: key.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn cache_refresh_dropped(key: &str) -> Self {
        DomainEvent::CacheRefreshDropped {
            key: key.to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::OrderAdmitted { .. } => "OrderAdmitted",
            DomainEvent::AdmissionRejected { .. } => "AdmissionRejected",
            DomainEvent::OrderCreated { .. } => "OrderCreated",
            DomainEvent::DuplicateOrderIgnored { .. } => "DuplicateOrderIgnored",
            DomainEvent::EntryDeadLettered { .. } => "EntryDeadLettered",
            DomainEvent::LockLost { .. } => "LockLost",
            DomainEvent::CacheRefreshDropped { .. } => "CacheRefreshDropped",
        }
    }

    /// Get the event timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DomainEvent::OrderAdmitted { timestamp, .. }
            | DomainEvent::AdmissionRejected { timestamp, .. }
            | DomainEvent::OrderCreated { timestamp, .. }
            | DomainEvent::DuplicateOrderIgnored { timestamp, .. }
            | DomainEvent::EntryDeadLettered { timestamp, .. }
            | DomainEvent::LockLost { timestamp, .. }
            | DomainEvent::CacheRefreshDropped { timestamp, .. } => *timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names() {
        assert_eq!(DomainEvent::order_admitted(1, 2, 3).event_type(), "OrderAdmitted");
        assert_eq!(
            DomainEvent::entry_dead_lettered("1-0", "boom").event_type(),
            "EntryDeadLettered"
        );
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_string(&DomainEvent::lock_lost("lock:voucher:1")).unwrap();
        assert!(json.contains("\"type\":\"LockLost\""));
        assert!(json.contains("lock:voucher:1"));
    }
}
