//! Domain Model
//!
//! Value objects and entities shared by every pipeline component.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Seconds since the Unix epoch of 2022-01-01T00:00:00Z, the base of order ids.
pub const ORDER_ID_EPOCH_SECS: i64 = 1_640_995_200;

/// Number of low bits of an order id holding the per-day sequence.
pub const ORDER_ID_COUNT_BITS: u32 = 32;

// =============================================================================
// Inventory
// =============================================================================

/// A flash-sale inventory item with a limited stock and a sale window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryItem {
    pub id: i64,
    pub stock: i64,
    pub begin_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

/// Position of a point in time relative to a sale window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaleWindow {
    NotStarted,
    Open,
    Ended,
}

impl InventoryItem {
    pub fn new(id: i64, stock: i64, begin_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id,
            stock,
            begin_time,
            end_time,
            create_time: now,
            update_time: now,
        }
    }

    /// Classify `now` against the half-open window `[begin_time, end_time)`.
    pub fn window_at(&self, now: DateTime<Utc>) -> SaleWindow {
        if now < self.begin_time {
            SaleWindow::NotStarted
        } else if now >= self.end_time {
            SaleWindow::Ended
        } else {
            SaleWindow::Open
        }
    }

    /// Fail with the matching rejection unless the window is open at `now`.
    pub fn ensure_open(&self, now: DateTime<Utc>) -> Result<()> {
        match self.window_at(now) {
            SaleWindow::Open => Ok(()),
            SaleWindow::NotStarted => Err(Error::SaleNotStarted { item_id: self.id }),
            SaleWindow::Ended => Err(Error::SaleEnded { item_id: self.id }),
        }
    }
}

// =============================================================================
// Orders
// =============================================================================

/// Cluster-unique order identifier: seconds since [`ORDER_ID_EPOCH_SECS`] in
/// the high bits, a per-day counter in the low [`ORDER_ID_COUNT_BITS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderId(pub i64);

impl OrderId {
    pub fn compose(timestamp: DateTime<Utc>, sequence: i64) -> Self {
        let elapsed = timestamp.timestamp() - ORDER_ID_EPOCH_SECS;
        Self((elapsed << ORDER_ID_COUNT_BITS) | (sequence & 0xFFFF_FFFF))
    }

    /// Time the id was issued, at second resolution.
    pub fn issued_at(&self) -> DateTime<Utc> {
        let secs = (self.0 >> ORDER_ID_COUNT_BITS) + ORDER_ID_EPOCH_SECS;
        Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
    }

    pub fn sequence(&self) -> i64 {
        self.0 & 0xFFFF_FFFF
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A persisted, fulfilled purchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    pub user_id: i64,
    pub item_id: i64,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl Order {
    pub fn from_intent(intent: &PurchaseIntent) -> Self {
        let now = Utc::now();
        Self {
            id: intent.order_id,
            user_id: intent.user_id,
            item_id: intent.item_id,
            create_time: now,
            update_time: now,
        }
    }
}

// =============================================================================
// Purchase Intent
// =============================================================================

/// Wire field carrying the order id.
pub const FIELD_ORDER_ID: &str = "id";
/// Wire field carrying the user id.
pub const FIELD_USER_ID: &str = "userId";
/// Wire field carrying the inventory item id.
pub const FIELD_ITEM_ID: &str = "voucherId";

/// Field map of a stream entry.
pub type Fields = BTreeMap<String, String>;

/// An admitted purchase waiting to be fulfilled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseIntent {
    pub item_id: i64,
    pub user_id: i64,
    pub order_id: OrderId,
    pub created_at: DateTime<Utc>,
}

impl PurchaseIntent {
    pub fn new(item_id: i64, user_id: i64, order_id: OrderId) -> Self {
        Self {
            item_id,
            user_id,
            order_id,
            created_at: order_id.issued_at(),
        }
    }

    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert(FIELD_USER_ID.to_string(), self.user_id.to_string());
        fields.insert(FIELD_ITEM_ID.to_string(), self.item_id.to_string());
        fields.insert(FIELD_ORDER_ID.to_string(), self.order_id.to_string());
        fields
    }

    /// Strictly map a wire record onto an intent. Every field must be present
    /// and parse as a positive integer; nothing is defaulted.
    pub fn from_fields(entry_id: &EntryId, fields: &Fields) -> Result<Self> {
        let item_id = required_id(entry_id, fields, FIELD_ITEM_ID)?;
        let user_id = required_id(entry_id, fields, FIELD_USER_ID)?;
        let order_id = OrderId(required_id(entry_id, fields, FIELD_ORDER_ID)?);
        Ok(Self::new(item_id, user_id, order_id))
    }
}

fn required_id(entry_id: &EntryId, fields: &Fields, name: &str) -> Result<i64> {
    let raw = fields.get(name).ok_or_else(|| Error::MalformedEntry {
        entry_id: entry_id.to_string(),
        reason: format!("missing field '{}'", name),
    })?;
    match raw.trim().parse::<i64>() {
        Ok(v) if v > 0 => Ok(v),
        Ok(v) => Err(Error::MalformedEntry {
            entry_id: entry_id.to_string(),
            reason: format!("field '{}' must be positive, got {}", name, v),
        }),
        Err(e) => Err(Error::MalformedEntry {
            entry_id: entry_id.to_string(),
            reason: format!("field '{}' is not an integer: {}", name, e),
        }),
    }
}

// =============================================================================
// Stream Entries
// =============================================================================

/// Queue-assigned entry id: milliseconds plus a sequence within the millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    pub const ZERO: EntryId = EntryId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (ms, seq) = s
            .split_once('-')
            .ok_or_else(|| Error::Internal(format!("invalid entry id: {}", s)))?;
        let ms = ms
            .parse()
            .map_err(|_| Error::Internal(format!("invalid entry id: {}", s)))?;
        let seq = seq
            .parse()
            .map_err(|_| Error::Internal(format!("invalid entry id: {}", s)))?;
        Ok(Self { ms, seq })
    }
}

/// An entry read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: EntryId,
    pub fields: Fields,
    /// How many times this entry has been delivered to the group, including
    /// this delivery. Zero for plain range reads.
    pub delivery_count: u32,
}

// =============================================================================
// Shops
// =============================================================================

/// A shop listing; the second cached entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shop {
    pub id: i64,
    pub name: String,
    pub type_id: i64,
    pub address: String,
    pub score: u32,
}
