//! Cluster-unique order ids.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::domain::model::OrderId;
use crate::domain::ports::KeyValueStore;
use crate::error::Result;

/// Issues order ids from a per-day counter in the shared fast store.
#[derive(Clone)]
pub struct OrderIdGenerator {
    store: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for OrderIdGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderIdGenerator").finish_non_exhaustive()
    }
}

impl OrderIdGenerator {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn next_id(&self, prefix: &str) -> Result<OrderId> {
        self.next_id_at(prefix, Utc::now()).await
    }

    /// Seconds since the id epoch in the high bits, the day's counter in
    /// the low bits.
    pub async fn next_id_at(&self, prefix: &str, now: DateTime<Utc>) -> Result<OrderId> {
        let count = self.store.incr(&Self::counter_key(prefix, now)).await?;
        Ok(OrderId::compose(now, count))
    }

    pub fn counter_key(prefix: &str, now: DateTime<Utc>) -> String {
        format!("icr:{}:{}", prefix, now.format("%Y:%m:%d"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryFastStore;
    use chrono::TimeZone;

    #[test]
    fn test_counter_key_is_per_day() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();
        assert_eq!(
            OrderIdGenerator::counter_key("order", now),
            "icr:order:2024:03:09"
        );
    }

    #[tokio::test]
    async fn test_ids_increase_and_carry_time() {
        let generator = OrderIdGenerator::new(Arc::new(MemoryFastStore::new()));
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();

        let first = generator.next_id_at("order", now).await.unwrap();
        let second = generator.next_id_at("order", now).await.unwrap();

        assert!(second > first);
        assert_eq!(first.sequence(), 1);
        assert_eq!(second.sequence(), 2);
        assert_eq!(first.issued_at(), now);
    }
}
