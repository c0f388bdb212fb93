//! Admission Gate
//!
//! Decides, in one atomic evaluation on the fast store, whether a purchase
//! attempt may proceed. An admitted attempt leaves behind exactly one queue
//! entry for the fulfillment worker:
//!
//! ```text
//! stock <= 0              -> 1 (insufficient stock)
//! user in admitted set    -> 2 (duplicate admission)
//! otherwise               -> stock -= 1, add user, append entry, 0
//! ```

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument, warn};

use super::id_worker::OrderIdGenerator;
use crate::cache::{CacheStrategy, EntityCache};
use crate::domain::events::DomainEvent;
use crate::domain::model::{
    Fields, InventoryItem, OrderId, FIELD_ITEM_ID, FIELD_ORDER_ID, FIELD_USER_ID,
};
use crate::domain::ports::{EventPublisher, Script, ScriptContext, ScriptRunner};
use crate::error::{Error, Result};
use crate::metrics::PipelineMetrics;
use crate::queue::ORDER_STREAM;

/// Fast-store key prefix holding an item's remaining stock.
pub const STOCK_KEY_PREFIX: &str = "seckill:stock:";
/// Fast-store key prefix of the set of users admitted for an item.
pub const ADMITTED_KEY_PREFIX: &str = "seckill:order:";

pub const STATUS_ADMITTED: i64 = 0;
pub const STATUS_INSUFFICIENT_STOCK: i64 = 1;
pub const STATUS_DUPLICATE_ADMISSION: i64 = 2;

pub fn stock_key(item_id: i64) -> String {
    format!("{}{}", STOCK_KEY_PREFIX, item_id)
}

pub fn admitted_key(item_id: i64) -> String {
    format!("{}{}", ADMITTED_KEY_PREFIX, item_id)
}

/// Keys: `[stock, admitted set, stream]`. Args: `[item id, user id, order id]`.
pub static ADMISSION_SCRIPT: Script = Script::new("seckill_admission", admission_script);

fn admission_script(ctx: &mut dyn ScriptContext, keys: &[String], args: &[String]) -> Result<i64> {
    let [stock, admitted, stream] = keys else {
        return Err(Error::Internal(format!(
            "admission script expects 3 keys, got {}",
            keys.len()
        )));
    };
    let [item_id, user_id, order_id] = args else {
        return Err(Error::Internal(format!(
            "admission script expects 3 args, got {}",
            args.len()
        )));
    };

    let remaining = match ctx.get(stock) {
        Some(raw) => raw.parse::<i64>().map_err(|e| {
            Error::Internal(format!("stock at {} is not an integer: {}", stock, e))
        })?,
        None => 0,
    };
    if remaining <= 0 {
        return Ok(STATUS_INSUFFICIENT_STOCK);
    }
    if ctx.set_contains(admitted, user_id) {
        return Ok(STATUS_DUPLICATE_ADMISSION);
    }

    ctx.incr_by(stock, -1)?;
    ctx.set_add(admitted, user_id);

    let mut fields = Fields::new();
    fields.insert(FIELD_USER_ID.to_string(), user_id.clone());
    fields.insert(FIELD_ITEM_ID.to_string(), item_id.clone());
    fields.insert(FIELD_ORDER_ID.to_string(), order_id.clone());
    ctx.stream_append(stream, fields);

    Ok(STATUS_ADMITTED)
}

/// Outcome of the atomic evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionResult {
    Admitted(OrderId),
    InsufficientStock,
    DuplicateAdmission,
}

impl AdmissionResult {
    pub fn from_status(status: i64, order_id: OrderId) -> Result<Self> {
        match status {
            STATUS_ADMITTED => Ok(AdmissionResult::Admitted(order_id)),
            STATUS_INSUFFICIENT_STOCK => Ok(AdmissionResult::InsufficientStock),
            STATUS_DUPLICATE_ADMISSION => Ok(AdmissionResult::DuplicateAdmission),
            other => Err(Error::Internal(format!(
                "unknown admission status {}",
                other
            ))),
        }
    }
}

/// Admission settings.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Stream receiving admitted intents
    pub stream: String,

    /// Namespace of the order id counter
    pub id_prefix: String,

    /// Cache policy for the sale-window lookup
    pub lookup_strategy: CacheStrategy,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            stream: ORDER_STREAM.to_string(),
            id_prefix: "order".to_string(),
            lookup_strategy: CacheStrategy::MutexRebuild,
        }
    }
}

/// Front door of the pipeline.
pub struct AdmissionGate {
    scripts: Arc<dyn ScriptRunner>,
    items: EntityCache<InventoryItem>,
    ids: OrderIdGenerator,
    metrics: PipelineMetrics,
    events: Arc<dyn EventPublisher>,
    config: AdmissionConfig,
}

impl std::fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AdmissionGate {
    pub fn new(
        scripts: Arc<dyn ScriptRunner>,
        items: EntityCache<InventoryItem>,
        ids: OrderIdGenerator,
        metrics: PipelineMetrics,
        events: Arc<dyn EventPublisher>,
        config: AdmissionConfig,
    ) -> Self {
        Self {
            scripts,
            items,
            ids,
            metrics,
            events,
            config,
        }
    }

    /// Admit a purchase attempt. Refusals come back as rejection errors;
    /// on success the intent is already queued.
    #[instrument(skip(self))]
    pub async fn admit(&self, item_id: i64, user_id: i64) -> Result<OrderId> {
        let result = self.check_and_admit(item_id, user_id).await;

        let event = match &result {
            Ok(order_id) => {
                self.metrics.record_admission("admitted");
                debug!(item_id, user_id, order_id = %order_id, "Purchase admitted");
                Some(DomainEvent::order_admitted(item_id, user_id, order_id.0))
            }
            Err(e) if e.is_rejection() => {
                self.metrics.record_admission(rejection_label(e));
                debug!(item_id, user_id, reason = %e, "Purchase rejected");
                Some(DomainEvent::admission_rejected(item_id, user_id, e.to_string()))
            }
            Err(e) => {
                self.metrics.record_admission("error");
                warn!(item_id, user_id, error = %e, "Admission failed");
                None
            }
        };
        if let Some(event) = event {
            if let Err(e) = self.events.publish(event).await {
                warn!(error = %e, "Failed to publish admission event");
            }
        }

        result
    }

    async fn check_and_admit(&self, item_id: i64, user_id: i64) -> Result<OrderId> {
        let item = self
            .items
            .get(item_id, self.config.lookup_strategy)
            .await?
            .ok_or(Error::ItemNotFound(item_id))?;
        item.ensure_open(Utc::now())?;

        let order_id = self.ids.next_id(&self.config.id_prefix).await?;
        match self.evaluate(item_id, user_id, order_id).await? {
            AdmissionResult::Admitted(order_id) => Ok(order_id),
            AdmissionResult::InsufficientStock => Err(Error::InsufficientStock { item_id }),
            AdmissionResult::DuplicateAdmission => {
                Err(Error::DuplicateAdmission { item_id, user_id })
            }
        }
    }

    /// Run the atomic check against the fast store, without the sale-window
    /// check.
    pub async fn evaluate(
        &self,
        item_id: i64,
        user_id: i64,
        order_id: OrderId,
    ) -> Result<AdmissionResult> {
        let keys = [
            stock_key(item_id),
            admitted_key(item_id),
            self.config.stream.clone(),
        ];
        let args = [
            item_id.to_string(),
            user_id.to_string(),
            order_id.to_string(),
        ];
        let status = self.scripts.eval(&ADMISSION_SCRIPT, &keys, &args).await?;
        AdmissionResult::from_status(status, order_id)
    }
}

fn rejection_label(e: &Error) -> &'static str {
    match e {
        Error::SaleNotStarted { .. } => "not_started",
        Error::SaleEnded { .. } => "ended",
        Error::InsufficientStock { .. } => "insufficient_stock",
        Error::DuplicateAdmission { .. } => "duplicate",
        Error::ItemNotFound(_) => "not_found",
        _ => "rejected",
    }
}
