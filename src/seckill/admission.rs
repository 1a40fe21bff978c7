//! Flash-sale admission controller.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use super::metrics::AdmissionMetrics;
use super::persistence::OrderPersistenceWorker;
use super::script::{
    encode_window, PublishScript, SeckillScript, CODE_ADMITTED, CODE_UNKNOWN_VOUCHER,
};
use crate::domain::events::DomainEvent;
use crate::domain::model::{Admission, OrderId, OrderTicket, RejectReason, UserId, Voucher, VoucherId};
use crate::domain::ports::{EventPublisher, KeyValueBackend};
use crate::error::{Error, Result};
use crate::idgen::IdGenerator;

/// Admission controller configuration
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Remaining stock counter, per voucher
    pub stock_key_prefix: String,
    /// Sale window, per voucher
    pub window_key_prefix: String,
    /// Per (voucher, user) reservation marker
    pub order_key_prefix: String,
    /// Business key used to mint order ids
    pub id_biz_key: String,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            stock_key_prefix: "seckill:stock:".to_string(),
            window_key_prefix: "seckill:window:".to_string(),
            order_key_prefix: "seckill:order:".to_string(),
            id_biz_key: "order".to_string(),
        }
    }
}

impl AdmissionConfig {
    pub fn stock_key(&self, voucher_id: VoucherId) -> String {
        format!("{}{}", self.stock_key_prefix, voucher_id)
    }

    pub fn window_key(&self, voucher_id: VoucherId) -> String {
        format!("{}{}", self.window_key_prefix, voucher_id)
    }

    pub fn order_key(&self, voucher_id: VoucherId, user_id: UserId) -> String {
        format!("{}{}:{}", self.order_key_prefix, voucher_id, user_id)
    }
}

/// Flash-sale purchase pipeline.
///
/// Mints an order id, runs [`SeckillScript`] to check the window, stock and
/// one-order-per-user rule and to reserve a unit in the same step, then
/// hands the ticket to the [`OrderPersistenceWorker`] without waiting for
/// the durable write.
pub struct AdmissionController {
    backend: Arc<dyn KeyValueBackend>,
    ids: Arc<IdGenerator>,
    persistence: Arc<OrderPersistenceWorker>,
    publisher: Option<Arc<dyn EventPublisher>>,
    metrics: Arc<AdmissionMetrics>,
    config: AdmissionConfig,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("config", &self.config)
            .field("metrics", &self.metrics.snapshot())
            .finish()
    }
}

impl AdmissionController {
    pub fn new(
        backend: Arc<dyn KeyValueBackend>,
        ids: Arc<IdGenerator>,
        persistence: Arc<OrderPersistenceWorker>,
        config: AdmissionConfig,
    ) -> Self {
        let metrics = persistence.metrics();
        Self {
            backend,
            ids,
            persistence,
            publisher: None,
            metrics,
            config,
        }
    }

    /// Publish admission events to `publisher`.
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn metrics(&self) -> &AdmissionMetrics {
        &self.metrics
    }

    /// Load a voucher's stock and sale window into the backend.
    ///
    /// Stock and window are written in one atomic step. Republishing resets
    /// the stock counter; reservation markers are kept.
    #[instrument(skip(self, voucher), fields(voucher_id = %voucher.id))]
    pub async fn publish_voucher(&self, voucher: &Voucher) -> Result<()> {
        if voucher.end_time < voucher.begin_time {
            return Err(Error::Config(format!(
                "voucher {} ends before it begins",
                voucher.id
            )));
        }

        let window = encode_window(
            voucher.begin_time.timestamp_millis(),
            voucher.end_time.timestamp_millis(),
        );
        let keys = [
            self.config.stock_key(voucher.id),
            self.config.window_key(voucher.id),
        ];
        let args = [voucher.stock.to_string(), window];
        self.backend.eval(&PublishScript, &keys, &args).await?;

        info!(stock = voucher.stock, begin = %voucher.begin_time, end = %voucher.end_time, "Voucher published");
        self.publish(DomainEvent::voucher_published(voucher)).await;
        Ok(())
    }

    /// Current stock counter, or `None` if the voucher is not published.
    pub async fn remaining_stock(&self, voucher_id: VoucherId) -> Result<Option<i64>> {
        let Some(raw) = self.backend.get(&self.config.stock_key(voucher_id)).await? else {
            return Ok(None);
        };
        std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Some)
            .ok_or_else(|| Error::Backend(format!("corrupt stock counter for voucher {}", voucher_id)))
    }

    /// Order id reserved by `user_id` for `voucher_id`, if any.
    pub async fn reservation(&self, voucher_id: VoucherId, user_id: UserId) -> Result<Option<OrderId>> {
        let raw = self
            .backend
            .get(&self.config.order_key(voucher_id, user_id))
            .await?;
        Ok(raw
            .and_then(|v| std::str::from_utf8(&v).ok().and_then(|s| s.parse().ok()))
            .map(OrderId))
    }

    /// Try to buy one unit of `voucher_id` for `user_id`.
    ///
    /// Sold out, duplicate and out-of-window attempts come back as
    /// [`Admission::Rejected`] with nothing mutated. Errors are reserved
    /// for infrastructure failures and unpublished vouchers. Once the
    /// reservation is committed the order id is always returned, even if
    /// the ticket could not be handed off for persistence.
    #[instrument(skip(self), fields(voucher_id = %voucher_id, user_id = %user_id))]
    pub async fn attempt_purchase(&self, voucher_id: VoucherId, user_id: UserId) -> Result<Admission> {
        self.metrics.record_attempt();
        let order_id = OrderId(self.ids.next(&self.config.id_biz_key).await?);

        let keys = [
            self.config.stock_key(voucher_id),
            self.config.window_key(voucher_id),
            self.config.order_key(voucher_id, user_id),
        ];
        let args = [
            Utc::now().timestamp_millis().to_string(),
            order_id.to_string(),
        ];
        let code = self.backend.eval(&SeckillScript, &keys, &args).await?;

        match code {
            CODE_ADMITTED => {
                let ticket = OrderTicket::new(order_id, user_id, voucher_id);
                if let Err(e) = self.persistence.enqueue(ticket.clone()).await {
                    // Reservation stands; the ticket needs an operator
                    error!(order_id = %order_id, error = %e, "Admitted ticket lost before persistence");
                }
                self.metrics.record_admitted();
                info!(order_id = %order_id, "Purchase admitted");
                self.publish(DomainEvent::order_admitted(&ticket)).await;
                Ok(Admission::Admitted(order_id))
            }
            CODE_UNKNOWN_VOUCHER => {
                self.metrics.record_unknown_voucher();
                warn!("Purchase against unpublished voucher");
                Err(Error::UnknownVoucher(voucher_id.0))
            }
            other => {
                let reason = RejectReason::from_code(other).ok_or_else(|| Error::Script {
                    script: "seckill_admit".to_string(),
                    reason: format!("unexpected result code {}", other),
                })?;
                self.metrics.record_rejected(reason);
                debug!(reason = %reason, "Purchase rejected");
                self.publish(DomainEvent::purchase_rejected(user_id, voucher_id, reason))
                    .await;
                Ok(Admission::Rejected(reason))
            }
        }
    }

    async fn publish(&self, event: DomainEvent) {
        if let Some(publisher) = &self.publisher {
            if let Err(e) = publisher.publish(event).await {
                warn!(error = %e, "Failed to publish admission event");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
