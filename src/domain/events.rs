//! Domain Events
//!
//! Immutable records of significant occurrences in the data-access layer:
//! admissions, rejections, persistence outcomes and cache rebuilds.
//!
//! # Example
//!
//! ```ignore
//! let event = DomainEvent::order_admitted(&ticket);
//! event_publisher.publish(event).await?;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::model::{OrderTicket, RejectReason, UserId, Voucher, VoucherId};

/// Domain event representing a significant occurrence in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    // =========================================================================
    // Flash Sale Events
    // =========================================================================
    /// A voucher's stock and window were loaded into the backend.
    VoucherPublished {
        voucher_id: u64,
        stock: u32,
        begin_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    /// Stock was reserved and an order ticket was created.
    OrderAdmitted {
        order_id: i64,
        user_id: u64,
        voucher_id: u64,
        timestamp: DateTime<Utc>,
    },

    /// A purchase attempt was turned away.
    PurchaseRejected {
        user_id: u64,
        voucher_id: u64,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Persistence Events
    // =========================================================================
    /// A ticket reached the durable store.
    OrderPersisted {
        order_id: i64,
        attempts: u32,
        duplicate: bool,
        timestamp: DateTime<Utc>,
    },

    /// A ticket exhausted its attempts and was routed to the dead-letter path.
    OrderDeadLettered {
        order_id: i64,
        attempts: u32,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Cache Events
    // =========================================================================
    /// A logically-expired entry was rebuilt in the background.
    CacheRebuilt {
        key: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A background rebuild failed; the stale entry stays in place.
    CacheRebuildFailed {
        key: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Get the event timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DomainEvent::VoucherPublished { timestamp, .. } => *timestamp,
            DomainEvent::OrderAdmitted { timestamp, .. } => *timestamp,
            DomainEvent::PurchaseRejected { timestamp, .. } => *timestamp,
            DomainEvent::OrderPersisted { timestamp, .. } => *timestamp,
            DomainEvent::OrderDeadLettered { timestamp, .. } => *timestamp,
            DomainEvent::CacheRebuilt { timestamp, .. } => *timestamp,
            DomainEvent::CacheRebuildFailed { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::VoucherPublished { .. } => "VoucherPublished",
            DomainEvent::OrderAdmitted { .. } => "OrderAdmitted",
            DomainEvent::PurchaseRejected { .. } => "PurchaseRejected",
            DomainEvent::OrderPersisted { .. } => "OrderPersisted",
            DomainEvent::OrderDeadLettered { .. } => "OrderDeadLettered",
            DomainEvent::CacheRebuilt { .. } => "CacheRebuilt",
            DomainEvent::CacheRebuildFailed { .. } => "CacheRebuildFailed",
        }
    }

    /// Get the order id if applicable.
    pub fn order_id(&self) -> Option<i64> {
        match self {
            DomainEvent::OrderAdmitted { order_id, .. } => Some(*order_id),
            DomainEvent::OrderPersisted { order_id, .. } => Some(*order_id),
            DomainEvent::OrderDeadLettered { order_id, .. } => Some(*order_id),
            _ => None,
        }
    }
}

// =============================================================================
// Event Builders
// =============================================================================

impl DomainEvent {
    /// Create a VoucherPublished event.
    pub fn voucher_published(voucher: &Voucher) -> Self {
        DomainEvent::VoucherPublished {
            voucher_id: voucher.id.0,
            stock: voucher.stock,
            begin_time: voucher.begin_time,
            end_time: voucher.end_time,
            timestamp: Utc::now(),
        }
    }

    /// Create an OrderAdmitted event.
    pub fn order_admitted(ticket: &OrderTicket) -> Self {
        DomainEvent::OrderAdmitted {
            order_id: ticket.order_id.0,
            user_id: ticket.user_id.0,
            voucher_id: ticket.voucher_id.0,
            timestamp: ticket.created_at,
        }
    }

    /// Create a PurchaseRejected event.
    pub fn purchase_rejected(user_id: UserId, voucher_id: VoucherId, reason: RejectReason) -> Self {
        DomainEvent::PurchaseRejected {
            user_id: user_id.0,
            voucher_id: voucher_id.0,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Create an OrderPersisted event.
    pub fn order_persisted(ticket: &OrderTicket, attempts: u32, duplicate: bool) -> Self {
        DomainEvent::OrderPersisted {
            order_id: ticket.order_id.0,
            attempts,
            duplicate,
            timestamp: Utc::now(),
        }
    }

    /// Create an OrderDeadLettered event.
    pub fn order_dead_lettered(
        ticket: &OrderTicket,
        attempts: u32,
        reason: impl Into<String>,
    ) -> Self {
        DomainEvent::OrderDeadLettered {
            order_id: ticket.order_id.0,
            attempts,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create a CacheRebuilt event.
    pub fn cache_rebuilt(key: impl Into<String>, duration: Duration) -> Self {
        DomainEvent::CacheRebuilt {
            key: key.into(),
            duration_ms: duration.as_millis() as u64,
            timestamp: Utc::now(),
        }
    }

    /// Create a CacheRebuildFailed event.
    pub fn cache_rebuild_failed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        DomainEvent::CacheRebuildFailed {
            key: key.into(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
