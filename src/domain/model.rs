//! Domain Value Objects
//!
//! Identifiers, vouchers, order tickets and the outcome of a purchase attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Identifiers
// =============================================================================

/// Voucher identifier (value object).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VoucherId(pub u64);

impl VoucherId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for VoucherId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for VoucherId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Authenticated user identifier, supplied by the request handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub u64);

impl UserId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for UserId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Order identifier minted by the id generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderId(pub i64);

impl OrderId {
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for OrderId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

// =============================================================================
// Voucher
// =============================================================================

/// A limited-inventory flash-sale voucher.
///
/// The durable store owns the record; the backend holds a copy of the window
/// and the live stock counter once the voucher is published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voucher {
    pub id: VoucherId,
    pub begin_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub stock: u32,
}

impl Voucher {
    pub fn new(
        id: impl Into<VoucherId>,
        begin_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        stock: u32,
    ) -> Self {
        Self {
            id: id.into(),
            begin_time,
            end_time,
            stock,
        }
    }

    /// Check whether `now` falls inside the sale window (inclusive on both ends).
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.begin_time && now <= self.end_time
    }
}

// =============================================================================
// Order Ticket
// =============================================================================

/// Immutable record of a successful stock reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTicket {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub voucher_id: VoucherId,
    pub created_at: DateTime<Utc>,
}

impl OrderTicket {
    pub fn new(order_id: OrderId, user_id: UserId, voucher_id: VoucherId) -> Self {
        Self {
            order_id,
            user_id,
            voucher_id,
            created_at: Utc::now(),
        }
    }
}

// =============================================================================
// Purchase Outcome
// =============================================================================

/// Reason a purchase attempt was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectReason {
    OutOfStock,
    AlreadyOrdered,
    NotStarted,
    Ended,
}

impl RejectReason {
    /// Map a non-zero admission script code to a reason.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(RejectReason::OutOfStock),
            2 => Some(RejectReason::AlreadyOrdered),
            3 => Some(RejectReason::NotStarted),
            4 => Some(RejectReason::Ended),
            _ => None,
        }
    }

    /// Script code for this reason.
    pub fn code(&self) -> i64 {
        match self {
            RejectReason::OutOfStock => 1,
            RejectReason::AlreadyOrdered => 2,
            RejectReason::NotStarted => 3,
            RejectReason::Ended => 4,
        }
    }

    /// Client-facing message.
    pub fn message(&self) -> &'static str {
        match self {
            RejectReason::OutOfStock => "sold out",
            RejectReason::AlreadyOrdered => "already purchased",
            RejectReason::NotStarted => "sale not yet open",
            RejectReason::Ended => "sale has ended",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::OutOfStock => write!(f, "out_of_stock"),
            RejectReason::AlreadyOrdered => write!(f, "already_ordered"),
            RejectReason::NotStarted => write!(f, "not_started"),
            RejectReason::Ended => write!(f, "ended"),
        }
    }
}

/// Outcome of `AdmissionController::attempt_purchase`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Stock reserved; the ticket is queued for persistence.
    Admitted(OrderId),
    /// Turned away without mutating stock.
    Rejected(RejectReason),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }

    pub fn order_id(&self) -> Option<OrderId> {
        match self {
            Admission::Admitted(id) => Some(*id),
            Admission::Rejected(_) => None,
        }
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Admission::Admitted(_) => None,
            Admission::Rejected(reason) => Some(*reason),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_reject_reason_codes() {
        for reason in [
            RejectReason::OutOfStock,
            RejectReason::AlreadyOrdered,
            RejectReason::NotStarted,
            RejectReason::Ended,
        ] {
            assert_eq!(RejectReason::from_code(reason.code()), Some(reason));
        }
        assert_eq!(RejectReason::from_code(0), None);
        assert_eq!(RejectReason::from_code(99), None);
    }

    #[test]
    fn test_voucher_window() {
        let now = Utc::now();
        let voucher = Voucher::new(1, now - Duration::hours(1), now + Duration::hours(1), 10);

        assert!(voucher.is_open_at(now));
        assert!(!voucher.is_open_at(now - Duration::hours(2)));
        assert!(!voucher.is_open_at(now + Duration::hours(2)));
    }

    #[test]
    fn test_admission_accessors() {
        let admitted = Admission::Admitted(OrderId(7));
        assert!(admitted.is_admitted());
        assert_eq!(admitted.order_id(), Some(OrderId(7)));
        assert_eq!(admitted.reject_reason(), None);

        let rejected = Admission::Rejected(RejectReason::Ended);
        assert!(!rejected.is_admitted());
        assert_eq!(rejected.reject_reason(), Some(RejectReason::Ended));
        assert_eq!(rejected.reject_reason().unwrap().message(), "sale has ended");
    }

    #[test]
    fn test_id_display() {
        assert_eq!(VoucherId::new(3).to_string(), "3");
        assert_eq!(UserId::new(9).to_string(), "9");
        assert_eq!(OrderId::from(-1).to_string(), "-1");
    }
}
