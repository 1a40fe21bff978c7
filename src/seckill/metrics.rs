//! Flash-sale pipeline counters.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::model::RejectReason;

/// Admission and persistence metrics, shared by the controller and the worker.
#[derive(Debug, Default)]
pub struct AdmissionMetrics {
    attempts: AtomicU64,
    admitted: AtomicU64,
    rejected_out_of_stock: AtomicU64,
    rejected_already_ordered: AtomicU64,
    rejected_not_started: AtomicU64,
    rejected_ended: AtomicU64,
    unknown_voucher: AtomicU64,

    persisted: AtomicU64,
    persisted_duplicates: AtomicU64,
    persistence_retries: AtomicU64,
    dead_lettered: AtomicU64,
}

impl AdmissionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self, reason: RejectReason) {
        let counter = match reason {
            RejectReason::OutOfStock => &self.rejected_out_of_stock,
            RejectReason::AlreadyOrdered => &self.rejected_already_ordered,
            RejectReason::NotStarted => &self.rejected_not_started,
            RejectReason::Ended => &self.rejected_ended,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unknown_voucher(&self) {
        self.unknown_voucher.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persisted(&self, duplicate: bool) {
        self.persisted.fetch_add(1, Ordering::Relaxed);
        if duplicate {
            self.persisted_duplicates.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_persistence_retry(&self) {
        self.persistence_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> AdmissionMetricsSnapshot {
        AdmissionMetricsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected_out_of_stock: self.rejected_out_of_stock.load(Ordering::Relaxed),
            rejected_already_ordered: self.rejected_already_ordered.load(Ordering::Relaxed),
            rejected_not_started: self.rejected_not_started.load(Ordering::Relaxed),
            rejected_ended: self.rejected_ended.load(Ordering::Relaxed),
            unknown_voucher: self.unknown_voucher.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            persisted_duplicates: self.persisted_duplicates.load(Ordering::Relaxed),
            persistence_retries: self.persistence_retries.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of flash-sale metrics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdmissionMetricsSnapshot {
    pub attempts: u64,
    pub admitted: u64,
    pub rejected_out_of_stock: u64,
    pub rejected_already_ordered: u64,
    pub rejected_not_started: u64,
    pub rejected_ended: u64,
    pub unknown_voucher: u64,
    pub persisted: u64,
    pub persisted_duplicates: u64,
    pub persistence_retries: u64,
    pub dead_lettered: u64,
}

impl AdmissionMetricsSnapshot {
    /// All business rejections.
    pub fn rejected(&self) -> u64 {
        self.rejected_out_of_stock
            + self.rejected_already_ordered
            + self.rejected_not_started
            + self.rejected_ended
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections_by_reason() {
        let metrics = AdmissionMetrics::new();
        metrics.record_rejected(RejectReason::OutOfStock);
        metrics.record_rejected(RejectReason::OutOfStock);
        metrics.record_rejected(RejectReason::Ended);
        metrics.record_persisted(true);

        let snap = metrics.snapshot();
        assert_eq!(snap.rejected_out_of_stock, 2);
        assert_eq!(snap.rejected_ended, 1);
        assert_eq!(snap.rejected(), 3);
        assert_eq!(snap.persisted, 1);
        assert_eq!(snap.persisted_duplicates, 1);
    }
}
