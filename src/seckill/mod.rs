//! Flash-Sale Pipeline
//!
//! Limited-inventory purchases under heavy concurrency, with no oversell and
//! at most one order per user and voucher.
//!
//! # Flow
//!
//! ```text
//!  attempt_purchase(voucher, user)
//!        │
//!        ├─ 1. IdGenerator::next("order")            ──▶ order id
//!        │
//!        ├─ 2. SeckillScript (one atomic backend step)
//!        │       window?  ── no ──▶ NotStarted / Ended
//!        │       stock>0? ── no ──▶ OutOfStock
//!        │       marker?  ── yes ─▶ AlreadyOrdered
//!        │       stock -= 1, marker = order id
//!        │
//!        ├─ 3. OrderPersistenceWorker::enqueue(ticket)
//!        │       (bounded pool, per-user lock, idempotent insert,
//!        │        backoff retries, then dead-letter)
//!        │
//!        └─ 4. return Admitted(order id)   (no wait for the durable write)
//! ```
//!
//! The reservation in step 2 is final. A ticket that cannot be persisted is
//! dead-lettered for an operator; stock and markers are never rolled back.
//!
//! Vouchers must be published with [`AdmissionController::publish_voucher`]
//! before the sale; purchases against an unpublished voucher fail with
//! [`Error::UnknownVoucher`](crate::Error::UnknownVoucher).

mod admission;
mod metrics;
mod persistence;
mod script;

pub use admission::{AdmissionConfig, AdmissionController};
pub use metrics::{AdmissionMetrics, AdmissionMetricsSnapshot};
pub use persistence::{OrderPersistenceWorker, PersistenceConfig};
pub use script::{decode_window, encode_window, PublishScript, SeckillScript};
