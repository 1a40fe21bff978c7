//! Distributed Lock
//!
//! Best-effort, lease-based mutual exclusion built on SET-if-absent with a
//! TTL. Used to serialize cache rebuilds and per-user order persistence.
//!
//! # Lease lifecycle
//!
//! ```text
//! (free) ── try_acquire ──▶ held(token, ttl) ── release(token) ──▶ (free)
//!                                 │
//!                            ttl elapses
//!                                 ▼
//!                   (free) ── another try_acquire ──▶ held(token')
//! ```
//!
//! A release carrying a stale token after takeover is a no-op.
//!
//! # Known weakness
//!
//! There is no renewal and no fencing token. A critical section that
//! outlives its TTL can run concurrently with the next holder's.

mod lease;

pub use lease::{DistributedLock, LeaseGuard, LockConfig, LockLease, ReleaseScript};

/// Default prefix for lock keys
pub const LOCK_KEY_PREFIX: &str = "lock:";
