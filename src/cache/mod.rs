//! Cache-Aside Engine
//!
//! Read-mostly entities are served from the key-value backend and loaded
//! from the source of truth on demand. Two read strategies are offered, and
//! callers pick one per key space.
//!
//! # Strategies
//!
//! ```text
//! Passthrough (physical TTL)           Logical expiration (no TTL)
//! ──────────────────────────           ───────────────────────────
//! GET key                              GET key
//!  ├─ value      ─▶ return              ├─ absent        ─▶ None
//!  ├─ ""         ─▶ None (negative)     ├─ fresh         ─▶ return
//!  └─ absent                            └─ stale         ─▶ return stale
//!      ├─ [mutex] SETNX lock:key              └─ won SETNX lock:key
//!      │    └─ lost ─▶ sleep, retry              └─ rebuild on pool,
//!      └─ load ─▶ SET value / "" ─▶ return          release lock
//! ```
//!
//! # Failure semantics
//!
//! - Loader errors on a synchronous path surface as `SourceUnavailable`
//! - Loader errors in a background rebuild are logged and published as
//!   `CacheRebuildFailed`; the stale value stays in place
//! - The rebuild lock is released on every exit path

mod envelope;
mod metrics;
mod store;

pub use envelope::{is_empty_sentinel, LogicalEnvelope, EMPTY_SENTINEL};
pub use metrics::{CacheMetrics, CacheMetricsSnapshot};
pub use store::{CacheConfig, CacheStore};
