//! Flashmart - Data-Access Layer for a Local-Services Marketplace
//!
//! Cache-aside reads, distributed locking, id generation and flash-sale
//! admission over a shared key-value backend.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Request handlers                           │
//! └───────────┬───────────────────────────────┬──────────────────────┘
//!             │ get_or_load / logical          │ attempt_purchase
//!             ▼                                ▼
//! ┌───────────────────────┐      ┌───────────────────────────────────┐
//! │      CacheStore       │      │        AdmissionController        │
//! │  rebuild WorkerPool   │      │  IdGenerator │ SeckillScript       │
//! └───────┬───────────────┘      └──────┬────────────────┬───────────┘
//!         │ DistributedLock             │                │ enqueue
//!         ▼                             ▼                ▼
//! ┌──────────────────────────────────────────┐  ┌──────────────────────┐
//! │        KeyValueBackend (port)            │  │ OrderPersistenceWorker│
//! │  InMemoryKvBackend │ RedisKvBackend      │  │  → OrderStore (port)  │
//! └──────────────────────────────────────────┘  └──────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Infrastructure adapters implementing domain ports
//! - [`cache`] - Cache-aside engine with passthrough and logical expiration
//! - [`domain`] - Domain model, ports and events
//! - [`error`] - Error types
//! - [`idgen`] - Time-ordered distributed ids
//! - [`lock`] - Lease-based distributed lock
//! - [`seckill`] - Flash-sale admission and order persistence
//! - [`worker`] - Bounded async worker pools

pub mod adapters;
pub mod cache;
pub mod domain;
pub mod error;
pub mod idgen;
pub mod lock;
pub mod seckill;
pub mod worker;

// Re-export commonly used types
pub use cache::{CacheConfig, CacheStore};
pub use domain::{Admission, OrderId, OrderTicket, RejectReason, UserId, Voucher, VoucherId};
pub use error::{Error, Result};
pub use idgen::{IdGenerator, IdGeneratorConfig};
pub use lock::{DistributedLock, LockConfig, LockLease};
pub use seckill::{AdmissionConfig, AdmissionController, OrderPersistenceWorker, PersistenceConfig};
pub use worker::{WorkerPool, WorkerPoolConfig};
