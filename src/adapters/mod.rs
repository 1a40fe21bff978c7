//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  KeyValueBackend │ OrderStore │ DeadLetterSink │ Events    │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ InMemoryKvBackend │ RedisKvBackend (feature redis-backend) │ │
//! │  │ InMemoryOrderStore │ dead-letter sinks │ event publishers  │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use flashmart::adapters::InMemoryKvBackend;
//! use flashmart::domain::ports::KeyValueBackend;
//!
//! let backend = Arc::new(InMemoryKvBackend::new());
//! backend.set("cache:shop:1", payload, Some(ttl)).await?;
//! ```

mod dead_letter;
mod event_publisher;
mod memory;
mod order_store;
#[cfg(feature = "redis-backend")]
mod redis_backend;

pub use dead_letter::{InMemoryDeadLetterQueue, LoggingDeadLetterSink};
pub use event_publisher::{CompositeEventPublisher, InMemoryEventCollector, LoggingEventPublisher};
pub use memory::{InMemoryBackendStats, InMemoryKvBackend};
pub use order_store::InMemoryOrderStore;
#[cfg(feature = "redis-backend")]
pub use redis_backend::RedisKvBackend;
