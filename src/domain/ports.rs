//! Domain Ports (DDD Port/Adapter Pattern)
//!
//! This module defines the abstractions the data-access layer depends on.
//! Infrastructure adapters implement these traits.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  KeyValueBackend │ SourceLoader │ OrderStore        │    │
//! │  │  AtomicScript    │ DeadLetterSink │ EventPublisher  │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  InMemoryKvBackend │ RedisKvBackend │ OrderStores   │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::events::DomainEvent;
use super::model::{OrderId, OrderTicket};
use crate::error::Result;

// =============================================================================
// Key-Value Backend Port
// =============================================================================

/// Port for the shared key-value cache/lock service.
///
/// Any store offering these primitives with single-node atomicity per key
/// and per script qualifies. Connectivity failures surface as
/// [`crate::Error::Backend`] and are never swallowed by callers.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    /// Read a value; `None` when absent or physically expired.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Write a value, optionally with a physical TTL.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()>;

    /// Write only if the key is absent. Returns true if the write happened.
    async fn set_nx(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool>;

    /// Delete a key. Returns true if it existed.
    async fn del(&self, key: &str) -> Result<bool>;

    /// Atomically increment an integer counter, creating it at zero.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Run a multi-step script as one indivisible step.
    async fn eval(&self, script: &dyn AtomicScript, keys: &[String], args: &[String])
        -> Result<i64>;
}

/// Key access available to a script while it runs.
///
/// Implementations hold whatever exclusion the backend needs for the whole
/// script; every call here sees the effects of the previous ones.
pub trait ScriptContext {
    fn get(&mut self, key: &str) -> Option<Bytes>;

    fn set(&mut self, key: &str, value: Bytes);

    fn del(&mut self, key: &str) -> bool;

    /// Increment an integer value by `delta`, creating it at zero.
    fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64>;
}

/// A check-and-mutate step executed atomically by the backend.
///
/// Each script carries two renditions of the same logic: Lua source for
/// servers that evaluate scripts remotely, and a native body for backends
/// that run in-process.
pub trait AtomicScript: Send + Sync {
    /// Stable script name, used in logs and errors.
    fn name(&self) -> &'static str;

    /// Lua rendition.
    fn lua(&self) -> &'static str;

    /// Native rendition.
    fn execute(&self, ctx: &mut dyn ScriptContext, keys: &[String], args: &[String])
        -> Result<i64>;
}

// =============================================================================
// Source Of Truth Port
// =============================================================================

/// By-id loader against the source of truth, used as the cache-miss fallback.
///
/// Closures `Fn(Id) -> impl Future<Output = anyhow::Result<Option<T>>>`
/// implement this trait directly.
#[async_trait]
pub trait SourceLoader<Id, T>: Send + Sync {
    /// Load a record; `Ok(None)` when it does not exist.
    async fn load(&self, id: &Id) -> anyhow::Result<Option<T>>;
}

#[async_trait]
impl<Id, T, F, Fut> SourceLoader<Id, T> for F
where
    Id: Clone + Send + Sync + 'static,
    T: Send + 'static,
    F: Fn(Id) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Option<T>>> + Send,
{
    async fn load(&self, id: &Id) -> anyhow::Result<Option<T>> {
        (self)(id.clone()).await
    }
}

// =============================================================================
// Order Store Port
// =============================================================================

/// Result of an order insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The ticket was written.
    Inserted,
    /// A record with this order id already exists; nothing was written.
    AlreadyExists,
}

/// Port for durable order persistence.
///
/// Inserts must be idempotent on `order_id`.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Insert a ticket.
    async fn insert(&self, ticket: &OrderTicket) -> anyhow::Result<InsertOutcome>;

    /// Find a ticket by order id.
    async fn find(&self, order_id: OrderId) -> anyhow::Result<Option<OrderTicket>>;
}

// =============================================================================
// Dead Letter Port
// =============================================================================

/// A ticket that exhausted its persistence attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub ticket: OrderTicket,
    pub attempts: u32,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}

/// Port for the operator-visible dead-letter path.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(&self, letter: DeadLetter) -> Result<()>;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Port for publishing domain events.
///
/// This trait abstracts event publishing, allowing different backends
/// (in-memory, logging, etc.) to be used.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a domain event.
    async fn publish(&self, event: DomainEvent) -> Result<()>;

    /// Publish multiple events.
    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()>;
}

// =============================================================================
// Tests
// =============================================================================
