//! Domain Layer
//!
//! Value objects, port traits and domain events shared by the cache engine,
//! the lock, the id generator and the flash-sale pipeline.
//!
//! # Architecture
//!
//! - **Model** (`model.rs`) - Identifiers, vouchers, tickets, purchase outcomes
//! - **Ports** (`ports.rs`) - Trait abstractions for external collaborators
//! - **Events** (`events.rs`) - Domain events for audit and decoupling
//!
//! # Usage
//!
//! ```ignore
//! use flashmart::domain::ports::KeyValueBackend;
//!
//! async fn stock_left<B: KeyValueBackend>(backend: &B, key: &str) -> Result<Option<Bytes>> {
//!     backend.get(key).await
//! }
//! ```

pub mod events;
pub mod model;
pub mod ports;

// Re-export commonly used types
pub use events::DomainEvent;
pub use model::{Admission, OrderId, OrderTicket, RejectReason, UserId, Voucher, VoucherId};
pub use ports::{
    AtomicScript, DeadLetter, DeadLetterSink, EventPublisher, InsertOutcome, KeyValueBackend,
    OrderStore, ScriptContext, SourceLoader,
};
