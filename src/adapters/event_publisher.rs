//! Event Publisher Adapters
//!
//! Log sink with per-kind severity, an in-memory collector used by tests and
//! the simulator, and a fan-out composite.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn, Level};

use crate::domain::events::DomainEvent;
use crate::domain::ports::EventPublisher;
use crate::error::Result;

macro_rules! event_at {
    ($level:expr, $($arg:tt)+) => {
        match $level {
            Level::ERROR => error!($($arg)+),
            Level::WARN => warn!($($arg)+),
            Level::INFO => info!($($arg)+),
            _ => debug!($($arg)+),
        }
    };
}

/// Writes domain events to the tracing system as structured records.
///
/// Failures are always logged loudly: dead-lettered orders at error, failed
/// rebuilds at warn. Per-request events (admissions, rejections, duplicate
/// persists) stay at debug since a flash sale produces thousands of them.
/// Remaining milestones log at info unless the publisher is quiet.
#[derive(Debug, Clone, Default)]
pub struct LoggingEventPublisher {
    quiet: bool,
}

impl LoggingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publisher that demotes milestones to debug. Failures are unaffected.
    pub fn quiet() -> Self {
        Self { quiet: true }
    }

    /// Severity an event is logged at.
    pub fn level_for(&self, event: &DomainEvent) -> Level {
        match event {
            DomainEvent::OrderDeadLettered { .. } => Level::ERROR,
            DomainEvent::CacheRebuildFailed { .. } => Level::WARN,
            DomainEvent::OrderAdmitted { .. }
            | DomainEvent::PurchaseRejected { .. }
            | DomainEvent::OrderPersisted { duplicate: true, .. } => Level::DEBUG,
            _ if self.quiet => Level::DEBUG,
            _ => Level::INFO,
        }
    }
}

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        let level = self.level_for(&event);
        match &event {
            DomainEvent::VoucherPublished {
                voucher_id,
                stock,
                begin_time,
                end_time,
                ..
            } => event_at!(level, voucher_id, stock, begin = %begin_time, end = %end_time, "Voucher published"),
            DomainEvent::OrderAdmitted {
                order_id,
                user_id,
                voucher_id,
                ..
            } => event_at!(level, order_id, user_id, voucher_id, "Order admitted"),
            DomainEvent::PurchaseRejected {
                user_id,
                voucher_id,
                reason,
                ..
            } => event_at!(level, user_id, voucher_id, reason = %reason, "Purchase rejected"),
            DomainEvent::OrderPersisted {
                order_id,
                attempts,
                duplicate,
                ..
            } => event_at!(level, order_id, attempts, duplicate, "Order persisted"),
            DomainEvent::OrderDeadLettered {
                order_id,
                attempts,
                reason,
                ..
            } => event_at!(level, order_id, attempts, reason = %reason, "Order dead-lettered"),
            DomainEvent::CacheRebuilt { key, duration_ms, .. } => {
                event_at!(level, key = %key, duration_ms, "Cache entry rebuilt")
            }
            DomainEvent::CacheRebuildFailed { key, reason, .. } => {
                event_at!(level, key = %key, reason = %reason, "Cache rebuild failed")
            }
        }
        Ok(())
    }

    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

/// Keeps every event for inspection by tests and the simulator.
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: parking_lot::RwLock<Vec<DomainEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Events whose [`DomainEvent::event_type`] is `event_type`.
    pub fn events_of_type(&self, event_type: &str) -> Vec<DomainEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    /// Lifecycle of one order, in publication order.
    pub fn for_order(&self, order_id: i64) -> Vec<DomainEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.order_id() == Some(order_id))
            .cloned()
            .collect()
    }

    /// Event count per type, for run summaries.
    pub fn count_by_type(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for event in self.events.read().iter() {
            *counts.entry(event.event_type()).or_insert(0) += 1;
        }
        counts
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventCollector {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        self.events.write().push(event);
        Ok(())
    }

    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()> {
        self.events.write().extend(events);
        Ok(())
    }
}

/// Fans events out to several publishers.
///
/// Every publisher sees every event even when an earlier one fails; the
/// first failure is returned afterwards.
#[derive(Default)]
pub struct CompositeEventPublisher {
    publishers: Vec<Arc<dyn EventPublisher>>,
}

impl CompositeEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_publisher<P: EventPublisher + 'static>(mut self, publisher: P) -> Self {
        self.publishers.push(Arc::new(publisher));
        self
    }

    /// Add a publisher that is also held elsewhere.
    pub fn with_shared(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publishers.push(publisher);
        self
    }
}

impl std::fmt::Debug for CompositeEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeEventPublisher")
            .field("publishers", &self.publishers.len())
            .finish()
    }
}

#[async_trait]
impl EventPublisher for CompositeEventPublisher {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        let mut first_error = None;
        for publisher in &self.publishers {
            if let Err(e) = publisher.publish(event.clone()).await {
                warn!(event_type = event.event_type(), error = %e, "Event sink failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()> {
        let mut first_error = None;
        for publisher in &self.publishers {
            if let Err(e) = publisher.publish_all(events.clone()).await {
                warn!(events = events.len(), error = %e, "Event sink failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
