//! Asynchronous order persistence.
//!
//! Admitted tickets are written to the durable store by a bounded pool.
//! Each write holds the per-user lock `lock:order:{user}` and relies on the
//! store's idempotent insert, so retries and duplicate deliveries are
//! harmless. Waiting for a busy per-user lock has its own budget and does
//! not spend insert attempts. A ticket whose insert keeps failing is
//! dead-lettered; the backend reservation is never rolled back.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::metrics::AdmissionMetrics;
use crate::domain::events::DomainEvent;
use crate::domain::model::OrderTicket;
use crate::domain::ports::{DeadLetter, DeadLetterSink, EventPublisher, InsertOutcome, OrderStore};
use crate::error::{Error, Result};
use crate::lock::{DistributedLock, LeaseGuard};
use crate::worker::{WorkerPool, WorkerPoolConfig, WorkerPoolStats};

/// Persistence worker configuration
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Consumer pool sizing
    pub pool: WorkerPoolConfig,
    /// Insert attempts before dead-lettering
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_backoff: Duration,
    /// Upper bound for the doubling delay
    pub max_backoff: Duration,
    /// Lease TTL of the per-user lock
    pub user_lock_ttl: Duration,
    /// How long to wait for another holder of the per-user lock
    pub user_lock_wait: Duration,
    /// Poll interval while the per-user lock is busy
    pub user_lock_retry_interval: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            pool: WorkerPoolConfig::named("order-persistence"),
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            user_lock_ttl: Duration::from_secs(5),
            user_lock_wait: Duration::from_secs(10),
            user_lock_retry_interval: Duration::from_millis(20),
        }
    }
}

impl PersistenceConfig {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".to_string()));
        }
        if self.user_lock_retry_interval.is_zero() {
            return Err(Error::Config(
                "user_lock_retry_interval must be non-zero".to_string(),
            ));
        }
        // A stale lease always expires within the wait budget
        if self.user_lock_wait < self.user_lock_ttl {
            return Err(Error::Config(
                "user_lock_wait must cover user_lock_ttl".to_string(),
            ));
        }
        Ok(())
    }
}

/// Shared state every persistence job needs.
#[derive(Clone)]
struct Persister {
    store: Arc<dyn OrderStore>,
    lock: Arc<DistributedLock>,
    dead_letters: Arc<dyn DeadLetterSink>,
    publisher: Option<Arc<dyn EventPublisher>>,
    metrics: Arc<AdmissionMetrics>,
    config: PersistenceConfig,
}

impl Persister {
    #[instrument(skip(self, ticket), fields(order_id = %ticket.order_id, user_id = %ticket.user_id))]
    async fn persist(&self, ticket: OrderTicket) -> Result<InsertOutcome> {
        let mut last_error = String::new();

        for attempt in 1..=self.config.max_attempts {
            match self.attempt(&ticket).await {
                Ok(outcome) => {
                    let duplicate = outcome == InsertOutcome::AlreadyExists;
                    self.metrics.record_persisted(duplicate);
                    info!(attempt, duplicate, "Order persisted");
                    self.publish(DomainEvent::order_persisted(&ticket, attempt, duplicate))
                        .await;
                    return Ok(outcome);
                }
                Err(e) => {
                    last_error = format!("{:#}", e);
                    if attempt < self.config.max_attempts {
                        let delay = self.config.backoff_after(attempt);
                        self.metrics.record_persistence_retry();
                        warn!(attempt, delay_ms = delay.as_millis() as u64, error = %last_error, "Persist failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        let attempts = self.config.max_attempts;
        self.dead_letter(&ticket, attempts, &last_error).await?;
        Err(Error::PersistenceFailure {
            order_id: ticket.order_id.as_i64(),
            attempts,
            reason: last_error,
        })
    }

    /// One insert under the per-user lock.
    async fn attempt(&self, ticket: &OrderTicket) -> anyhow::Result<InsertOutcome> {
        let resource = format!("order:{}", ticket.user_id);
        let guard = self.acquire_user_lock(&resource).await?;

        let inserted = self.store.insert(ticket).await.context("inserting order");
        if let Err(e) = guard.release().await {
            warn!(resource = %resource, error = %e, "Failed to release per-user lock");
        }
        inserted
    }

    /// Wait out other holders of the per-user lock.
    ///
    /// Only a lock still busy after `user_lock_wait` fails the attempt.
    async fn acquire_user_lock(&self, resource: &str) -> anyhow::Result<LeaseGuard> {
        let deadline = Instant::now() + self.config.user_lock_wait;
        let mut polls = 0u32;
        loop {
            if let Some(guard) = self
                .lock
                .try_acquire_guard(resource, self.config.user_lock_ttl)
                .await
                .context("acquiring per-user lock")?
            {
                if polls > 0 {
                    debug!(resource, polls, "Per-user lock acquired after waiting");
                }
                return Ok(guard);
            }
            if Instant::now() >= deadline {
                anyhow::bail!(
                    "per-user lock {} busy for {:?}",
                    resource,
                    self.config.user_lock_wait
                );
            }
            polls += 1;
            tokio::time::sleep(self.config.user_lock_retry_interval).await;
        }
    }

    async fn dead_letter(&self, ticket: &OrderTicket, attempts: u32, reason: &str) -> Result<()> {
        self.metrics.record_dead_lettered();
        error!(order_id = %ticket.order_id, attempts, reason, "Dead-lettering order ticket");
        self.dead_letters
            .dead_letter(DeadLetter {
                ticket: ticket.clone(),
                attempts,
                last_error: reason.to_string(),
                failed_at: Utc::now(),
            })
            .await?;
        self.publish(DomainEvent::order_dead_lettered(ticket, attempts, reason))
            .await;
        Ok(())
    }

    async fn publish(&self, event: DomainEvent) {
        if let Some(publisher) = &self.publisher {
            if let Err(e) = publisher.publish(event).await {
                warn!(error = %e, "Failed to publish order event");
            }
        }
    }
}

/// Background consumer of admitted order tickets.
pub struct OrderPersistenceWorker {
    persister: Persister,
    pool: WorkerPool,
}

impl std::fmt::Debug for OrderPersistenceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderPersistenceWorker")
            .field("config", &self.persister.config)
            .field("pool", &self.pool)
            .finish()
    }
}

impl OrderPersistenceWorker {
    /// Start the consumer pool on the current runtime.
    pub fn new(
        store: Arc<dyn OrderStore>,
        lock: Arc<DistributedLock>,
        dead_letters: Arc<dyn DeadLetterSink>,
        config: PersistenceConfig,
    ) -> Result<Self> {
        config.validate()?;
        let pool = WorkerPool::new(config.pool.clone())?;
        Ok(Self {
            persister: Persister {
                store,
                lock,
                dead_letters,
                publisher: None,
                metrics: Arc::new(AdmissionMetrics::new()),
                config,
            },
            pool,
        })
    }

    /// Publish persistence events to `publisher`.
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.persister.publisher = Some(publisher);
        self
    }

    /// Counters shared with the admission controller.
    pub fn metrics(&self) -> Arc<AdmissionMetrics> {
        Arc::clone(&self.persister.metrics)
    }

    pub fn pool_stats(&self) -> WorkerPoolStats {
        self.pool.stats()
    }

    /// Queue a ticket, waiting for room when the queue is full.
    ///
    /// If the worker is shut down the ticket goes straight to the
    /// dead-letter sink; only a failing sink is reported as an error.
    pub async fn enqueue(&self, ticket: OrderTicket) -> Result<()> {
        let persister = self.persister.clone();
        let job_ticket = ticket.clone();
        let submitted = self
            .pool
            .submit(async move {
                // Failures are already dead-lettered and logged
                let _ = persister.persist(job_ticket).await;
            })
            .await;

        match submitted {
            Ok(()) => {
                debug!(order_id = %ticket.order_id, "Ticket queued for persistence");
                Ok(())
            }
            Err(e) => {
                self.persister
                    .dead_letter(&ticket, 0, &format!("not queued: {}", e))
                    .await
            }
        }
    }

    /// Persist a ticket on the caller's task, with the same retry policy.
    pub async fn persist(&self, ticket: OrderTicket) -> Result<InsertOutcome> {
        self.persister.persist(ticket).await
    }

    /// Stop intake and wait until every queued ticket is handled.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{
        InMemoryDeadLetterQueue, InMemoryEventCollector, InMemoryKvBackend, InMemoryOrderStore,
    };
    use crate::domain::model::{OrderId, UserId, VoucherId};
    use crate::domain::ports::KeyValueBackend;
    use assert_matches::assert_matches;
    use bytes::Bytes;

    struct Fixture {
        backend: Arc<InMemoryKvBackend>,
        store: Arc<InMemoryOrderStore>,
        dead_letters: Arc<InMemoryDeadLetterQueue>,
        events: Arc<InMemoryEventCollector>,
        worker: OrderPersistenceWorker,
    }

    fn fast_config() -> PersistenceConfig {
        PersistenceConfig {
            pool: WorkerPoolConfig {
                name: "test-persist".to_string(),
                workers: 2,
                queue_capacity: 32,
            },
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            user_lock_ttl: Duration::from_secs(5),
            user_lock_wait: Duration::from_secs(5),
            user_lock_retry_interval: Duration::from_millis(5),
        }
    }

    fn fixture(config: PersistenceConfig) -> Fixture {
        fixture_with_delay(config, Arc::new(InMemoryOrderStore::new()), Duration::ZERO)
    }

    /// Store whose inserts take `delay` before reaching `inner`.
    struct SlowOrderStore {
        inner: Arc<InMemoryOrderStore>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl OrderStore for SlowOrderStore {
        async fn insert(&self, ticket: &OrderTicket) -> anyhow::Result<InsertOutcome> {
            tokio::time::sleep(self.delay).await;
            self.inner.insert(ticket).await
        }

        async fn find(&self, order_id: OrderId) -> anyhow::Result<Option<OrderTicket>> {
            self.inner.find(order_id).await
        }
    }

    fn fixture_with_delay(
        config: PersistenceConfig,
        store: Arc<InMemoryOrderStore>,
        delay: Duration,
    ) -> Fixture {
        let backend = Arc::new(InMemoryKvBackend::new());
        let slow = Arc::new(SlowOrderStore {
            inner: store.clone(),
            delay,
        });
        let dead_letters = Arc::new(InMemoryDeadLetterQueue::new());
        let events = Arc::new(InMemoryEventCollector::new());
        let lock = Arc::new(DistributedLock::new(backend.clone()));
        let worker = OrderPersistenceWorker::new(slow, lock, dead_letters.clone(), config)
            .unwrap()
            .with_publisher(events.clone());
        Fixture {
            backend,
            store,
            dead_letters,
            events,
            worker,
        }
    }

    fn ticket(order_id: i64, user_id: u64) -> OrderTicket {
        OrderTicket::new(OrderId(order_id), UserId(user_id), VoucherId(1))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = PersistenceConfig::default();
        assert_eq!(config.backoff_after(1), Duration::from_millis(100));
        assert_eq!(config.backoff_after(2), Duration::from_millis(200));
        assert_eq!(config.backoff_after(4), Duration::from_millis(800));
        assert_eq!(config.backoff_after(10), Duration::from_secs(5));
        assert_eq!(config.backoff_after(64), Duration::from_secs(5));
    }

    #[test]
    fn test_config_validation() {
        let config = PersistenceConfig {
            max_attempts: 0,
            ..PersistenceConfig::default()
        };
        assert_matches!(config.validate(), Err(Error::Config(_)));

        let config = PersistenceConfig {
            user_lock_wait: Duration::from_secs(1),
            ..PersistenceConfig::default()
        };
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[tokio::test]
    async fn test_enqueue_persists() {
        let fx = fixture(fast_config());
        fx.worker.enqueue(ticket(1, 10)).await.unwrap();
        fx.worker.enqueue(ticket(2, 11)).await.unwrap();
        fx.worker.shutdown().await;

        assert_eq!(fx.store.len(), 2);
        assert_eq!(fx.worker.metrics().snapshot().persisted, 2);
        assert_eq!(fx.events.events_of_type("OrderPersisted").len(), 2);
        // Per-user locks released
        assert!(fx.backend.get("lock:order:10").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let fx = fixture(fast_config());
        fx.store.fail_next(2);

        let outcome = fx.worker.persist(ticket(1, 10)).await.unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted);
        assert_eq!(fx.store.insert_calls(), 3);
        assert_eq!(fx.worker.metrics().snapshot().persistence_retries, 2);
        assert!(fx.dead_letters.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_noop() {
        let fx = fixture(fast_config());
        fx.worker.persist(ticket(1, 10)).await.unwrap();
        let outcome = fx.worker.persist(ticket(1, 10)).await.unwrap();

        assert_eq!(outcome, InsertOutcome::AlreadyExists);
        assert_eq!(fx.store.len(), 1);
        assert_eq!(fx.worker.metrics().snapshot().persisted_duplicates, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter() {
        let fx = fixture(fast_config());
        fx.store.fail_always(true);

        let result = fx.worker.persist(ticket(7, 10)).await;
        assert_matches!(
            result,
            Err(Error::PersistenceFailure { order_id: 7, attempts: 3, .. })
        );

        let letters = fx.dead_letters.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].ticket.order_id, OrderId(7));
        assert!(letters[0].last_error.contains("order store unavailable"));
        assert_eq!(fx.events.for_order(7).len(), 1);
        assert_eq!(fx.worker.metrics().snapshot().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_busy_user_lock_waits_without_spending_attempts() {
        let fx = fixture(fast_config());
        fx.backend
            .set_nx("lock:order:10", Bytes::from("other"), Duration::from_secs(60))
            .await
            .unwrap();

        let backend = fx.backend.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            backend.del("lock:order:10").await.unwrap();
        });

        let outcome = fx.worker.persist(ticket(1, 10)).await.unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted);
        assert_eq!(fx.store.insert_calls(), 1);
        assert_eq!(fx.worker.metrics().snapshot().persistence_retries, 0);
        assert!(fx.dead_letters.is_empty());
    }

    #[tokio::test]
    async fn test_user_lock_wait_budget_exhausted() {
        let fx = fixture(PersistenceConfig {
            max_attempts: 2,
            user_lock_ttl: Duration::from_millis(20),
            user_lock_wait: Duration::from_millis(20),
            ..fast_config()
        });
        // A holder that never lets go
        fx.backend
            .set_nx("lock:order:10", Bytes::from("other"), Duration::from_secs(60))
            .await
            .unwrap();

        let result = fx.worker.persist(ticket(1, 10)).await;
        assert_matches!(result, Err(Error::PersistenceFailure { attempts: 2, .. }));
        assert_eq!(fx.store.insert_calls(), 0);
        assert!(fx.dead_letters.letters()[0].last_error.contains("busy"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_user_tickets_on_slow_store_all_persist() {
        let store = Arc::new(InMemoryOrderStore::new());
        // Each insert outlasts the whole insert backoff schedule
        let fx = fixture_with_delay(
            PersistenceConfig {
                user_lock_ttl: Duration::from_secs(2),
                user_lock_wait: Duration::from_secs(5),
                ..fast_config()
            },
            store.clone(),
            Duration::from_millis(300),
        );

        let first = OrderTicket::new(OrderId(1), UserId(7), VoucherId(1));
        let second = OrderTicket::new(OrderId(2), UserId(7), VoucherId(2));
        fx.worker.enqueue(first).await.unwrap();
        fx.worker.enqueue(second).await.unwrap();
        fx.worker.shutdown().await;

        assert_eq!(store.len(), 2);
        assert!(fx.dead_letters.is_empty());
        assert_eq!(fx.worker.metrics().snapshot().persisted, 2);
        assert_eq!(fx.worker.metrics().snapshot().persistence_retries, 0);
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_dead_letters() {
        let fx = fixture(fast_config());
        fx.worker.shutdown().await;

        fx.worker.enqueue(ticket(3, 10)).await.unwrap();
        assert_eq!(fx.dead_letters.len(), 1);
        assert_eq!(fx.dead_letters.letters()[0].attempts, 0);
        assert!(fx.store.is_empty());
    }
}
