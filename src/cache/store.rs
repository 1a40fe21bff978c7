//! Cache-aside store.

use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use super::envelope::{decode_value, encode_value, is_empty_sentinel, LogicalEnvelope, EMPTY_SENTINEL};
use super::metrics::CacheMetrics;
use crate::domain::events::DomainEvent;
use crate::domain::ports::{EventPublisher, KeyValueBackend, SourceLoader};
use crate::error::{Error, Result};
use crate::lock::{DistributedLock, LeaseGuard};
use crate::worker::{WorkerPool, WorkerPoolConfig};

/// Cache store configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL of negative-cache entries
    pub null_ttl: Duration,
    /// TTL used by callers that have no better value
    pub default_ttl: Duration,
    /// Lease TTL of the per-key rebuild lock
    pub lock_ttl: Duration,
    /// Sleep between mutex-mode retries
    pub lock_retry_interval: Duration,
    /// Mutex-mode retries before `LockTimeout`
    pub lock_max_attempts: u32,
    /// Background rebuild pool sizing
    pub rebuild_pool: WorkerPoolConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            null_ttl: Duration::from_secs(2 * 60),
            default_ttl: Duration::from_secs(30 * 60),
            lock_ttl: Duration::from_secs(10),
            lock_retry_interval: Duration::from_millis(50),
            lock_max_attempts: 100,
            rebuild_pool: WorkerPoolConfig::named("cache-rebuild"),
        }
    }
}

/// What a single cache read found.
enum Lookup<T> {
    Hit(T),
    /// Negative-cache marker
    NotFound,
    Miss,
}

/// Cache-aside engine over a [`KeyValueBackend`].
pub struct CacheStore {
    backend: Arc<dyn KeyValueBackend>,
    lock: Arc<DistributedLock>,
    rebuild_pool: Arc<WorkerPool>,
    publisher: Option<Arc<dyn EventPublisher>>,
    metrics: Arc<CacheMetrics>,
    config: CacheConfig,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("config", &self.config)
            .field("metrics", &self.metrics.snapshot())
            .finish()
    }
}

impl CacheStore {
    /// Create a store and start its rebuild pool on the current runtime.
    pub fn new(
        backend: Arc<dyn KeyValueBackend>,
        lock: Arc<DistributedLock>,
        config: CacheConfig,
    ) -> Result<Self> {
        let rebuild_pool = Arc::new(WorkerPool::new(config.rebuild_pool.clone())?);
        Ok(Self {
            backend,
            lock,
            rebuild_pool,
            publisher: None,
            metrics: Arc::new(CacheMetrics::new()),
            config,
        })
    }

    /// Publish rebuild events to `publisher`.
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Stop accepting rebuilds and wait for in-flight ones.
    pub async fn shutdown(&self) {
        self.rebuild_pool.shutdown().await;
    }

    // =========================================================================
    // Passthrough
    // =========================================================================

    /// Read `key_prefix + id`, falling back to `loader` on a miss.
    ///
    /// Missing records are cached as the empty sentinel for `null_ttl`, so
    /// repeated lookups of ids that do not exist stay off the source.
    #[instrument(skip(self, id, loader), fields(id = %id))]
    pub async fn get_or_load<Id, T, L>(
        &self,
        key_prefix: &str,
        id: Id,
        loader: &L,
        ttl: Duration,
    ) -> Result<Option<T>>
    where
        Id: Display + Send + Sync,
        T: Serialize + DeserializeOwned + Send,
        L: SourceLoader<Id, T> + ?Sized,
    {
        let key = cache_key(key_prefix, &id);
        match self.lookup(&key).await? {
            Lookup::Hit(value) => Ok(Some(value)),
            Lookup::NotFound => Ok(None),
            Lookup::Miss => self.load_and_fill(&key, &id, loader, ttl).await,
        }
    }

    /// Passthrough read where only one caller per key reaches the source.
    ///
    /// Losers of the `lock:{key}` race sleep and retry the whole read.
    /// Gives up with [`Error::LockTimeout`] after `lock_max_attempts`.
    #[instrument(skip(self, id, loader), fields(id = %id))]
    pub async fn get_or_load_with_mutex<Id, T, L>(
        &self,
        key_prefix: &str,
        id: Id,
        loader: &L,
        ttl: Duration,
    ) -> Result<Option<T>>
    where
        Id: Display + Send + Sync,
        T: Serialize + DeserializeOwned + Send,
        L: SourceLoader<Id, T> + ?Sized,
    {
        let key = cache_key(key_prefix, &id);

        for attempt in 1..=self.config.lock_max_attempts {
            match self.lookup(&key).await? {
                Lookup::Hit(value) => return Ok(Some(value)),
                Lookup::NotFound => return Ok(None),
                Lookup::Miss => {}
            }

            let Some(guard) = self
                .lock
                .try_acquire_guard(&key, self.config.lock_ttl)
                .await?
            else {
                self.metrics.record_lock_wait();
                debug!(key = %key, attempt, "Rebuild lock busy, retrying");
                tokio::time::sleep(self.config.lock_retry_interval).await;
                continue;
            };

            // The previous holder may have filled the key while we waited
            let result = match self.peek(&key).await {
                Ok(Lookup::Hit(value)) => Ok(Some(value)),
                Ok(Lookup::NotFound) => Ok(None),
                Ok(Lookup::Miss) => self.load_and_fill(&key, &id, loader, ttl).await,
                Err(e) => Err(e),
            };
            let released = guard.release().await;
            let value = result?;
            released?;
            return Ok(value);
        }

        self.metrics.record_lock_timeout();
        warn!(key = %key, attempts = self.config.lock_max_attempts, "Gave up waiting for rebuild lock");
        Err(Error::LockTimeout {
            key: self.lock.lock_key(&key),
            attempts: self.config.lock_max_attempts,
        })
    }

    // =========================================================================
    // Logical expiration
    // =========================================================================

    /// Read a logically-expiring key. Never blocks on the source.
    ///
    /// A stale value is returned as-is; the caller that wins `lock:{key}`
    /// also schedules one background rebuild. A key that was never warmed
    /// reads as `None`.
    #[instrument(skip(self, id, loader), fields(id = %id))]
    pub async fn get_with_logical_expire<Id, T, L>(
        &self,
        key_prefix: &str,
        id: Id,
        loader: L,
        ttl: Duration,
    ) -> Result<Option<T>>
    where
        Id: Display + Send + Sync + 'static,
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        L: SourceLoader<Id, T> + 'static,
    {
        let key = cache_key(key_prefix, &id);

        let payload = match self.backend.get(&key).await? {
            Some(payload) if !is_empty_sentinel(&payload) => payload,
            _ => {
                self.metrics.record_miss();
                debug!(key = %key, "Logical key not warmed");
                return Ok(None);
            }
        };

        let envelope = LogicalEnvelope::<T>::decode(&payload)?;
        if envelope.is_fresh_at(Utc::now()) {
            self.metrics.record_hit();
            return Ok(Some(envelope.data));
        }

        self.metrics.record_stale_hit();
        let Some(guard) = self
            .lock
            .try_acquire_guard(&key, self.config.lock_ttl)
            .await?
        else {
            debug!(key = %key, "Rebuild already in flight");
            return Ok(Some(envelope.data));
        };

        // Someone may have rebuilt between our read and our lock
        if let Some(payload) = self.backend.get(&key).await? {
            if !is_empty_sentinel(&payload) {
                let current = LogicalEnvelope::<T>::decode(&payload)?;
                if current.is_fresh_at(Utc::now()) {
                    guard.release().await?;
                    return Ok(Some(current.data));
                }
            }
        }

        self.schedule_rebuild::<Id, T, L>(key, id, loader, ttl, guard);
        Ok(Some(envelope.data))
    }

    fn schedule_rebuild<Id, T, L>(
        &self,
        key: String,
        id: Id,
        loader: L,
        ttl: Duration,
        guard: LeaseGuard,
    ) where
        Id: Display + Send + Sync + 'static,
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        L: SourceLoader<Id, T> + 'static,
    {
        let task = RebuildTask {
            backend: Arc::clone(&self.backend),
            metrics: Arc::clone(&self.metrics),
            publisher: self.publisher.clone(),
            key: key.clone(),
            ttl,
        };

        let job = async move {
            task.run::<Id, T, L>(&id, &loader).await;
            if let Err(e) = guard.release().await {
                warn!(key = %task.key, error = %e, "Failed to release rebuild lock");
            }
        };

        // A refused job is dropped together with its guard, which releases the lock
        match self.rebuild_pool.try_submit(job) {
            Ok(()) => {
                self.metrics.record_rebuild_scheduled();
                debug!(key = %key, "Rebuild scheduled");
            }
            Err(e) => {
                self.metrics.record_rebuild_rejected();
                warn!(key = %key, error = %e, "Rebuild not scheduled; serving stale value");
            }
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write a value with a physical TTL.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        self.backend.set(key, encode_value(value)?, Some(ttl)).await
    }

    /// Write a logically-expiring value. The key itself never expires.
    pub async fn set_with_logical_expire<T: Serialize>(
        &self,
        key: &str,
        value: T,
        ttl: Duration,
    ) -> Result<()> {
        let payload = LogicalEnvelope::new(value, ttl)?.encode()?;
        self.backend.set(key, payload, None).await
    }

    /// Pre-warm a logical key from the source of truth.
    ///
    /// Returns false, writing nothing, when the record does not exist.
    pub async fn warm_logical<Id, T, L>(
        &self,
        key_prefix: &str,
        id: Id,
        loader: &L,
        ttl: Duration,
    ) -> Result<bool>
    where
        Id: Display + Send + Sync,
        T: Serialize + Send,
        L: SourceLoader<Id, T> + ?Sized,
    {
        let key = cache_key(key_prefix, &id);
        self.metrics.record_loader_call();
        let loaded = loader.load(&id).await.map_err(|e| {
            self.metrics.record_loader_failure();
            Error::source_unavailable(e)
        })?;

        match loaded {
            Some(value) => {
                self.set_with_logical_expire(&key, value, ttl).await?;
                info!(key = %key, ttl_secs = ttl.as_secs(), "Warmed logical key");
                Ok(true)
            }
            None => {
                warn!(key = %key, "Nothing to warm; record not found");
                Ok(false)
            }
        }
    }

    /// Drop a cached key after its record changed. Returns true if it existed.
    pub async fn invalidate(&self, key: &str) -> Result<bool> {
        let existed = self.backend.del(key).await?;
        debug!(key = %key, existed, "Invalidated");
        Ok(existed)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Result<Lookup<T>> {
        let found = self.peek(key).await?;
        match &found {
            Lookup::Hit(_) => self.metrics.record_hit(),
            Lookup::NotFound => self.metrics.record_null_hit(),
            Lookup::Miss => self.metrics.record_miss(),
        }
        Ok(found)
    }

    async fn peek<T: DeserializeOwned>(&self, key: &str) -> Result<Lookup<T>> {
        Ok(match self.backend.get(key).await? {
            Some(payload) if is_empty_sentinel(&payload) => Lookup::NotFound,
            Some(payload) => Lookup::Hit(decode_value(&payload)?),
            None => Lookup::Miss,
        })
    }

    async fn load_and_fill<Id, T, L>(
        &self,
        key: &str,
        id: &Id,
        loader: &L,
        ttl: Duration,
    ) -> Result<Option<T>>
    where
        Id: Send + Sync,
        T: Serialize + Send,
        L: SourceLoader<Id, T> + ?Sized,
    {
        self.metrics.record_loader_call();
        let loaded = loader.load(id).await.map_err(|e| {
            self.metrics.record_loader_failure();
            warn!(key = %key, error = %e, "Source of truth failed");
            Error::source_unavailable(e)
        })?;

        match loaded {
            Some(value) => {
                self.backend.set(key, encode_value(&value)?, Some(ttl)).await?;
                debug!(key = %key, "Filled from source");
                Ok(Some(value))
            }
            None => {
                self.backend
                    .set(key, Bytes::from_static(EMPTY_SENTINEL), Some(self.config.null_ttl))
                    .await?;
                debug!(key = %key, "Cached not-found");
                Ok(None)
            }
        }
    }
}

fn cache_key<Id: Display + ?Sized>(key_prefix: &str, id: &Id) -> String {
    format!("{}{}", key_prefix, id)
}

/// Everything a background rebuild needs, detached from the store.
struct RebuildTask {
    backend: Arc<dyn KeyValueBackend>,
    metrics: Arc<CacheMetrics>,
    publisher: Option<Arc<dyn EventPublisher>>,
    key: String,
    ttl: Duration,
}

impl RebuildTask {
    async fn run<Id, T, L>(&self, id: &Id, loader: &L)
    where
        Id: Send + Sync,
        T: Serialize + Send,
        L: SourceLoader<Id, T>,
    {
        let started = Instant::now();
        self.metrics.record_loader_call();

        let outcome = match loader.load(id).await {
            Ok(Some(value)) => self.write(value).await.map(|()| true),
            Ok(None) => Ok(false),
            Err(e) => {
                self.metrics.record_loader_failure();
                Err(Error::source_unavailable(e))
            }
        };

        match outcome {
            Ok(true) => {
                self.metrics.record_rebuild_completed();
                info!(key = %self.key, elapsed_ms = started.elapsed().as_millis() as u64, "Cache rebuilt");
                self.publish(DomainEvent::cache_rebuilt(&self.key, started.elapsed()))
                    .await;
            }
            Ok(false) => {
                self.metrics.record_rebuild_failed();
                warn!(key = %self.key, "Record vanished from source; keeping stale entry");
            }
            Err(e) => {
                self.metrics.record_rebuild_failed();
                error!(key = %self.key, error = %e, "Cache rebuild failed");
                self.publish(DomainEvent::cache_rebuild_failed(&self.key, e.to_string()))
                    .await;
            }
        }
    }

    async fn write<T: Serialize>(&self, value: T) -> Result<()> {
        let payload = LogicalEnvelope::new(value, self.ttl)?.encode()?;
        self.backend.set(&self.key, payload, None).await
    }

    async fn publish(&self, event: DomainEvent) {
        if let Some(publisher) = &self.publisher {
            if let Err(e) = publisher.publish(event).await {
                warn!(key = %self.key, error = %e, "Failed to publish cache event");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryEventCollector, InMemoryKvBackend};
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Shop {
        id: u64,
        name: String,
    }

    fn shop(id: u64, name: &str) -> Shop {
        Shop {
            id,
            name: name.to_string(),
        }
    }

    fn fast_config() -> CacheConfig {
        CacheConfig {
            lock_retry_interval: Duration::from_millis(10),
            lock_max_attempts: 500,
            rebuild_pool: WorkerPoolConfig {
                name: "test-rebuild".to_string(),
                workers: 2,
                queue_capacity: 16,
            },
            ..CacheConfig::default()
        }
    }

    fn setup(config: CacheConfig) -> (Arc<InMemoryKvBackend>, Arc<CacheStore>) {
        let backend = Arc::new(InMemoryKvBackend::new());
        let lock = Arc::new(DistributedLock::new(backend.clone()));
        let store = Arc::new(CacheStore::new(backend.clone(), lock, config).unwrap());
        (backend, store)
    }

    /// Loader that knows shop 1 only and counts its calls.
    fn counting_loader(
        calls: Arc<AtomicUsize>,
        delay: Duration,
    ) -> impl Fn(u64) -> futures::future::BoxFuture<'static, anyhow::Result<Option<Shop>>> + Clone
    {
        move |id: u64| {
            let calls = calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                Ok(if id == 1 { Some(shop(1, "Tea House")) } else { None })
            })
        }
    }

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.null_ttl, Duration::from_secs(120));
        assert_eq!(config.default_ttl, Duration::from_secs(1800));
        assert_eq!(config.lock_ttl, Duration::from_secs(10));
        assert_eq!(config.rebuild_pool.workers, 10);
    }

    #[tokio::test]
    async fn test_passthrough_fills_cache() {
        let (backend, store) = setup(fast_config());
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = counting_loader(calls.clone(), Duration::ZERO);

        let first: Option<Shop> = store
            .get_or_load("cache:shop:", 1u64, &loader, Duration::from_secs(60))
            .await
            .unwrap();
        let second: Option<Shop> = store
            .get_or_load("cache:shop:", 1u64, &loader, Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(first, Some(shop(1, "Tea House")));
        assert_eq!(second, first);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(backend.ttl("cache:shop:1").is_some());
        assert_eq!(store.metrics().snapshot().hits, 1);
    }

    #[tokio::test]
    async fn test_passthrough_caches_not_found() {
        let (backend, store) = setup(fast_config());
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = counting_loader(calls.clone(), Duration::ZERO);

        for _ in 0..5 {
            let missing: Option<Shop> = store
                .get_or_load("cache:shop:", 404u64, &loader, Duration::from_secs(60))
                .await
                .unwrap();
            assert!(missing.is_none());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.get("cache:shop:404").await.unwrap(), Some(Bytes::new()));
        let ttl = backend.ttl("cache:shop:404").unwrap();
        assert!(ttl <= Duration::from_secs(120));
        assert_eq!(store.metrics().snapshot().null_hits, 4);
    }

    #[tokio::test]
    async fn test_loader_failure_is_source_unavailable() {
        let (backend, store) = setup(fast_config());
        let loader = |_id: u64| async { Err::<Option<Shop>, _>(anyhow::anyhow!("db down")) };

        let result = store
            .get_or_load("cache:shop:", 1u64, &loader, Duration::from_secs(60))
            .await;
        assert!(matches!(result, Err(Error::SourceUnavailable(_))));
        // Failures are not negative-cached
        assert!(backend.get("cache:shop:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_backend_failure_propagates() {
        let (backend, store) = setup(fast_config());
        backend.set_offline(true);
        let loader = counting_loader(Arc::new(AtomicUsize::new(0)), Duration::ZERO);

        let result: Result<Option<Shop>> = store
            .get_or_load("cache:shop:", 1u64, &loader, Duration::from_secs(60))
            .await;
        assert!(matches!(result, Err(Error::Backend(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mutex_mode_single_loader_call() {
        let (backend, store) = setup(fast_config());
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = counting_loader(calls.clone(), Duration::from_millis(100));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            let loader = loader.clone();
            handles.push(tokio::spawn(async move {
                store
                    .get_or_load_with_mutex("cache:shop:", 1u64, &loader, Duration::from_secs(60))
                    .await
                    .unwrap()
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap(), Some(shop(1, "Tea House")));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Lock released
        assert!(backend.get("lock:cache:shop:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mutex_mode_releases_lock_on_loader_error() {
        let (backend, store) = setup(fast_config());
        let loader = |_id: u64| async { Err::<Option<Shop>, _>(anyhow::anyhow!("db down")) };

        let result = store
            .get_or_load_with_mutex("cache:shop:", 1u64, &loader, Duration::from_secs(60))
            .await;
        assert!(matches!(result, Err(Error::SourceUnavailable(_))));
        assert!(backend.get("lock:cache:shop:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mutex_mode_times_out() {
        let config = CacheConfig {
            lock_retry_interval: Duration::from_millis(1),
            lock_max_attempts: 3,
            ..fast_config()
        };
        let (backend, store) = setup(config);
        backend
            .set_nx("lock:cache:shop:1", Bytes::from("someone-else"), Duration::from_secs(60))
            .await
            .unwrap();
        let loader = counting_loader(Arc::new(AtomicUsize::new(0)), Duration::ZERO);

        let result: Result<Option<Shop>> = store
            .get_or_load_with_mutex("cache:shop:", 1u64, &loader, Duration::from_secs(60))
            .await;
        match result {
            Err(Error::LockTimeout { key, attempts }) => {
                assert_eq!(key, "lock:cache:shop:1");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected LockTimeout, got {:?}", other),
        }
        assert_eq!(store.metrics().snapshot().lock_waits, 3);
    }

    #[tokio::test]
    async fn test_logical_miss_is_none() {
        let (_backend, store) = setup(fast_config());
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = counting_loader(calls.clone(), Duration::ZERO);

        let result: Option<Shop> = store
            .get_with_logical_expire("cache:shop:", 1u64, loader, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_logical_fresh_hit() {
        let (_backend, store) = setup(fast_config());
        let calls = Arc::new(AtomicUsize::new(0));
        store
            .set_with_logical_expire("cache:shop:1", shop(1, "Warm"), Duration::from_secs(60))
            .await
            .unwrap();

        let result: Option<Shop> = store
            .get_with_logical_expire(
                "cache:shop:",
                1u64,
                counting_loader(calls.clone(), Duration::ZERO),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert_eq!(result, Some(shop(1, "Warm")));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_logical_stale_triggers_rebuild() {
        let (backend, store) = setup(fast_config());
        let events = Arc::new(InMemoryEventCollector::new());
        let store = Arc::new(
            Arc::try_unwrap(store)
                .unwrap()
                .with_publisher(events.clone()),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        store
            .set_with_logical_expire("cache:shop:1", shop(1, "Old"), Duration::ZERO)
            .await
            .unwrap();

        let stale: Option<Shop> = store
            .get_with_logical_expire(
                "cache:shop:",
                1u64,
                counting_loader(calls.clone(), Duration::ZERO),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert_eq!(stale, Some(shop(1, "Old")));

        store.shutdown().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(backend.get("lock:cache:shop:1").await.unwrap().is_none());
        assert!(backend.ttl("cache:shop:1").is_none());

        let payload = backend.get("cache:shop:1").await.unwrap().unwrap();
        let envelope: LogicalEnvelope<Shop> = LogicalEnvelope::decode(&payload).unwrap();
        assert_eq!(envelope.data, shop(1, "Tea House"));
        assert!(envelope.is_fresh_at(Utc::now()));
        assert_eq!(events.events_of_type("CacheRebuilt").len(), 1);
    }

    #[tokio::test]
    async fn test_logical_rebuild_failure_releases_lock() {
        let (backend, store) = setup(fast_config());
        let events = Arc::new(InMemoryEventCollector::new());
        let store = Arc::try_unwrap(store).unwrap().with_publisher(events.clone());
        store
            .set_with_logical_expire("cache:shop:1", shop(1, "Old"), Duration::ZERO)
            .await
            .unwrap();

        let loader = |_id: u64| async { Err::<Option<Shop>, _>(anyhow::anyhow!("db down")) };
        let stale: Option<Shop> = store
            .get_with_logical_expire("cache:shop:", 1u64, loader, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(stale, Some(shop(1, "Old")));

        store.shutdown().await;
        assert!(backend.get("lock:cache:shop:1").await.unwrap().is_none());
        assert_eq!(store.metrics().snapshot().rebuilds_failed, 1);
        assert_eq!(events.events_of_type("CacheRebuildFailed").len(), 1);
    }

    #[tokio::test]
    async fn test_logical_rebuild_missing_record_keeps_stale() {
        let (backend, store) = setup(fast_config());
        store
            .set_with_logical_expire("cache:shop:9", shop(9, "Gone"), Duration::ZERO)
            .await
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let _: Option<Shop> = store
            .get_with_logical_expire(
                "cache:shop:",
                9u64,
                counting_loader(calls.clone(), Duration::ZERO),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        store.shutdown().await;

        let payload = backend.get("cache:shop:9").await.unwrap().unwrap();
        let envelope: LogicalEnvelope<Shop> = LogicalEnvelope::decode(&payload).unwrap();
        assert_eq!(envelope.data, shop(9, "Gone"));
    }

    #[tokio::test]
    async fn test_warm_and_invalidate() {
        let (backend, store) = setup(fast_config());
        let loader = counting_loader(Arc::new(AtomicUsize::new(0)), Duration::ZERO);

        assert!(store
            .warm_logical("cache:shop:", 1u64, &loader, Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!store
            .warm_logical("cache:shop:", 2u64, &loader, Duration::from_secs(60))
            .await
            .unwrap());
        assert!(backend.get("cache:shop:2").await.unwrap().is_none());

        assert!(store.invalidate("cache:shop:1").await.unwrap());
        assert!(!store.invalidate("cache:shop:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_with_ttl() {
        let (backend, store) = setup(fast_config());
        store
            .set("cache:shop:5", &shop(5, "Direct"), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(backend.ttl("cache:shop:5").unwrap() <= Duration::from_secs(30));

        let loader = counting_loader(Arc::new(AtomicUsize::new(0)), Duration::ZERO);
        let cached: Option<Shop> = store
            .get_or_load("cache:shop:", 5u64, &loader, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cached, Some(shop(5, "Direct")));
    }
}
