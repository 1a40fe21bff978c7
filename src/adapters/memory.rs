//! In-Memory Key-Value Backend Adapter
//!
//! Implements the `KeyValueBackend` port inside the process. Suitable for
//! tests, simulations and single-node deployments.
//!
//! # Design
//!
//! - Keys live in a `DashMap`, so single-key operations only contend on their shard
//! - Scripts take an exclusive gate that single-key operations share, giving
//!   each script the indivisibility a scripting server provides
//! - Physical TTLs are enforced lazily on access and by an optional sweeper task

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::ports::{AtomicScript, KeyValueBackend, ScriptContext};
use crate::error::{Error, Result};

/// A stored value with its optional physical expiry.
#[derive(Debug, Clone)]
struct StoredValue {
    data: Bytes,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(data: Bytes, ttl: Option<Duration>) -> Self {
        Self {
            data,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Backend statistics
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackendStats {
    /// Live keys (expired keys not yet swept included)
    pub keys: usize,
    /// Read operations
    pub reads: u64,
    /// Write operations
    pub writes: u64,
    /// Script evaluations
    pub scripts: u64,
    /// Keys removed by expiry
    pub expired: u64,
}

/// In-memory key-value backend.
pub struct InMemoryKvBackend {
    data: DashMap<String, StoredValue>,
    /// Shared by single-key operations, exclusive for scripts
    script_gate: RwLock<()>,
    /// Simulated connectivity loss
    offline: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
    scripts: AtomicU64,
    expired: AtomicU64,
}

impl Default for InMemoryKvBackend {
    fn default() -> Self {
        Self {
            data: DashMap::new(),
            script_gate: RwLock::new(()),
            offline: AtomicBool::new(false),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            scripts: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }
}

impl InMemoryKvBackend {
    /// Create a new in-memory backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) the connection to the backend.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Remaining physical TTL of a key, if it has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.data
            .get(key)
            .and_then(|v| v.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Remove every expired key. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.data.len();
        self.data.retain(|_, v| !v.is_expired(now));
        let removed = before.saturating_sub(self.data.len());
        self.expired.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Spawn a task that purges expired keys every `interval` until cancelled.
    pub fn spawn_expiry_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let backend = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let removed = backend.purge_expired();
                        if removed > 0 {
                            debug!(removed, "Purged expired keys");
                        }
                    }
                }
            }
        })
    }

    /// Get backend statistics
    pub fn stats(&self) -> InMemoryBackendStats {
        InMemoryBackendStats {
            keys: self.data.len(),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            scripts: self.scripts.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Backend("connection refused".to_string()));
        }
        Ok(())
    }

    /// Read a live value, dropping it if it has expired.
    fn read_live(&self, key: &str, now: Instant) -> Option<Bytes> {
        let expired = match self.data.get(key) {
            Some(v) if !v.is_expired(now) => return Some(v.data.clone()),
            Some(_) => true,
            None => false,
        };
        if expired && self.data.remove_if(key, |_, v| v.is_expired(now)).is_some() {
            self.expired.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    fn incr_live(&self, key: &str, delta: i64, now: Instant) -> Result<i64> {
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                let current = if e.get().is_expired(now) {
                    e.get_mut().expires_at = None;
                    0
                } else {
                    parse_integer(&e.get().data)?
                };
                let next = current
                    .checked_add(delta)
                    .ok_or_else(|| Error::Backend("increment would overflow".to_string()))?;
                e.get_mut().data = Bytes::from(next.to_string());
                Ok(next)
            }
            Entry::Vacant(e) => {
                e.insert(StoredValue::new(Bytes::from(delta.to_string()), None));
                Ok(delta)
            }
        }
    }
}

fn parse_integer(data: &Bytes) -> Result<i64> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| Error::Backend("value is not an integer".to_string()))
}

#[async_trait]
impl KeyValueBackend for InMemoryKvBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.check_online()?;
        let _gate = self.script_gate.read();
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.read_live(key, Instant::now()))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        self.check_online()?;
        let _gate = self.script_gate.read();
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.data.insert(key.to_string(), StoredValue::new(value, ttl));
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool> {
        self.check_online()?;
        let _gate = self.script_gate.read();
        self.writes.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let written = match self.data.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                if e.get().is_expired(now) {
                    e.insert(StoredValue::new(value, Some(ttl)));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(e) => {
                e.insert(StoredValue::new(value, Some(ttl)));
                true
            }
        };
        Ok(written)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.check_online()?;
        let _gate = self.script_gate.read();
        self.writes.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        Ok(self
            .data
            .remove(key)
            .map(|(_, v)| !v.is_expired(now))
            .unwrap_or(false))
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.check_online()?;
        let _gate = self.script_gate.read();
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.incr_live(key, 1, Instant::now())
    }

    async fn eval(
        &self,
        script: &dyn AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> Result<i64> {
        self.check_online()?;
        let _gate = self.script_gate.write();
        self.scripts.fetch_add(1, Ordering::Relaxed);
        let mut ctx = MemScriptContext {
            backend: self,
            now: Instant::now(),
        };
        script.execute(&mut ctx, keys, args)
    }
}

/// Script view over the backend, valid while the exclusive gate is held.
struct MemScriptContext<'a> {
    backend: &'a InMemoryKvBackend,
    now: Instant,
}

impl ScriptContext for MemScriptContext<'_> {
    fn get(&mut self, key: &str) -> Option<Bytes> {
        self.backend.read_live(key, self.now)
    }

    fn set(&mut self, key: &str, value: Bytes) {
        self.backend
            .data
            .insert(key.to_string(), StoredValue::new(value, None));
    }

    fn del(&mut self, key: &str) -> bool {
        let now = self.now;
        self.backend
            .data
            .remove(key)
            .map(|(_, v)| !v.is_expired(now))
            .unwrap_or(false)
    }

    fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64> {
        self.backend.incr_live(key, delta, self.now)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Moves a value between two keys; used to observe script atomicity.
    struct TransferScript;

    impl AtomicScript for TransferScript {
        fn name(&self) -> &'static str {
            "transfer"
        }

        fn lua(&self) -> &'static str {
            "redis.call('decrby', KEYS[1], ARGV[1]) return redis.call('incrby', KEYS[2], ARGV[1])"
        }

        fn execute(
            &self,
            ctx: &mut dyn ScriptContext,
            keys: &[String],
            args: &[String],
        ) -> Result<i64> {
            let amount: i64 = args[0].parse().unwrap();
            ctx.incr_by(&keys[0], -amount)?;
            ctx.incr_by(&keys[1], amount)
        }
    }

    #[tokio::test]
    async fn test_get_set_del() {
        let backend = InMemoryKvBackend::new();

        assert!(backend.get("k").await.unwrap().is_none());
        backend.set("k", Bytes::from("v"), None).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some(Bytes::from("v")));

        assert!(backend.del("k").await.unwrap());
        assert!(!backend.del("k").await.unwrap());
        assert!(backend.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_value_is_present() {
        let backend = InMemoryKvBackend::new();
        backend.set("k", Bytes::new(), None).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some(Bytes::new()));
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let backend = InMemoryKvBackend::new();
        backend
            .set("k", Bytes::from("v"), Some(Duration::from_millis(30)))
            .await
            .unwrap();
        assert!(backend.ttl("k").is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(backend.get("k").await.unwrap().is_none());
        assert_eq!(backend.stats().expired, 1);
    }

    #[tokio::test]
    async fn test_set_nx() {
        let backend = InMemoryKvBackend::new();

        assert!(backend
            .set_nx("lock", Bytes::from("a"), Duration::from_secs(10))
            .await
            .unwrap());
        assert!(!backend
            .set_nx("lock", Bytes::from("b"), Duration::from_secs(10))
            .await
            .unwrap());
        assert_eq!(backend.get("lock").await.unwrap(), Some(Bytes::from("a")));
    }

    #[tokio::test]
    async fn test_set_nx_after_expiry() {
        let backend = InMemoryKvBackend::new();
        backend
            .set_nx("lock", Bytes::from("a"), Duration::from_millis(20))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(backend
            .set_nx("lock", Bytes::from("b"), Duration::from_secs(10))
            .await
            .unwrap());
        assert_eq!(backend.get("lock").await.unwrap(), Some(Bytes::from("b")));
    }

    #[tokio::test]
    async fn test_incr() {
        let backend = InMemoryKvBackend::new();
        assert_eq!(backend.incr("n").await.unwrap(), 1);
        assert_eq!(backend.incr("n").await.unwrap(), 2);

        backend.set("s", Bytes::from("abc"), None).await.unwrap();
        assert!(matches!(backend.incr("s").await, Err(Error::Backend(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_incr_unique() {
        let backend = Arc::new(InMemoryKvBackend::new());
        let mut handles = Vec::new();
        for _ in 0..200 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move { backend.incr("n").await.unwrap() }));
        }

        let mut values = Vec::new();
        for h in handles {
            values.push(h.await.unwrap());
        }
        values.sort();
        values.dedup();
        assert_eq!(values.len(), 200);
        assert_eq!(values[199], 200);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_script_atomicity() {
        let backend = Arc::new(InMemoryKvBackend::new());
        backend.set("a", Bytes::from("1000"), None).await.unwrap();
        backend.set("b", Bytes::from("0"), None).await.unwrap();

        let keys = vec!["a".to_string(), "b".to_string()];
        let mut handles = Vec::new();
        for _ in 0..100 {
            let backend = backend.clone();
            let keys = keys.clone();
            handles.push(tokio::spawn(async move {
                backend
                    .eval(&TransferScript, &keys, &["5".to_string()])
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(backend.get("a").await.unwrap(), Some(Bytes::from("500")));
        assert_eq!(backend.get("b").await.unwrap(), Some(Bytes::from("500")));
        assert_eq!(backend.stats().scripts, 100);
    }

    #[tokio::test]
    async fn test_offline_errors() {
        let backend = InMemoryKvBackend::new();
        backend.set_offline(true);

        assert!(matches!(backend.get("k").await, Err(Error::Backend(_))));
        assert!(matches!(backend.incr("k").await, Err(Error::Backend(_))));

        backend.set_offline(false);
        assert!(backend.get("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_expiry_sweeper() {
        let backend = Arc::new(InMemoryKvBackend::new());
        backend
            .set("k", Bytes::from("v"), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        backend.set("keep", Bytes::from("v"), None).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = backend.spawn_expiry_sweeper(Duration::from_millis(20), cancel.clone());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(backend.stats().keys, 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
