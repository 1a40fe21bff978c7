//! Lease-based distributed lock
//!
//! `try_acquire` is a single SET-if-absent with expiry; `release` is a
//! compare-and-delete script so a holder whose lease already expired can
//! never delete the lease of whoever took over.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::ports::{AtomicScript, KeyValueBackend, ScriptContext};
use crate::error::Result;

/// Lock configuration
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Prefix prepended to every resource key
    pub key_prefix: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            key_prefix: super::LOCK_KEY_PREFIX.to_string(),
        }
    }
}

/// Ownership record for one successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    resource_key: String,
    lock_key: String,
    holder_token: String,
    ttl: Duration,
    acquired_at: Instant,
}

impl LockLease {
    /// Resource the lease protects (without the lock prefix).
    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }

    /// Backend key holding the lease.
    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    /// Token unique to this acquisition.
    pub fn holder_token(&self) -> &str {
        &self.holder_token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// True once the lease has outlived its TTL and may have been taken over.
    pub fn is_expired(&self) -> bool {
        self.acquired_at.elapsed() >= self.ttl
    }
}

/// Compare-and-delete: removes KEYS[1] only if it still holds ARGV[1].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReleaseScript;

impl AtomicScript for ReleaseScript {
    fn name(&self) -> &'static str {
        "lock_release"
    }

    fn lua(&self) -> &'static str {
        r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
end
return 0
"#
    }

    fn execute(&self, ctx: &mut dyn ScriptContext, keys: &[String], args: &[String]) -> Result<i64> {
        let (key, token) = match (keys.first(), args.first()) {
            (Some(key), Some(token)) => (key, token),
            _ => {
                return Err(crate::Error::Script {
                    script: self.name().to_string(),
                    reason: "expected one key and one argument".to_string(),
                })
            }
        };

        match ctx.get(key) {
            Some(current) if current.as_ref() == token.as_bytes() => Ok(ctx.del(key) as i64),
            _ => Ok(0),
        }
    }
}

/// Cross-process mutual exclusion over a shared key-value backend.
///
/// No lease renewal: callers whose critical section may outlive the TTL must
/// pick a larger TTL.
pub struct DistributedLock {
    backend: Arc<dyn KeyValueBackend>,
    config: LockConfig,
    /// Random per-process id
    instance_id: String,
    /// Makes tokens unique per acquisition within the process
    sequence: AtomicU64,
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("key_prefix", &self.config.key_prefix)
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

impl DistributedLock {
    /// Create a lock with the default `lock:` prefix
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self::with_config(backend, LockConfig::default())
    }

    pub fn with_config(backend: Arc<dyn KeyValueBackend>, config: LockConfig) -> Self {
        Self {
            backend,
            config,
            instance_id: uuid::Uuid::new_v4().simple().to_string(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Backend key for a resource.
    pub fn lock_key(&self, resource_key: &str) -> String {
        format!("{}{}", self.config.key_prefix, resource_key)
    }

    fn next_token(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.instance_id, seq)
    }

    /// Try once to take the lease on `resource_key` for `ttl`.
    ///
    /// Returns `None` if another holder has it. Backend errors propagate.
    pub async fn try_acquire(&self, resource_key: &str, ttl: Duration) -> Result<Option<LockLease>> {
        let lock_key = self.lock_key(resource_key);
        let token = self.next_token();

        let acquired = self
            .backend
            .set_nx(&lock_key, Bytes::from(token.clone()), ttl)
            .await?;
        if !acquired {
            debug!(lock_key = %lock_key, "Lock held elsewhere");
            return Ok(None);
        }

        debug!(lock_key = %lock_key, token = %token, "Lock acquired");
        Ok(Some(LockLease {
            resource_key: resource_key.to_string(),
            lock_key,
            holder_token: token,
            ttl,
            acquired_at: Instant::now(),
        }))
    }

    /// Like [`try_acquire`](Self::try_acquire) but returns a guard that
    /// releases on every exit path.
    pub async fn try_acquire_guard(
        self: &Arc<Self>,
        resource_key: &str,
        ttl: Duration,
    ) -> Result<Option<LeaseGuard>> {
        Ok(self
            .try_acquire(resource_key, ttl)
            .await?
            .map(|lease| LeaseGuard::new(Arc::clone(self), lease)))
    }

    /// Release a lease if it is still ours.
    ///
    /// Returns false, without touching the backend key, when the lease
    /// expired and someone else now holds it.
    pub async fn release(&self, lease: &LockLease) -> Result<bool> {
        let removed = self
            .backend
            .eval(
                &ReleaseScript,
                &[lease.lock_key.clone()],
                &[lease.holder_token.clone()],
            )
            .await?;

        if removed == 1 {
            debug!(lock_key = %lease.lock_key, "Lock released");
            Ok(true)
        } else {
            warn!(
                lock_key = %lease.lock_key,
                ttl_ms = lease.ttl.as_millis() as u64,
                "Lease no longer ours at release; leaving current holder in place"
            );
            Ok(false)
        }
    }

    /// Check whether the backend still records this lease's token.
    pub async fn is_held(&self, lease: &LockLease) -> Result<bool> {
        let current = self.backend.get(&lease.lock_key).await?;
        Ok(current
            .map(|v| v.as_ref() == lease.holder_token.as_bytes())
            .unwrap_or(false))
    }
}

/// Scoped lease: release with [`LeaseGuard::release`], or let it drop.
///
/// Dropping a guard that was not released (early return, error, cancelled
/// future) schedules the release on the current runtime.
#[must_use = "dropping the guard releases the lock"]
pub struct LeaseGuard {
    lock: Arc<DistributedLock>,
    lease: Option<LockLease>,
}

impl LeaseGuard {
    fn new(lock: Arc<DistributedLock>, lease: LockLease) -> Self {
        Self {
            lock,
            lease: Some(lease),
        }
    }

    /// The underlying lease.
    pub fn lease(&self) -> Option<&LockLease> {
        self.lease.as_ref()
    }

    /// Release now and report whether the lease was still ours.
    pub async fn release(mut self) -> Result<bool> {
        match self.lease.take() {
            Some(lease) => self.lock.release(&lease).await,
            None => Ok(false),
        }
    }
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard").field("lease", &self.lease).finish()
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let lock = Arc::clone(&self.lock);
                handle.spawn(async move {
                    if let Err(e) = lock.release(&lease).await {
                        warn!(lock_key = %lease.lock_key, error = %e, "Deferred lock release failed");
                    }
                });
            }
            Err(_) => {
                warn!(
                    lock_key = %lease.lock_key,
                    "No runtime to release lock; lease will lapse at TTL"
                );
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
