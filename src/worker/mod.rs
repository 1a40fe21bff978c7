//! Bounded Worker Pool
//!
//! A fixed number of tokio tasks draining one bounded job queue. Used for
//! cache rebuilds and order persistence so that load spikes queue up (or
//! are refused) instead of spawning unbounded work.
//!
//! ```text
//!  submit ──▶ ┌──────────────────────┐      ┌──────────┐
//!  submit ──▶ │ mpsc queue (bounded) │ ───▶ │ worker 0 │
//!  try_submit▶└──────────────────────┘  ├─▶ │ worker 1 │
//!                                       └─▶ │ worker N │
//!                                           └──────────┘
//! ```
//!
//! `shutdown` stops intake, lets the workers drain what is already queued,
//! then joins them.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{Error, Result};

/// A unit of work accepted by the pool.
pub type Job = BoxFuture<'static, ()>;

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Name used in logs and errors
    pub name: String,
    /// Number of worker tasks
    pub workers: usize,
    /// Jobs that may wait in the queue
    pub queue_capacity: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            workers: 10,
            queue_capacity: 1024,
        }
    }
}

impl WorkerPoolConfig {
    /// Default sizing under a different name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config(format!(
                "pool '{}' needs at least one worker",
                self.name
            )));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config(format!(
                "pool '{}' needs a non-empty queue",
                self.name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    panicked: AtomicU64,
    active: AtomicU64,
}

/// Point-in-time pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerPoolStats {
    pub submitted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub panicked: u64,
    /// Jobs running right now
    pub active: u64,
    /// Jobs waiting in the queue
    pub queued: usize,
}

/// Fixed-size async worker pool with a bounded queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    /// `None` once shut down
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<PoolCounters>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl WorkerPool {
    /// Start the pool's workers on the current runtime.
    pub fn new(config: WorkerPoolConfig) -> Result<Self> {
        config.validate()?;

        let (tx, rx) = mpsc::channel::<Job>(config.queue_capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let counters = Arc::new(PoolCounters::default());

        let workers = (0..config.workers)
            .map(|index| {
                let rx = Arc::clone(&rx);
                let counters = Arc::clone(&counters);
                let name = config.name.clone();
                tokio::spawn(run_worker(name, index, rx, counters))
            })
            .collect();

        info!(
            pool = %config.name,
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "Worker pool started"
        );

        Ok(Self {
            config,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            counters,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn sender(&self) -> Result<mpsc::Sender<Job>> {
        self.sender.lock().clone().ok_or_else(|| Error::PoolClosed {
            pool: self.config.name.clone(),
        })
    }

    /// Queue a job, waiting for room if the queue is full.
    pub async fn submit<F>(&self, job: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let sender = self.sender()?;
        sender
            .send(job.boxed())
            .await
            .map_err(|_| Error::PoolClosed {
                pool: self.config.name.clone(),
            })?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Queue a job without waiting. Fails with `PoolSaturated` when full.
    pub fn try_submit<F>(&self, job: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let sender = self.sender()?;
        match sender.try_send(job.boxed()) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                Err(Error::PoolSaturated {
                    pool: self.config.name.clone(),
                })
            }
            Err(TrySendError::Closed(_)) => Err(Error::PoolClosed {
                pool: self.config.name.clone(),
            }),
        }
    }

    /// True once `shutdown` has been called.
    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Stop intake, drain queued jobs and join every worker.
    pub async fn shutdown(&self) {
        if self.sender.lock().take().is_none() {
            return;
        }

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(e) = handle.await {
                error!(pool = %self.config.name, error = %e, "Worker task ended abnormally");
            }
        }
        info!(pool = %self.config.name, stats = ?self.stats(), "Worker pool stopped");
    }

    /// Get pool statistics
    pub fn stats(&self) -> WorkerPoolStats {
        let queued = self
            .sender
            .lock()
            .as_ref()
            .map(|s| s.max_capacity() - s.capacity())
            .unwrap_or(0);
        WorkerPoolStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
            active: self.counters.active.load(Ordering::Relaxed),
            queued,
        }
    }
}

async fn run_worker(
    pool: String,
    index: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    counters: Arc<PoolCounters>,
) {
    debug!(pool = %pool, worker = index, "Worker started");
    loop {
        let job = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            break;
        };

        counters.active.fetch_add(1, Ordering::Relaxed);
        // A panicking job must not take the worker down with it
        let outcome = AssertUnwindSafe(job).catch_unwind().await;
        counters.active.fetch_sub(1, Ordering::Relaxed);

        match outcome {
            Ok(()) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                counters.panicked.fetch_add(1, Ordering::Relaxed);
                error!(pool = %pool, worker = index, "Job panicked");
            }
        }
    }
    debug!(pool = %pool, worker = index, "Worker stopped");
}

// =============================================================================
// Tests
// =============================================================================
