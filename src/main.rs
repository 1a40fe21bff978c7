//! Flashmart Simulator
//!
//! Drives the data-access layer the way a busy marketplace would: a burst of
//! cache reads on a hot shop, lookups of shops that do not exist, and a
//! flash sale with more buyers than stock. Prints what happened and the
//! final metrics in Prometheus text format.
//!
//! # Scenario
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────┐   ┌──────────────────────────┐
//! │  Cache burst │──▶│ Logical hot key  │──▶│ Flash sale               │
//! │  (mutex)     │   │ (stale + rebuild)│   │ (admit, persist, verify) │
//! └──────────────┘   └──────────────────┘   └──────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use flashmart::adapters::{
    CompositeEventPublisher, InMemoryDeadLetterQueue, InMemoryEventCollector, InMemoryKvBackend,
    InMemoryOrderStore, LoggingEventPublisher,
};
use flashmart::cache::{CacheMetricsSnapshot, CacheStore};
use flashmart::domain::ports::{EventPublisher, KeyValueBackend};
use flashmart::seckill::AdmissionMetricsSnapshot;
use flashmart::{
    Admission, AdmissionConfig, AdmissionController, CacheConfig, DistributedLock, Error,
    IdGenerator, OrderPersistenceWorker, PersistenceConfig, RejectReason, Result, UserId, Voucher,
    VoucherId, WorkerPoolConfig,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Flashmart - cache, lock and flash-sale simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Units of stock on sale
    #[arg(long, env = "VOUCHER_STOCK", default_value = "100")]
    voucher_stock: u32,

    /// Concurrent purchase attempts
    #[arg(long, env = "BUYERS", default_value = "500")]
    buyers: usize,

    /// Distinct users among the buyers (fewer users means duplicate attempts)
    #[arg(long, env = "DISTINCT_USERS", default_value = "400")]
    distinct_users: u64,

    /// Concurrent readers of the hot shop
    #[arg(long, env = "CACHE_READERS", default_value = "50")]
    cache_readers: usize,

    /// Simulated source-of-truth latency in milliseconds
    #[arg(long, env = "LOADER_LATENCY_MS", default_value = "200")]
    loader_latency_ms: u64,

    /// Rebuild and persistence pool size
    #[arg(long, env = "POOL_WORKERS", default_value = "10")]
    pool_workers: usize,

    /// Order-store failures to inject before inserts succeed
    #[arg(long, env = "STORE_FAILURES", default_value = "0")]
    store_failures: u32,

    /// Redis URL; the in-memory backend is used when absent
    #[cfg(feature = "redis-backend")]
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

/// Shop record served from the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Shop {
    id: u64,
    name: String,
    area: String,
}

const SHOP_KEY_PREFIX: &str = "cache:shop:";
const HOT_SHOP_KEY_PREFIX: &str = "cache:shop:hot:";

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args)?;

    info!("Starting Flashmart simulator");
    info!("  Stock: {}, buyers: {}, distinct users: {}", args.voucher_stock, args.buyers, args.distinct_users);
    info!("  Cache readers: {}, loader latency: {}ms", args.cache_readers, args.loader_latency_ms);

    let cancel = CancellationToken::new();
    let backend = connect_backend(&args, &cancel).await?;

    let collector = Arc::new(InMemoryEventCollector::new());
    let events: Arc<dyn EventPublisher> = Arc::new(
        CompositeEventPublisher::new()
            .with_publisher(LoggingEventPublisher::quiet())
            .with_shared(collector.clone()),
    );

    let lock = Arc::new(DistributedLock::new(backend.clone()));

    // Cache scenario
    let cache = CacheStore::new(
        backend.clone(),
        lock.clone(),
        CacheConfig {
            rebuild_pool: WorkerPoolConfig {
                workers: args.pool_workers,
                ..WorkerPoolConfig::named("cache-rebuild")
            },
            ..CacheConfig::default()
        },
    )?
    .with_publisher(events.clone());
    let cache = Arc::new(cache);

    run_cache_scenario(&args, &cache).await?;

    // Flash-sale scenario
    let store = Arc::new(InMemoryOrderStore::new());
    store.fail_next(args.store_failures);
    let dead_letters = Arc::new(InMemoryDeadLetterQueue::new());

    let persistence = Arc::new(
        OrderPersistenceWorker::new(
            store.clone(),
            lock.clone(),
            dead_letters.clone(),
            PersistenceConfig {
                pool: WorkerPoolConfig {
                    workers: args.pool_workers,
                    ..WorkerPoolConfig::named("order-persistence")
                },
                ..PersistenceConfig::default()
            },
        )?
        .with_publisher(events.clone()),
    );
    let controller = Arc::new(
        AdmissionController::new(
            backend.clone(),
            Arc::new(IdGenerator::new(backend.clone())),
            persistence.clone(),
            AdmissionConfig::default(),
        )
        .with_publisher(events.clone()),
    );

    let admitted = run_flash_sale(&args, &controller).await?;

    // Drain background work before checking the store
    persistence.shutdown().await;
    cache.shutdown().await;
    cancel.cancel();

    let persisted = store.len();
    info!(
        admitted,
        persisted,
        dead_lettered = dead_letters.len(),
        events = ?collector.count_by_type(),
        "Flash sale settled"
    );
    if persisted + dead_letters.len() != admitted {
        error!(admitted, persisted, "Admitted orders missing from the store");
    }

    let rendered = render_metrics(&cache.metrics().snapshot(), &controller.metrics().snapshot())?;
    println!("{}", rendered);

    info!("Simulator finished");
    Ok(())
}

// =============================================================================
// Backend Setup
// =============================================================================

async fn connect_backend(
    args: &Args,
    cancel: &CancellationToken,
) -> Result<Arc<dyn KeyValueBackend>> {
    #[cfg(feature = "redis-backend")]
    {
        if let Some(url) = &args.redis_url {
            let backend = flashmart::adapters::RedisKvBackend::connect(url).await?;
            info!("Connected to Redis backend");
            return Ok(Arc::new(backend));
        }
    }
    #[cfg(not(feature = "redis-backend"))]
    let _ = args;

    let backend = Arc::new(InMemoryKvBackend::new());
    let _sweeper = backend.spawn_expiry_sweeper(Duration::from_secs(1), cancel.clone());
    info!("Using in-memory backend");
    Ok(backend as Arc<dyn KeyValueBackend>)
}

// =============================================================================
// Scenarios
// =============================================================================

async fn run_cache_scenario(args: &Args, cache: &Arc<CacheStore>) -> Result<()> {
    let latency = Duration::from_millis(args.loader_latency_ms);
    let loader = move |id: u64| async move {
        tokio::time::sleep(latency).await;
        Ok::<_, anyhow::Error>((id <= 10).then(|| Shop {
            id,
            name: format!("Shop #{}", id),
            area: "Riverside".to_string(),
        }))
    };
    let ttl = cache.config().default_ttl;

    // Hot-key burst: one loader call for everyone
    let mut handles = Vec::with_capacity(args.cache_readers);
    for _ in 0..args.cache_readers {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move {
            cache
                .get_or_load_with_mutex::<u64, Shop, _>(SHOP_KEY_PREFIX, 1u64, &loader, ttl)
                .await
        }));
    }
    let mut served = 0usize;
    for handle in handles {
        let shop: Option<Shop> = handle
            .await
            .map_err(|e| Error::Internal(format!("reader task failed: {}", e)))??;
        if shop.is_some() {
            served += 1;
        }
    }
    info!(readers = args.cache_readers, served, "Mutex-mode burst done");

    // Penetration: a missing id is looked up once, then served from the sentinel
    for _ in 0..5 {
        let missing: Option<Shop> = cache.get_or_load::<u64, Shop, _>(SHOP_KEY_PREFIX, 404u64, &loader, ttl).await?;
        if missing.is_some() {
            warn!("Shop 404 unexpectedly exists");
        }
    }

    // Logical expiration: warm with an already-expired entry, then read concurrently
    cache.warm_logical::<u64, Shop, _>(HOT_SHOP_KEY_PREFIX, 2u64, &loader, Duration::ZERO).await?;
    let mut handles = Vec::with_capacity(args.cache_readers);
    for _ in 0..args.cache_readers {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move {
            cache
                .get_with_logical_expire::<u64, Shop, _>(HOT_SHOP_KEY_PREFIX, 2u64, loader, Duration::from_secs(60))
                .await
        }));
    }
    for handle in handles {
        let _: Option<Shop> = handle
            .await
            .map_err(|e| Error::Internal(format!("reader task failed: {}", e)))??;
    }

    // Updating a shop drops its cached copy
    cache.invalidate(&format!("{}1", SHOP_KEY_PREFIX)).await?;

    let snap = cache.metrics().snapshot();
    info!(
        loader_calls = snap.loader_calls,
        rebuilds = snap.rebuilds_scheduled,
        hit_ratio = snap.hit_ratio,
        "Cache scenario done"
    );
    Ok(())
}

async fn run_flash_sale(args: &Args, controller: &Arc<AdmissionController>) -> Result<usize> {
    let voucher_id = VoucherId(1);
    let now = Utc::now();
    let voucher = Voucher::new(
        voucher_id,
        now - chrono::Duration::minutes(1),
        now + chrono::Duration::minutes(10),
        args.voucher_stock,
    );
    controller.publish_voucher(&voucher).await?;

    let distinct_users = args.distinct_users.max(1);
    let mut handles = Vec::with_capacity(args.buyers);
    for buyer in 0..args.buyers {
        let controller = controller.clone();
        let user_id = UserId(buyer as u64 % distinct_users + 1);
        handles.push(tokio::spawn(async move {
            controller.attempt_purchase(voucher_id, user_id).await
        }));
    }

    let mut admitted = 0usize;
    let mut sold_out = 0usize;
    let mut duplicates = 0usize;
    for handle in handles {
        let admission = handle
            .await
            .map_err(|e| Error::Internal(format!("buyer task failed: {}", e)))??;
        match admission {
            Admission::Admitted(_) => admitted += 1,
            Admission::Rejected(RejectReason::OutOfStock) => sold_out += 1,
            Admission::Rejected(RejectReason::AlreadyOrdered) => duplicates += 1,
            Admission::Rejected(reason) => warn!(%reason, "Unexpected rejection"),
        }
    }

    let remaining = controller.remaining_stock(voucher_id).await?.unwrap_or_default();
    info!(admitted, sold_out, duplicates, remaining, "Flash sale closed");
    if admitted as i64 + remaining != i64::from(args.voucher_stock) {
        error!(admitted, remaining, "Stock accounting mismatch");
    }
    Ok(admitted)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let redis_directive: tracing_subscriber::filter::Directive = "redis=warn"
        .parse()
        .map_err(|e| Error::Config(format!("bad log directive: {}", e)))?;
    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive(redis_directive);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Metrics Rendering
// =============================================================================

fn render_metrics(
    cache: &CacheMetricsSnapshot,
    admission: &AdmissionMetricsSnapshot,
) -> Result<String> {
    use prometheus::{Encoder, Gauge, IntCounter, Registry, TextEncoder};

    let prom_err = |e: prometheus::Error| Error::Internal(format!("metrics: {}", e));
    let registry = Registry::new_custom(Some("flashmart".to_string()), None).map_err(prom_err)?;

    let counters: [(&str, &str, u64); 19] = [
        ("cache_hits_total", "Cache reads answered with a value", cache.hits),
        ("cache_null_hits_total", "Cache reads answered by the negative sentinel", cache.null_hits),
        ("cache_stale_hits_total", "Logical reads answered with a stale value", cache.stale_hits),
        ("cache_misses_total", "Cache reads that found nothing", cache.misses),
        ("cache_loader_calls_total", "Source-of-truth loads", cache.loader_calls),
        ("cache_loader_failures_total", "Failed source-of-truth loads", cache.loader_failures),
        ("cache_lock_waits_total", "Mutex-mode retries while the rebuild lock was busy", cache.lock_waits),
        ("cache_lock_timeouts_total", "Mutex-mode reads that gave up", cache.lock_timeouts),
        ("cache_rebuilds_scheduled_total", "Background rebuilds scheduled", cache.rebuilds_scheduled),
        ("cache_rebuilds_completed_total", "Background rebuilds completed", cache.rebuilds_completed),
        ("cache_rebuilds_failed_total", "Background rebuilds failed", cache.rebuilds_failed),
        ("seckill_attempts_total", "Purchase attempts", admission.attempts),
        ("seckill_admitted_total", "Purchases admitted", admission.admitted),
        ("seckill_rejected_out_of_stock_total", "Purchases rejected as sold out", admission.rejected_out_of_stock),
        ("seckill_rejected_already_ordered_total", "Purchases rejected as duplicates", admission.rejected_already_ordered),
        ("seckill_rejected_window_total", "Purchases outside the sale window", admission.rejected_not_started + admission.rejected_ended),
        ("orders_persisted_total", "Order tickets written to the store", admission.persisted),
        ("orders_persistence_retries_total", "Order insert retries", admission.persistence_retries),
        ("orders_dead_lettered_total", "Order tickets dead-lettered", admission.dead_lettered),
    ];

    for (name, help, value) in counters {
        let counter = IntCounter::new(name, help).map_err(prom_err)?;
        counter.inc_by(value);
        registry.register(Box::new(counter)).map_err(prom_err)?;
    }

    let hit_ratio = Gauge::new("cache_hit_ratio", "Fraction of cache reads served without a load")
        .map_err(prom_err)?;
    hit_ratio.set(cache.hit_ratio);
    registry.register(Box::new(hit_ratio)).map_err(prom_err)?;

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(prom_err)?;
    String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics: {}", e)))
}
