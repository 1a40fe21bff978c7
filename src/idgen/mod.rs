//! Distributed ID Generator
//!
//! Time-ordered 63-bit identifiers built from a per-day backend counter.
//!
//! # Layout
//!
//! ```text
//!  63        62                             32 31                              0
//! ┌──┬──────────────────────────────────────┬─────────────────────────────────┐
//! │0 │ seconds since epoch (31 bits)        │ per-day sequence (32 bits)      │
//! └──┴──────────────────────────────────────┴─────────────────────────────────┘
//! ```
//!
//! The sequence comes from a single INCR on `seq:{biz_key}:{yyyy:mm:dd}`, so
//! two racing callers never share a sequence number. Ordering across
//! processes is only as good as their clocks agree.

mod proptest;

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{instrument, trace};

use crate::domain::ports::KeyValueBackend;
use crate::error::{Error, Result};

/// Default epoch: 2022-01-01T00:00:00Z
pub const DEFAULT_EPOCH_SECONDS: i64 = 1_640_995_200;

/// Bits reserved for the sequence component
pub const SEQUENCE_BITS: u32 = 32;

/// Largest sequence that fits the low half
pub const MAX_SEQUENCE: i64 = (1i64 << SEQUENCE_BITS) - 1;

/// Largest timestamp delta that keeps the id positive
pub const MAX_DELTA_SECONDS: i64 = (1i64 << (63 - SEQUENCE_BITS)) - 1;

/// ID generator configuration
#[derive(Debug, Clone)]
pub struct IdGeneratorConfig {
    /// Epoch the timestamp component counts from
    pub epoch_seconds: i64,
    /// Prefix of the counter keys
    pub key_prefix: String,
}

impl Default for IdGeneratorConfig {
    fn default() -> Self {
        Self {
            epoch_seconds: DEFAULT_EPOCH_SECONDS,
            key_prefix: "seq:".to_string(),
        }
    }
}

/// The two halves of a generated id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdParts {
    pub delta_seconds: i64,
    pub sequence: i64,
}

/// Pack a timestamp delta and a sequence into one id.
pub fn compose(delta_seconds: i64, sequence: i64) -> i64 {
    (delta_seconds << SEQUENCE_BITS) | (sequence & MAX_SEQUENCE)
}

/// Split an id back into its halves.
pub fn decompose(id: i64) -> IdParts {
    IdParts {
        delta_seconds: id >> SEQUENCE_BITS,
        sequence: id & MAX_SEQUENCE,
    }
}

/// Distributed, time-ordered id source.
pub struct IdGenerator {
    backend: Arc<dyn KeyValueBackend>,
    config: IdGeneratorConfig,
}

impl std::fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdGenerator").field("config", &self.config).finish()
    }
}

impl IdGenerator {
    /// Create a generator with the default epoch
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self::with_config(backend, IdGeneratorConfig::default())
    }

    pub fn with_config(backend: Arc<dyn KeyValueBackend>, config: IdGeneratorConfig) -> Self {
        Self { backend, config }
    }

    /// Counter key for `biz_key` on the day of `now`.
    pub fn sequence_key(&self, biz_key: &str, now: DateTime<Utc>) -> String {
        format!(
            "{}{}:{}",
            self.config.key_prefix,
            biz_key,
            now.format("%Y:%m:%d")
        )
    }

    /// Wall-clock time of the timestamp half of `id`.
    pub fn timestamp_of(&self, id: i64) -> Option<DateTime<Utc>> {
        let parts = decompose(id);
        Utc.timestamp_opt(self.config.epoch_seconds + parts.delta_seconds, 0)
            .single()
    }

    /// Next id for `biz_key`.
    #[instrument(skip(self))]
    pub async fn next(&self, biz_key: &str) -> Result<i64> {
        self.next_at(biz_key, Utc::now()).await
    }

    /// Next id as if the clock read `now`.
    pub async fn next_at(&self, biz_key: &str, now: DateTime<Utc>) -> Result<i64> {
        let delta = now.timestamp() - self.config.epoch_seconds;
        if !(0..=MAX_DELTA_SECONDS).contains(&delta) {
            return Err(Error::Config(format!(
                "clock {} outside id range for epoch {}",
                now, self.config.epoch_seconds
            )));
        }

        let key = self.sequence_key(biz_key, now);
        let sequence = self.backend.incr(&key).await?;
        if sequence > MAX_SEQUENCE || sequence < 0 {
            return Err(Error::SequenceExhausted { key });
        }

        let id = compose(delta, sequence);
        trace!(key = %key, sequence, id, "Minted id");
        Ok(id)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryKvBackend;
    use bytes::Bytes;
    use std::collections::HashSet;

    fn generator() -> (Arc<InMemoryKvBackend>, Arc<IdGenerator>) {
        let backend = Arc::new(InMemoryKvBackend::new());
        let gen = Arc::new(IdGenerator::new(backend.clone()));
        (backend, gen)
    }

    #[test]
    fn test_sequence_key_format() {
        let (_backend, gen) = generator();
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 23, 59, 0).unwrap();
        assert_eq!(gen.sequence_key("order", now), "seq:order:2024:03:09");
    }

    #[tokio::test]
    async fn test_layout() {
        let (_backend, gen) = generator();
        let now = Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 10).unwrap();

        let first = gen.next_at("order", now).await.unwrap();
        let second = gen.next_at("order", now).await.unwrap();

        assert_eq!(first, (10 << 32) | 1);
        assert_eq!(second, (10 << 32) | 2);
        assert_eq!(gen.timestamp_of(first), Some(now));
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (backend, gen) = generator();
        let now = Utc.with_ymd_and_hms(2023, 6, 1, 12, 0, 0).unwrap();

        gen.next_at("order", now).await.unwrap();
        let shop = gen.next_at("shop", now).await.unwrap();
        assert_eq!(decompose(shop).sequence, 1);
        assert_eq!(
            backend.get("seq:order:2023:06:01").await.unwrap(),
            Some(Bytes::from("1"))
        );
    }

    #[tokio::test]
    async fn test_sequential_calls_increase() {
        let (_backend, gen) = generator();
        let mut last = 0;
        for _ in 0..100 {
            let id = gen.next("order").await.unwrap();
            assert!(id > last);
            last = id;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ids_unique() {
        let (_backend, gen) = generator();
        let mut handles = Vec::new();
        for _ in 0..500 {
            let gen = gen.clone();
            handles.push(tokio::spawn(async move { gen.next("order").await.unwrap() }));
        }

        let mut seen = HashSet::new();
        for h in handles {
            assert!(seen.insert(h.await.unwrap()));
        }
        assert_eq!(seen.len(), 500);
    }

    #[tokio::test]
    async fn test_sequence_exhausted() {
        let (backend, gen) = generator();
        let now = Utc.with_ymd_and_hms(2023, 6, 1, 12, 0, 0).unwrap();
        backend
            .set(
                "seq:order:2023:06:01",
                Bytes::from(MAX_SEQUENCE.to_string()),
                None,
            )
            .await
            .unwrap();

        let result = gen.next_at("order", now).await;
        assert!(matches!(result, Err(Error::SequenceExhausted { .. })));
    }

    #[tokio::test]
    async fn test_clock_before_epoch() {
        let (_backend, gen) = generator();
        let now = Utc.with_ymd_and_hms(2021, 12, 31, 0, 0, 0).unwrap();
        assert!(matches!(
            gen.next_at("order", now).await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_backend_failure_propagates() {
        let (backend, gen) = generator();
        backend.set_offline(true);
        assert!(matches!(gen.next("order").await, Err(Error::Backend(_))));
    }
}
