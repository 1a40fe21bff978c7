//! Error types for Flashmart

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the data-access layer
///
/// Expected purchase outcomes (sold out, duplicate order, closed window) are
/// not errors; see [`crate::domain::Admission`].
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// The source of truth (loader or durable store) failed on a synchronous path
    #[error("Source of truth unavailable: {0}")]
    SourceUnavailable(String),

    /// Mutex-mode cache read could not obtain the rebuild lock in time
    #[error("Timed out waiting for lock {key} after {attempts} attempts")]
    LockTimeout { key: String, attempts: u32 },

    /// Key-value backend connectivity or protocol error
    #[error("Key-value backend error: {0}")]
    Backend(String),

    /// Atomic script failed or returned an unexpected value
    #[error("Script {script} failed: {reason}")]
    Script { script: String, reason: String },

    /// Payload (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Voucher has not been published to the backend
    #[error("Voucher not published: {0}")]
    UnknownVoucher(u64),

    /// Sequence counter overflowed its 32-bit slot for the current day
    #[error("Sequence exhausted for key: {key}")]
    SequenceExhausted { key: String },

    /// Order ticket could not be written after bounded retries
    #[error("Failed to persist order {order_id} after {attempts} attempts: {reason}")]
    PersistenceFailure {
        order_id: i64,
        attempts: u32,
        reason: String,
    },

    /// Worker pool queue is full
    #[error("Worker pool '{pool}' is saturated")]
    PoolSaturated { pool: String },

    /// Worker pool has been shut down
    #[error("Worker pool '{pool}' is closed")]
    PoolClosed { pool: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap a loader failure coming from caller-supplied code.
    pub fn source_unavailable(err: impl std::fmt::Display) -> Self {
        Error::SourceUnavailable(err.to_string())
    }

    /// Wrap a backend failure.
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Error::Backend(err.to_string())
    }

    /// True for errors caused by infrastructure rather than the request itself.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Error::SourceUnavailable(_) | Error::Backend(_) | Error::Script { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::LockTimeout {
            key: "lock:cache:shop:1".to_string(),
            attempts: 3,
        };
        assert_eq!(
            err.to_string(),
            "Timed out waiting for lock lock:cache:shop:1 after 3 attempts"
        );

        let err = Error::PersistenceFailure {
            order_id: 42,
            attempts: 5,
            reason: "db down".to_string(),
        };
        assert!(err.to_string().contains("order 42"));
    }

    #[test]
    fn test_infrastructure_classification() {
        assert!(Error::backend("connection refused").is_infrastructure());
        assert!(Error::source_unavailable("timeout").is_infrastructure());
        assert!(!Error::Config("bad".to_string()).is_infrastructure());
    }

    #[test]
    fn test_serialization_from() {
        let err: Error = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
