//! Cache payload encodings.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Payload stored for a "not found" result.
pub const EMPTY_SENTINEL: &[u8] = b"";

/// True if a cached payload is the negative-cache marker.
pub fn is_empty_sentinel(payload: &[u8]) -> bool {
    payload == EMPTY_SENTINEL
}

/// Value wrapper for logically-expiring keys.
///
/// The backend key has no TTL; staleness is decided from `expire_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalEnvelope<T> {
    pub data: T,
    pub expire_at: DateTime<Utc>,
}

impl<T> LogicalEnvelope<T> {
    /// Wrap `data`, expiring `ttl` from now.
    pub fn new(data: T, ttl: Duration) -> Result<Self> {
        Ok(Self {
            data,
            expire_at: expire_at_after(Utc::now(), ttl)?,
        })
    }

    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        self.expire_at > now
    }
}

impl<T: Serialize> LogicalEnvelope<T> {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

impl<T: DeserializeOwned> LogicalEnvelope<T> {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

pub(crate) fn expire_at_after(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or_else(|| Error::Config(format!("logical ttl {:?} out of range", ttl)))
}

/// Serialize a plain cached value.
pub(crate) fn encode_value<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

pub(crate) fn decode_value<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(payload)?)
}
