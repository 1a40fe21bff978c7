//! Redis Key-Value Backend Adapter
//!
//! Implements the `KeyValueBackend` port over a Redis server. Scripts run
//! server-side through EVALSHA (falling back to EVAL on a cold script cache),
//! so a script's check-and-mutate steps are indivisible.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use tracing::{debug, instrument};

use crate::domain::ports::{AtomicScript, KeyValueBackend};
use crate::error::{Error, Result};

/// Redis-backed key-value adapter.
///
/// The multiplexed connection is cheap to clone; every call works on its own
/// handle.
#[derive(Clone)]
pub struct RedisKvBackend {
    conn: MultiplexedConnection,
    scripts: std::sync::Arc<DashMap<&'static str, redis::Script>>,
}

impl std::fmt::Debug for RedisKvBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKvBackend")
            .field("cached_scripts", &self.scripts.len())
            .finish()
    }
}

impl RedisKvBackend {
    /// Connect to a Redis server, e.g. `redis://127.0.0.1:6379/0`.
    #[instrument]
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(Error::backend)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(Error::backend)?;
        debug!("Connected to Redis");

        Ok(Self {
            conn,
            scripts: std::sync::Arc::new(DashMap::new()),
        })
    }

    fn script_for(&self, script: &dyn AtomicScript) -> redis::Script {
        self.scripts
            .entry(script.name())
            .or_insert_with(|| redis::Script::new(script.lua()))
            .clone()
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl KeyValueBackend for RedisKvBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(Error::backend)?;
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value.as_ref());
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await.map_err(Error::backend)?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value.as_ref())
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(Error::backend)?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(Error::backend)?;
        Ok(removed > 0)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = redis::cmd("INCR")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(Error::backend)?;
        Ok(value)
    }

    async fn eval(
        &self,
        script: &dyn AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> Result<i64> {
        let mut conn = self.conn.clone();
        let compiled = self.script_for(script);
        let mut invocation = compiled.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(arg);
        }
        let value: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Error::Script {
                script: script.name().to_string(),
                reason: e.to_string(),
            })?;
        Ok(value)
    }
}
