//! Flash-sale scripts: voucher publication, and the admission checks plus
//! the reservation, each as one backend-side step.

use bytes::Bytes;

use crate::domain::ports::{AtomicScript, ScriptContext};
use crate::error::{Error, Result};

/// Reservation recorded.
pub const CODE_ADMITTED: i64 = 0;

/// Stock or window key missing: the voucher was never published.
pub const CODE_UNKNOWN_VOUCHER: i64 = -1;

/// Encode a sale window as stored under the window key.
pub fn encode_window(begin_millis: i64, end_millis: i64) -> String {
    format!("{}:{}", begin_millis, end_millis)
}

/// Parse a stored sale window.
pub fn decode_window(raw: &[u8]) -> Option<(i64, i64)> {
    let raw = std::str::from_utf8(raw).ok()?;
    let (begin, end) = raw.split_once(':')?;
    Some((begin.parse().ok()?, end.parse().ok()?))
}

/// Flash-sale admission script.
///
/// `KEYS = [stock, window, order marker]`, `ARGV = [now millis, order id]`.
/// Returns 0 on success, a [`RejectReason`](crate::domain::RejectReason)
/// code on rejection, or -1 for an unpublished voucher. Nothing is mutated
/// unless it returns 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeckillScript;

impl SeckillScript {
    fn bad_input(&self, reason: impl Into<String>) -> Error {
        Error::Script {
            script: self.name().to_string(),
            reason: reason.into(),
        }
    }
}

impl AtomicScript for SeckillScript {
    fn name(&self) -> &'static str {
        "seckill_admit"
    }

    fn lua(&self) -> &'static str {
        r#"
local stock = redis.call('get', KEYS[1])
local window = redis.call('get', KEYS[2])
if (not stock) or (not window) then
    return -1
end
local sep = string.find(window, ':', 1, true)
local begin_ms = tonumber(string.sub(window, 1, sep - 1))
local end_ms = tonumber(string.sub(window, sep + 1))
local now = tonumber(ARGV[1])
if now < begin_ms then
    return 3
end
if now > end_ms then
    return 4
end
if tonumber(stock) <= 0 then
    return 1
end
if redis.call('exists', KEYS[3]) == 1 then
    return 2
end
redis.call('incrby', KEYS[1], -1)
redis.call('set', KEYS[3], ARGV[2])
return 0
"#
    }

    fn execute(&self, ctx: &mut dyn ScriptContext, keys: &[String], args: &[String]) -> Result<i64> {
        let [stock_key, window_key, marker_key] = keys else {
            return Err(self.bad_input(format!("expected 3 keys, got {}", keys.len())));
        };
        let [now, order_id] = args else {
            return Err(self.bad_input(format!("expected 2 args, got {}", args.len())));
        };
        let now: i64 = now
            .parse()
            .map_err(|_| self.bad_input(format!("bad timestamp '{}'", now)))?;

        let (Some(stock), Some(window)) = (ctx.get(stock_key), ctx.get(window_key)) else {
            return Ok(CODE_UNKNOWN_VOUCHER);
        };
        let (begin, end) = decode_window(&window)
            .ok_or_else(|| self.bad_input(format!("corrupt window at {}", window_key)))?;
        let stock: i64 = std::str::from_utf8(&stock)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| self.bad_input(format!("corrupt stock at {}", stock_key)))?;

        if now < begin {
            return Ok(3);
        }
        if now > end {
            return Ok(4);
        }
        if stock <= 0 {
            return Ok(1);
        }
        if ctx.get(marker_key).is_some() {
            return Ok(2);
        }

        ctx.incr_by(stock_key, -1)?;
        ctx.set(marker_key, Bytes::from(order_id.clone()));
        Ok(CODE_ADMITTED)
    }
}

/// Voucher publication script.
///
/// `KEYS = [stock, window]`, `ARGV = [stock, encoded window]`. Writes both
/// keys together so an admission never sees one without the other.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishScript;

impl AtomicScript for PublishScript {
    fn name(&self) -> &'static str {
        "seckill_publish"
    }

    fn lua(&self) -> &'static str {
        r#"
redis.call('set', KEYS[1], ARGV[1])
redis.call('set', KEYS[2], ARGV[2])
return 0
"#
    }

    fn execute(&self, ctx: &mut dyn ScriptContext, keys: &[String], args: &[String]) -> Result<i64> {
        let bad_input = |reason: String| Error::Script {
            script: self.name().to_string(),
            reason,
        };
        let [stock_key, window_key] = keys else {
            return Err(bad_input(format!("expected 2 keys, got {}", keys.len())));
        };
        let [stock, window] = args else {
            return Err(bad_input(format!("expected 2 args, got {}", args.len())));
        };
        if stock.parse::<i64>().is_err() {
            return Err(bad_input(format!("bad stock '{}'", stock)));
        }
        if decode_window(window.as_bytes()).is_none() {
            return Err(bad_input(format!("bad window '{}'", window)));
        }

        ctx.set(stock_key, Bytes::from(stock.clone()));
        ctx.set(window_key, Bytes::from(window.clone()));
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryKvBackend;
    use crate::domain::model::RejectReason;
    use crate::domain::ports::KeyValueBackend;

    fn keys() -> Vec<String> {
        vec![
            "seckill:stock:1".to_string(),
            "seckill:window:1".to_string(),
            "seckill:order:1:7".to_string(),
        ]
    }

    fn args(now: i64, order_id: i64) -> Vec<String> {
        vec![now.to_string(), order_id.to_string()]
    }

    async fn publish(backend: &InMemoryKvBackend, stock: i64, begin: i64, end: i64) {
        let code = backend
            .eval(
                &PublishScript,
                &keys()[..2],
                &[stock.to_string(), encode_window(begin, end)],
            )
            .await
            .unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    fn test_window_codec() {
        assert_eq!(decode_window(encode_window(10, 20).as_bytes()), Some((10, 20)));
        assert_eq!(decode_window(b"10"), None);
        assert_eq!(decode_window(b"a:b"), None);
    }

    #[tokio::test]
    async fn test_admits_then_rejects_duplicate() {
        let backend = InMemoryKvBackend::new();
        publish(&backend, 2, 0, 1_000).await;

        let code = backend.eval(&SeckillScript, &keys(), &args(500, 99)).await.unwrap();
        assert_eq!(code, CODE_ADMITTED);
        assert_eq!(
            backend.get("seckill:order:1:7").await.unwrap(),
            Some(Bytes::from("99"))
        );
        assert_eq!(
            backend.get("seckill:stock:1").await.unwrap(),
            Some(Bytes::from("1"))
        );

        let code = backend.eval(&SeckillScript, &keys(), &args(500, 100)).await.unwrap();
        assert_eq!(RejectReason::from_code(code), Some(RejectReason::AlreadyOrdered));
        assert_eq!(
            backend.get("seckill:stock:1").await.unwrap(),
            Some(Bytes::from("1"))
        );
    }

    #[tokio::test]
    async fn test_window_and_stock_checks() {
        let backend = InMemoryKvBackend::new();
        publish(&backend, 0, 100, 200).await;

        let code = backend.eval(&SeckillScript, &keys(), &args(99, 1)).await.unwrap();
        assert_eq!(RejectReason::from_code(code), Some(RejectReason::NotStarted));
        let code = backend.eval(&SeckillScript, &keys(), &args(201, 1)).await.unwrap();
        assert_eq!(RejectReason::from_code(code), Some(RejectReason::Ended));
        // Window bounds are inclusive
        let code = backend.eval(&SeckillScript, &keys(), &args(200, 1)).await.unwrap();
        assert_eq!(RejectReason::from_code(code), Some(RejectReason::OutOfStock));
        assert!(backend.get("seckill:order:1:7").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unpublished_voucher() {
        let backend = InMemoryKvBackend::new();
        let code = backend.eval(&SeckillScript, &keys(), &args(1, 1)).await.unwrap();
        assert_eq!(code, CODE_UNKNOWN_VOUCHER);
    }

    #[tokio::test]
    async fn test_publish_writes_stock_and_window() {
        let backend = InMemoryKvBackend::new();
        publish(&backend, 7, 100, 200).await;

        assert_eq!(
            backend.get("seckill:stock:1").await.unwrap(),
            Some(Bytes::from("7"))
        );
        let window = backend.get("seckill:window:1").await.unwrap().unwrap();
        assert_eq!(decode_window(&window), Some((100, 200)));
    }

    #[tokio::test]
    async fn test_publish_rejects_malformed_input() {
        let backend = InMemoryKvBackend::new();
        let result = backend
            .eval(&PublishScript, &keys()[..2], &["x".to_string(), encode_window(1, 2)])
            .await;
        assert!(matches!(result, Err(Error::Script { .. })));

        let result = backend
            .eval(&PublishScript, &keys()[..2], &["3".to_string(), "nope".to_string()])
            .await;
        assert!(matches!(result, Err(Error::Script { .. })));
        // Nothing half-written
        assert!(backend.get("seckill:stock:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bad_arity() {
        let backend = InMemoryKvBackend::new();
        let result = backend.eval(&SeckillScript, &keys()[..1], &args(1, 1)).await;
        assert!(matches!(result, Err(Error::Script { .. })));
    }
}
