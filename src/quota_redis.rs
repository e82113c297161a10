//! Redis quota backend.
//!
//! Each bucket is a hash `{tokens, last_refill}`. Reservations run as one Lua
//! script over every bucket involved, so the refill, the all-or-nothing decision
//! and the write happen atomically on the server.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::quota::{
    validate_buckets, BucketReservation, BucketSpec, QuotaError, QuotaStore, QuotaWindow, Result,
};
use crate::redis_pool::{PoolError, RedisPool};

/// Extra lifetime on bucket hashes beyond one full refill period.
const BUCKET_TTL_SLACK_SECS: u64 = 60;

const RESERVE_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])
local n = #KEYS
local levels = {}
local stamps = {}
local granted = 1

for i = 1, n do
  local base = 3 + (i - 1) * 3
  local capacity = tonumber(ARGV[base])
  local rate = tonumber(ARGV[base + 1])
  local cost = tonumber(ARGV[base + 2])
  local state = redis.call("HMGET", KEYS[i], "tokens", "last_refill")
  local tokens = tonumber(state[1])
  local last = tonumber(state[2])
  if tokens == nil or last == nil then
    tokens = capacity
    last = now
  end
  local elapsed = math.max(0, now - last)
  tokens = math.min(capacity, tokens + elapsed * rate)
  levels[i] = tokens
  stamps[i] = math.max(now, last)
  if tokens < cost then
    granted = 0
  end
end

for i = 1, n do
  local cost = tonumber(ARGV[3 + (i - 1) * 3 + 2])
  local tokens = levels[i]
  if granted == 1 then
    tokens = tokens - cost
  end
  redis.call("HSET", KEYS[i], "tokens", tostring(tokens), "last_refill", tostring(stamps[i]))
  redis.call("EXPIRE", KEYS[i], ttl)
end

return granted
"#;

pub struct RedisQuotaStore {
    pool: RedisPool,
    script: redis::Script,
}

impl RedisQuotaStore {
    pub fn new(pool: RedisPool) -> Self {
        Self {
            pool,
            script: redis::Script::new(RESERVE_SCRIPT),
        }
    }
}

fn bucket_ttl_secs(buckets: &[BucketReservation]) -> u64 {
    let longest = buckets
        .iter()
        .map(|b| b.spec.full_refill_secs())
        .fold(0.0_f64, f64::max);
    longest.ceil() as u64 + BUCKET_TTL_SLACK_SECS
}

fn map_err(e: PoolError) -> QuotaError {
    match e {
        PoolError::Redis(err) => QuotaError::Script(err.to_string()),
        other => QuotaError::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl QuotaStore for RedisQuotaStore {
    async fn reserve_all(&self, buckets: &[BucketReservation], now: f64) -> Result<bool> {
        validate_buckets(buckets)?;
        if buckets.is_empty() {
            return Ok(true);
        }
        let ttl = bucket_ttl_secs(buckets);
        let buckets = buckets.to_vec();
        let script = self.script.clone();
        let granted: i64 = self
            .pool
            .run(move |conn| {
                let mut invocation = script.prepare_invoke();
                for b in &buckets {
                    invocation.key(&b.key);
                }
                invocation.arg(now).arg(ttl);
                for b in &buckets {
                    invocation
                        .arg(b.spec.capacity)
                        .arg(b.spec.refill_per_sec)
                        .arg(b.cost);
                }
                invocation.invoke(conn)
            })
            .await
            .map_err(map_err)?;
        Ok(granted == 1)
    }

    async fn peek(&self, key: &str, spec: BucketSpec, now: f64) -> Result<QuotaWindow> {
        let key = key.to_string();
        let (tokens, last): (Option<f64>, Option<f64>) = self
            .pool
            .run(move |conn| {
                redis::cmd("HMGET")
                    .arg(&key)
                    .arg("tokens")
                    .arg("last_refill")
                    .query(conn)
            })
            .await
            .map_err(map_err)?;
        let window = match (tokens, last) {
            (Some(tokens), Some(last_refill)) => QuotaWindow {
                tokens,
                last_refill,
            },
            _ => QuotaWindow::full(&spec, now),
        };
        Ok(window.refilled(&spec, now))
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.pool
            .run(move |conn| redis::cmd("DEL").arg(&key).query::<i64>(conn))
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn set_cooldown(&self, key: &str, ttl: Duration, reason: &str) -> Result<()> {
        let key = key.to_string();
        let reason = reason.to_string();
        let secs = ttl.as_secs().max(1);
        debug!(key = %key, secs, "redis cooldown");
        self.pool
            .run(move |conn| {
                redis::cmd("SET")
                    .arg(&key)
                    .arg(&reason)
                    .arg("EX")
                    .arg(secs)
                    .query::<()>(conn)
            })
            .await
            .map_err(map_err)
    }

    async fn cooldown_ttl(&self, key: &str) -> Result<Option<u64>> {
        let key = key.to_string();
        let ttl: i64 = self
            .pool
            .run(move |conn| redis::cmd("TTL").arg(&key).query(conn))
            .await
            .map_err(map_err)?;
        // -2: missing, -1: present without expiry (treated as expired marker)
        Ok((ttl > 0).then_some(ttl as u64))
    }

    async fn health_check(&self) -> Result<bool> {
        self.pool.ping().await.map_err(map_err)
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live_store() -> Option<RedisQuotaStore> {
        let url = std::env::var("KEYRELAY_TEST_REDIS_URL").ok()?;
        RedisPool::connect(&url, 4).ok().map(RedisQuotaStore::new)
    }

    #[test]
    fn ttl_covers_slowest_bucket() {
        let buckets = vec![
            BucketReservation::new("a", BucketSpec::per_minute(10), 1.0),
            BucketReservation::new("b", BucketSpec::new(100.0, 0.5), 1.0),
        ];
        assert_eq!(bucket_ttl_secs(&buckets), 200 + BUCKET_TTL_SLACK_SECS);
    }

    #[tokio::test]
    async fn live_reservation_roundtrip() {
        let Some(store) = live_store() else {
            return;
        };
        let key = format!("keyrelay-test:{}", uuid::Uuid::new_v4());
        let spec = BucketSpec::per_minute(2);
        let now = 1_000.0;
        store.reset(&key).await.unwrap();
        assert!(store.reserve(&key, spec, 1.0, now).await.unwrap());
        assert!(store.reserve(&key, spec, 1.0, now).await.unwrap());
        assert!(!store.reserve(&key, spec, 1.0, now).await.unwrap());
        assert!(store.reserve(&key, spec, 1.0, now + 30.0).await.unwrap());
        store.reset(&key).await.unwrap();
    }

    #[tokio::test]
    async fn live_cooldown_marker() {
        let Some(store) = live_store() else {
            return;
        };
        let key = format!("keyrelay-test:cd:{}", uuid::Uuid::new_v4());
        assert_eq!(store.cooldown_ttl(&key).await.unwrap(), None);
        store
            .set_cooldown(&key, Duration::from_secs(30), "transient")
            .await
            .unwrap();
        let ttl = store.cooldown_ttl(&key).await.unwrap().unwrap();
        assert!(ttl > 0 && ttl <= 30);
        store.reset(&key).await.unwrap();
    }
}
