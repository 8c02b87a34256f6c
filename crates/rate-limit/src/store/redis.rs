use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{ErrorKind, RedisError, Script};
use tracing::debug;

use super::{
    BucketOutcome, CounterRecord, CounterStore, KeyStats, LimitStat, PenaltyStat, RecordKind,
    StoreError, StoreKey,
};
use crate::penalty;
use crate::policy::Algorithm;
use crate::token_bucket::BucketParams;

/// INCR with a TTL set on first write. Returns `{count, pttl}`.
static COUNTER_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local window_ms = tonumber(ARGV[1])
        local count = redis.call('INCR', KEYS[1])
        if count == 1 then
            redis.call('PEXPIRE', KEYS[1], window_ms)
        end
        local ttl = redis.call('PTTL', KEYS[1])
        if ttl < 0 then
            redis.call('PEXPIRE', KEYS[1], window_ms)
            ttl = window_ms
        end
        return {count, ttl}
        "#,
    )
});

/// Refill and take one token. State is persisted only when a token is
/// taken. Returns `{admitted, tokens}` with tokens as a string, since Lua
/// numbers are truncated to integers on the way out.
static BUCKET_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local capacity = tonumber(ARGV[1])
        local limit = tonumber(ARGV[2])
        local window_ms = tonumber(ARGV[3])
        local now = tonumber(ARGV[4])
        local ttl = tonumber(ARGV[5])

        local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
        local tokens = tonumber(state[1])
        local last = tonumber(state[2])
        if tokens == nil or last == nil then
            tokens = capacity
            last = now
        end

        local elapsed = math.max(0, now - last)
        local available = math.min(capacity, tokens + elapsed * limit / window_ms)
        if available >= 1 then
            available = available - 1
            redis.call('HSET', KEYS[1], 'tokens', tostring(available), 'ts', now)
            redis.call('PEXPIRE', KEYS[1], ttl)
            return {1, tostring(available)}
        end
        return {0, tostring(available)}
        "#,
    )
});

/// Capped INCR that restarts the decay TTL.
static PENALTY_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local max_level = tonumber(ARGV[1])
        local level = redis.call('INCR', KEYS[1])
        if level > max_level then
            level = max_level
            redis.call('SET', KEYS[1], level)
        end
        redis.call('PEXPIRE', KEYS[1], ARGV[2])
        return level
        "#,
    )
});

const SCAN_BATCH: usize = 500;

fn store_error(e: RedisError) -> StoreError {
    match e.kind() {
        ErrorKind::TypeError => StoreError::Protocol(e.to_string()),
        _ => StoreError::Unavailable(e.to_string()),
    }
}

/// Escape glob metacharacters for `SCAN MATCH`.
fn glob_escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn ttl_ms(pttl: i64) -> u64 {
    pttl.max(0) as u64
}

/// Counter store shared by every instance pointed at the same Redis.
///
/// Each operation is a single command or Lua script, so it is atomic per key
/// on the server. Timestamps come from the caller's clock; TTLs are enforced
/// by Redis.
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisStore {
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(store_error)?;
        let conn = ConnectionManager::new(client).await.map_err(store_error)?;

        let mut probe = conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut probe)
            .await
            .map_err(store_error)?;

        debug!(prefix, "connected to redis counter store");
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
        })
    }

    fn redis_key(&self, key: &StoreKey) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// All stored keys belonging to `identity`, prefix stripped.
    async fn scan_identity(&self, identity: &str) -> Result<Vec<(String, StoreKey)>, StoreError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*:{}", glob_escape(&self.prefix), glob_escape(identity));
        let mut cursor: u64 = 0;
        let mut found = Vec::new();

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(store_error)?;

            for raw in keys {
                let parsed = raw
                    .strip_prefix(self.prefix.as_str())
                    .and_then(StoreKey::parse)
                    .filter(|k| k.identity == identity);
                if let Some(key) = parsed {
                    found.push((raw, key));
                }
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(found)
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn increment(
        &self,
        key: &StoreKey,
        window: Duration,
        now_ms: u64,
    ) -> Result<CounterRecord, StoreError> {
        let mut conn = self.conn.clone();
        let window_ms = window.as_millis() as u64;
        let (count, pttl): (u64, i64) = COUNTER_SCRIPT
            .key(self.redis_key(key))
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;

        let reset_at_ms = now_ms + ttl_ms(pttl);
        Ok(CounterRecord {
            count,
            window_start_ms: reset_at_ms.saturating_sub(window_ms),
            reset_at_ms,
        })
    }

    async fn take_token(
        &self,
        key: &StoreKey,
        params: &BucketParams,
        now_ms: u64,
    ) -> Result<BucketOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let (admitted, tokens): (i64, String) = BUCKET_SCRIPT
            .key(self.redis_key(key))
            .arg(params.capacity())
            .arg(params.limit)
            .arg(params.window_ms)
            .arg(now_ms)
            .arg(params.ttl().as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;

        let tokens: f64 = tokens
            .parse()
            .map_err(|_| StoreError::Protocol(format!("bucket tokens '{}'", tokens)))?;
        Ok(BucketOutcome {
            admitted: admitted == 1,
            tokens,
        })
    }

    async fn penalty_level(&self, key: &StoreKey, _now_ms: u64) -> Result<u32, StoreError> {
        let mut conn = self.conn.clone();
        let level: Option<u32> = redis::cmd("GET")
            .arg(self.redis_key(key))
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(level.unwrap_or(0))
    }

    async fn record_violation(
        &self,
        key: &StoreKey,
        max_level: u32,
        decay: Duration,
        _now_ms: u64,
    ) -> Result<u32, StoreError> {
        let mut conn = self.conn.clone();
        let level: u32 = PENALTY_SCRIPT
            .key(self.redis_key(key))
            .arg(max_level)
            .arg(decay.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(level)
    }

    async fn flag_suspicious(
        &self,
        key: &StoreKey,
        ttl: Duration,
        _now_ms: u64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(self.redis_key(key))
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg((ttl.as_millis() as u64).max(1))
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(set.is_some())
    }

    async fn reset_identity(&self, identity: &str) -> Result<usize, StoreError> {
        let keys: Vec<String> = self
            .scan_identity(identity)
            .await?
            .into_iter()
            .map(|(raw, _)| raw)
            .collect();
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.clone();
        let deleted: usize = redis::cmd("DEL")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(deleted)
    }

    async fn stats(&self, identity: &str, _now_ms: u64) -> Result<KeyStats, StoreError> {
        let mut conn = self.conn.clone();
        let mut stats = KeyStats::default();

        for (raw, key) in self.scan_identity(identity).await? {
            let pttl: i64 = redis::cmd("PTTL")
                .arg(&raw)
                .query_async(&mut conn)
                .await
                .map_err(store_error)?;
            if pttl == -2 {
                continue;
            }
            let expires_in_ms = ttl_ms(pttl);

            match key.kind {
                RecordKind::Counter => {
                    let count: Option<u64> = redis::cmd("GET")
                        .arg(&raw)
                        .query_async(&mut conn)
                        .await
                        .map_err(store_error)?;
                    stats.limits.push(LimitStat {
                        profile: key.profile,
                        algorithm: Algorithm::Counter,
                        count: Some(count.unwrap_or(0)),
                        tokens: None,
                        expires_in_ms,
                    });
                }
                RecordKind::Bucket => {
                    let tokens: Option<String> = redis::cmd("HGET")
                        .arg(&raw)
                        .arg("tokens")
                        .query_async(&mut conn)
                        .await
                        .map_err(store_error)?;
                    stats.limits.push(LimitStat {
                        profile: key.profile,
                        algorithm: Algorithm::TokenBucket,
                        count: None,
                        tokens: tokens.and_then(|t| t.parse().ok()),
                        expires_in_ms,
                    });
                }
                RecordKind::Penalty => {
                    let level: Option<u32> = redis::cmd("GET")
                        .arg(&raw)
                        .query_async(&mut conn)
                        .await
                        .map_err(store_error)?;
                    let level = level.unwrap_or(0);
                    stats.penalties.push(PenaltyStat {
                        profile: key.profile,
                        level,
                        multiplier: penalty::multiplier(level),
                        expires_in_ms,
                    });
                }
                RecordKind::Suspicious => stats.suspicious.push(key.profile),
            }
        }

        stats.sort();
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_escape_handles_metacharacters() {
        assert_eq!(glob_escape("ip=1.2.x.x"), "ip=1.2.x.x");
        assert_eq!(glob_escape("uid=a*b?[c]\\"), "uid=a\\*b\\?\\[c\\]\\\\");
    }

    #[test]
    fn negative_ttls_clamp_to_zero() {
        assert_eq!(ttl_ms(-1), 0);
        assert_eq!(ttl_ms(1500), 1500);
    }
}
