//! Redis bucket backend.
//!
//! Every consume runs as one server-side Lua script, so the read, the
//! window initialization and the decrement happen atomically with respect
//! to every other client of the same Redis instance.
//!
//! Each bucket key maps onto three Redis keys:
//! - `rl:<key>:t` holds the remaining tokens, TTL = window
//! - `rl:<key>:r` is a marker whose TTL is the authoritative time to reset
//! - `rl:<key>:b` exists while a block is active, TTL = block length

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::future::Future;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, trace};

use super::backend::{now_ms, BucketBackend, BucketStatus, ConsumeResult};
use super::policy::Policy;
use crate::error::{QuotaError, Result};

/// KEYS: tokens, reset marker, block.
/// ARGV: now (ms), points, duration (ms), block (ms).
/// Returns `{allowed, remaining, reset_ms, retry_after_ms}`.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local tokens_key = KEYS[1]
local reset_key  = KEYS[2]
local block_key  = KEYS[3]

local points      = tonumber(ARGV[2])
local duration_ms = tonumber(ARGV[3])
local block_ms    = tonumber(ARGV[4])

local blocked = redis.call('PTTL', block_key)
if blocked > 0 then
  return {0, 0, redis.call('PTTL', reset_key), blocked}
end

local tokens = tonumber(redis.call('GET', tokens_key))
local reset_ttl = tonumber(redis.call('PTTL', reset_key))
if not tokens or reset_ttl <= 0 then
  tokens = points
  redis.call('SET', tokens_key, tokens, 'PX', duration_ms)
  redis.call('SET', reset_key, 1, 'PX', duration_ms)
end

if tokens > 0 then
  tokens = tokens - 1
  redis.call('SET', tokens_key, tokens, 'KEEPTTL')
  return {1, tokens, redis.call('PTTL', reset_key), 0}
end

if block_ms > 0 then
  redis.call('SET', block_key, 1, 'PX', block_ms)
  return {0, 0, redis.call('PTTL', reset_key), block_ms}
end

local reset_left = redis.call('PTTL', reset_key)
return {0, 0, reset_left, reset_left}
"#;

/// Default deadline for establishing the connection and loading the script.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Default deadline for a single command round trip.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

/// Connection settings for [`RedisBackend`].
#[derive(Debug, Clone)]
pub struct RedisOptions {
    /// Redis connection URL
    pub url: String,
    /// Deadline for `init`
    pub connect_timeout: Duration,
    /// Deadline for each consume/reset/status round trip
    pub command_timeout: Duration,
}

impl RedisOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

/// The three Redis keys backing one bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RedisKeys {
    tokens: String,
    reset: String,
    block: String,
}

impl RedisKeys {
    fn new(key: &str) -> Self {
        Self {
            tokens: format!("rl:{}:t", key),
            reset: format!("rl:{}:r", key),
            block: format!("rl:{}:b", key),
        }
    }
}

/// Clamp a PTTL reply (-2 missing, -1 no expiry) to a millisecond count.
fn ttl_ms(ttl: i64) -> u64 {
    u64::try_from(ttl).unwrap_or(0)
}

/// Bucket backend shared through Redis.
pub struct RedisBackend {
    options: RedisOptions,
    script: Script,
    connection: OnceCell<ConnectionManager>,
}

impl RedisBackend {
    /// Create a backend; nothing is contacted until [`init`](BucketBackend::init).
    pub fn new(options: RedisOptions) -> Self {
        Self {
            options,
            script: Script::new(TOKEN_BUCKET_SCRIPT),
            connection: OnceCell::new(),
        }
    }

    /// SHA1 digest the script is invoked by.
    pub fn script_digest(&self) -> &str {
        self.script.get_hash()
    }

    fn connection(&self) -> Result<ConnectionManager> {
        self.connection
            .get()
            .cloned()
            .ok_or(QuotaError::NotInitialized("redis"))
    }

    async fn bounded<T, F>(&self, operation: &'static str, after: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(after, fut).await {
            Ok(result) => result.map_err(QuotaError::from),
            Err(_) => Err(QuotaError::Timeout { operation, after }),
        }
    }

    async fn connect(&self) -> Result<ConnectionManager> {
        let client = Client::open(self.options.url.as_str())?;
        let timeout = self.options.connect_timeout;
        let mut conn = self
            .bounded("redis connect", timeout, ConnectionManager::new(client))
            .await?;

        let digest: String = self
            .bounded(
                "redis script load",
                timeout,
                self.script.prepare_invoke().load_async(&mut conn),
            )
            .await?;
        debug!(digest = %digest, "Loaded token bucket script");

        Ok(conn)
    }
}

#[async_trait]
impl BucketBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn init(&self) -> Result<()> {
        self.connection.get_or_try_init(|| self.connect()).await?;
        info!(digest = %self.script_digest(), "Redis backend initialized");
        Ok(())
    }

    async fn consume(&self, key: &str, policy: &Policy) -> Result<ConsumeResult> {
        let mut conn = self.connection()?;
        let keys = RedisKeys::new(key);
        trace!(key = %key, points = policy.points, "Consuming from redis bucket");

        let mut invocation = self.script.prepare_invoke();
        invocation
            .key(&keys.tokens)
            .key(&keys.reset)
            .key(&keys.block)
            .arg(now_ms())
            .arg(policy.points)
            .arg(policy.duration_ms())
            .arg(policy.block_ms);

        let (allowed, remaining, reset_ms, retry_after_ms): (i64, i64, i64, i64) = self
            .bounded(
                "redis consume",
                self.options.command_timeout,
                invocation.invoke_async(&mut conn),
            )
            .await?;

        Ok(ConsumeResult {
            allowed: allowed == 1,
            remaining: u32::try_from(remaining).unwrap_or(0),
            reset_ms: ttl_ms(reset_ms),
            retry_after_ms: ttl_ms(retry_after_ms),
        })
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let mut conn = self.connection()?;
        let keys = RedisKeys::new(key);

        let mut cmd = redis::cmd("DEL");
        cmd.arg(&keys.tokens).arg(&keys.reset).arg(&keys.block);
        let _removed: i64 = self
            .bounded(
                "redis reset",
                self.options.command_timeout,
                cmd.query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn status(&self, key: &str) -> Result<Option<BucketStatus>> {
        let mut conn = self.connection()?;
        let keys = RedisKeys::new(key);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .get(&keys.tokens)
            .pttl(&keys.reset)
            .pttl(&keys.block);
        let (tokens, reset_ttl, block_ttl): (Option<u32>, i64, i64) = self
            .bounded(
                "redis status",
                self.options.command_timeout,
                pipe.query_async(&mut conn),
            )
            .await?;

        let blocked_ms = ttl_ms(block_ttl);
        match tokens {
            Some(remaining) if reset_ttl > 0 => Ok(Some(BucketStatus {
                remaining,
                reset_ms: ttl_ms(reset_ttl),
                blocked_ms,
            })),
            _ if blocked_ms > 0 => Ok(Some(BucketStatus {
                remaining: 0,
                reset_ms: 0,
                blocked_ms,
            })),
            _ => Ok(None),
        }
    }
}
