//! Redis-backed sliding-window rate limiting.
//!
//! Each caller gets a Redis list of request timestamps. A single Lua script
//! counts how many land inside the burst and long-term windows, appends the
//! current request when both are under their limits, and answers
//! allow/deny atomically, so concurrent checks for the same key cannot
//! double-spend the quota. The long-term limit can be overridden per check,
//! which is how per-credential quotas ride on one shared limiter.

use anyhow::{Context, Result, anyhow};
use deadpool_redis::{Pool, redis::Script};
use std::{
    ops::Deref,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::args::RateLimiterArgs;
use crate::response::print_warning;

pub mod middleware;

// KEYS[1]  = list key
// ARGV[1]  = burst_limit
// ARGV[2]  = burst_window_ms
// ARGV[3]  = long_limit
// ARGV[4]  = long_window_ms
// ARGV[5]  = now_ms
// ARGV[6]  = max_list_size
//
// Returns 1 if allowed, 0 if limited.
const LUA: &str = include_str!("rate_limit.lua");

#[derive(Clone, Debug)]
pub struct RateLimiterConfig {
    /// Max requests allowed in the burst window
    pub burst_limit: i64,
    /// Burst window length in milliseconds (e.g. 5000 = 5s)
    pub burst_window_ms: i64,
    /// Default max requests in the long-term window; callers with their own
    /// quota override this per check
    pub long_limit: i64,
    /// Long-term window length in milliseconds (e.g. 60000 = 60s)
    pub long_window_ms: i64,
    /// Max list length to keep per key (upper bound on work per check)
    pub max_list_size: i64,
    /// Optional key prefix
    pub key_prefix: String,
}

impl From<RateLimiterArgs> for RateLimiterConfig {
    fn from(args: RateLimiterArgs) -> Self {
        Self {
            burst_limit: args.burst_limit,
            burst_window_ms: args.burst_window_ms,
            long_limit: args.long_limit,
            long_window_ms: args.long_window_ms,
            max_list_size: args.max_list_size,
            key_prefix: args.key_prefix,
        }
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            burst_limit: 20,
            burst_window_ms: 5_000,
            long_limit: 200,
            long_window_ms: 60_000,
            max_list_size: 512, // cap list length to keep scanning cheap
            key_prefix: "rate:".into(),
        }
    }
}

pub struct RateLimiterInner {
    pool: Pool,
    script: Script,
    config: RateLimiterConfig,
}

#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<RateLimiterInner>,
}

impl Deref for RateLimiter {
    type Target = RateLimiterInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl RateLimiter {
    pub fn new(pool: Pool, config: RateLimiterConfig) -> Self {
        Self {
            inner: Arc::new(RateLimiterInner {
                pool,
                script: Script::new(LUA),
                config,
            }),
        }
    }

    pub fn with_defaults(pool: Pool) -> Self {
        Self::new(pool, RateLimiterConfig::default())
    }

    /// Returns Ok(true) if allowed, Ok(false) if rate-limited.
    ///
    /// `long_limit` overrides the configured long-term limit for this key;
    /// callers with per-credential quotas pass the credential's own limit.
    pub async fn check_raw(&self, key: &str, long_limit: Option<i64>) -> Result<bool> {
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get Redis connection")?;

        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_millis() as i64;

        let list_key = format!("{}{}", self.config.key_prefix, key);

        let result: i32 = self
            .script
            .key(list_key)
            .arg(self.config.burst_limit)
            .arg(self.config.burst_window_ms)
            .arg(long_limit.unwrap_or(self.config.long_limit))
            .arg(self.config.long_window_ms)
            .arg(now_ms)
            .arg(self.config.max_list_size)
            .invoke_async(&mut conn)
            .await?;

        Ok(result == 1)
    }

    /// Fail closed: a limiter that cannot reach Redis denies the request.
    /// Quotas exist to protect the backends behind this check, and an
    /// unreachable Redis usually means those backends are already hurting.
    pub async fn check(&self, key: &str, long_limit: Option<i64>) -> bool {
        match self.check_raw(key, long_limit).await {
            Ok(allowed) => allowed,
            Err(e) => {
                print_warning(anyhow!("rate limiter check failed for key {}: {:?}", key, e));
                false
            }
        }
    }
}
