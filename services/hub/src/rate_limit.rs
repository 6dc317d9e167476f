//! Per-user GCRA gate on inbound frames.
//!
//! The production backend is Redis: one key per user, the GCRA arrival
//! time updated atomically in Lua, shared by every hub process. The
//! in-process implementation (`governor`) serves tests and single-node
//! deployments. Both fail open: a broken limiter backend must never
//! silence every client.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota};
use redis::aio::ConnectionManager;
use tracing::debug;

use banter_protocol::{RateLimitNotice, SnowflakeId};

use crate::connection::{Connection, PreparedFrame};
use crate::hub::Hub;

/// Verdict for one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// How long until the next frame would be admitted.
    pub retry_after: Duration,
    /// How long until the bucket is fully drained.
    pub reset: Duration,
    pub limit: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limiter backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(&self, user: SnowflakeId) -> Result<RateDecision, RateLimitError>;
}

impl Hub {
    /// Gate one inbound frame. On denial the structured reply is pushed
    /// non-blocking; if even that queue is full, the client is about to
    /// be evicted anyway.
    pub(crate) async fn apply_rate_limit(&self, conn: &Arc<Connection>) -> bool {
        let decision = match self.limiter.check(conn.user_id).await {
            Ok(decision) => decision,
            Err(e) => {
                // Fail open: a limiter outage must not block all users.
                debug!(error = %e, "rate limiter unavailable, allowing frame");
                return true;
            }
        };
        if decision.allowed {
            return true;
        }

        let notice = RateLimitNotice::new(
            decision.retry_after.as_secs(),
            decision.reset.as_secs(),
            decision.limit,
        );
        if let Ok(frame) = PreparedFrame::serialize(&notice) {
            let _ = conn.try_queue(frame);
        }
        false
    }
}

// ---------------------------------------------------------------------------
// Redis GCRA
// ---------------------------------------------------------------------------

/// GCRA over one Redis key per user.
///
/// KEYS[1] holds the theoretical arrival time in ms. Returns
/// `{allowed, retry_after_ms, reset_ms}`.
const GCRA_SCRIPT: &str = r"
local key = KEYS[1]
local emission_interval = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

local tat = tonumber(redis.call('GET', key) or now)
if tat < now then
    tat = now
end

local new_tat = tat + emission_interval
local allow_at = new_tat - (burst * emission_interval)
if now < allow_at then
    return {0, allow_at - now, tat - now}
end

redis.call('SET', key, new_tat, 'PX', math.ceil(new_tat - now + emission_interval))
return {1, 0, new_tat - now}
";

pub struct RedisRateLimiter {
    conn: ConnectionManager,
    script: redis::Script,
    per_minute: u32,
}

impl RedisRateLimiter {
    pub fn new(conn: ConnectionManager, per_minute: u32) -> Self {
        RedisRateLimiter {
            conn,
            script: redis::Script::new(GCRA_SCRIPT),
            per_minute: per_minute.max(1),
        }
    }

    fn emission_interval_ms(&self) -> u64 {
        (60_000 / u64::from(self.per_minute)).max(1)
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn check(&self, user: SnowflakeId) -> Result<RateDecision, RateLimitError> {
        let mut conn = self.conn.clone();
        let (allowed, retry_after_ms, reset_ms): (i64, i64, i64) = self
            .script
            .key(format!("ratelimit:ws:{user}"))
            .arg(self.emission_interval_ms())
            .arg(self.per_minute)
            .arg(crate::now_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RateLimitError::Backend(e.to_string()))?;
        Ok(RateDecision {
            allowed: allowed == 1,
            retry_after: Duration::from_millis(retry_after_ms.max(0) as u64),
            reset: Duration::from_millis(reset_ms.max(0) as u64),
            limit: self.per_minute,
        })
    }
}

// ---------------------------------------------------------------------------
// In-process GCRA
// ---------------------------------------------------------------------------

/// Keyed GCRA in process memory. State is shared by every handle cloned
/// from the same instance, but not across processes.
pub struct InProcessRateLimiter {
    limiter: DefaultKeyedRateLimiter<u64>,
    clock: DefaultClock,
    per_minute: u32,
}

impl InProcessRateLimiter {
    pub fn new(per_minute: u32) -> Arc<Self> {
        let per_minute = per_minute.max(1);
        let quota = Quota::per_minute(NonZeroU32::new(per_minute).expect("nonzero limit"));
        Arc::new(InProcessRateLimiter {
            limiter: DefaultKeyedRateLimiter::keyed(quota),
            clock: DefaultClock::default(),
            per_minute,
        })
    }
}

#[async_trait]
impl RateLimiter for InProcessRateLimiter {
    async fn check(&self, user: SnowflakeId) -> Result<RateDecision, RateLimitError> {
        match self.limiter.check_key(&user.0) {
            Ok(()) => Ok(RateDecision {
                allowed: true,
                retry_after: Duration::ZERO,
                reset: Duration::ZERO,
                limit: self.per_minute,
            }),
            Err(not_until) => {
                let wait = not_until.wait_time_from(self.clock.now());
                Ok(RateDecision {
                    allowed: false,
                    retry_after: wait,
                    reset: wait,
                    limit: self.per_minute,
                })
            }
        }
    }
}
