//! Read-through Redis cache layer.
//!
//! Negative entries use the `__NULL__` sentinel: "the backing store was
//! asked and the answer is no / not found". That keeps a miss from hammering
//! the store while staying distinguishable from an expired key.
//!
//! Reads of one key are deduplicated through [`Singleflight`], so a burst
//! of clients hitting the same membership entry costs one round-trip, and
//! every read is accounted as a hit or miss on the hub metrics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::warn;

use banter_protocol::{SnowflakeId, UserProfile};

use super::singleflight::Singleflight;
use super::{MembershipStore, StoreError, UserDirectory};
use crate::metrics::HubMetrics;

/// Sentinel for "known not to exist".
pub const NULL_VALUE: &str = "__NULL__";

const MEMBERSHIP_TTL: Duration = Duration::from_secs(600);
/// Cap on one MGET, matching the directory's batch contract.
const MAX_USER_BATCH: usize = 100;

// ---------------------------------------------------------------------------
// Cache manager
// ---------------------------------------------------------------------------

/// Thin wrapper over the shared connection with the `__NULL__` convention.
#[derive(Clone)]
pub struct CacheManager {
    conn: ConnectionManager,
    metrics: Arc<HubMetrics>,
    flights: Arc<Singleflight<Result<CacheRead, StoreError>>>,
}

/// A cache read either misses, hits a value, or hits a negative entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheRead {
    Miss,
    Null,
    Value(String),
}

impl CacheManager {
    pub fn new(conn: ConnectionManager, metrics: Arc<HubMetrics>) -> Self {
        CacheManager {
            conn,
            metrics,
            flights: Arc::new(Singleflight::new()),
        }
    }

    /// Read one key. Concurrent reads of the same key share a single
    /// round-trip; hit/miss accounting covers every caller in the group.
    pub async fn get(&self, key: &str) -> Result<CacheRead, StoreError> {
        let started = Instant::now();
        let result = self
            .flights
            .run(key, fetch_one(self.conn.clone(), key.to_owned()))
            .await;

        let family = key_family(key);
        self.metrics
            .cache_latency
            .with_label_values(&[family])
            .observe(started.elapsed().as_secs_f64());
        match &result {
            Ok(CacheRead::Miss) | Err(_) => {
                self.metrics.cache_misses.with_label_values(&[family]).inc();
            }
            Ok(_) => self.metrics.cache_hits.with_label_values(&[family]).inc(),
        }
        result
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs())
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    pub async fn set_null(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.set(key, NULL_VALUE, ttl).await
    }

    pub async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let started = Instant::now();
        let mut conn = self.conn.clone();
        let result: Result<Vec<Option<String>>, StoreError> = conn
            .mget(keys)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()));

        let family = key_family(&keys[0]);
        self.metrics
            .cache_latency
            .with_label_values(&[family])
            .observe(started.elapsed().as_secs_f64());
        match &result {
            Ok(values) => {
                let hits = values.iter().filter(|value| value.is_some()).count() as u64;
                self.metrics.cache_hits.with_label_values(&[family]).inc_by(hits);
                self.metrics
                    .cache_misses
                    .with_label_values(&[family])
                    .inc_by(keys.len() as u64 - hits);
            }
            Err(_) => {
                self.metrics
                    .cache_misses
                    .with_label_values(&[family])
                    .inc_by(keys.len() as u64);
            }
        }
        result
    }
}

async fn fetch_one(mut conn: ConnectionManager, key: String) -> Result<CacheRead, StoreError> {
    let value: Option<String> = conn
        .get(&key)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    Ok(match value {
        None => CacheRead::Miss,
        Some(value) if value == NULL_VALUE => CacheRead::Null,
        Some(value) => CacheRead::Value(value),
    })
}

/// Metric label: the first two `:`-separated segments of a cache key
/// ("membership:server", "user:info"), keeping label cardinality bounded.
fn key_family(key: &str) -> &str {
    match key.match_indices(':').nth(1) {
        Some((idx, _)) => &key[..idx],
        None => key,
    }
}

// ---------------------------------------------------------------------------
// Cached membership
// ---------------------------------------------------------------------------

/// Read-through membership cache over an abstract backing store.
pub struct CachedMembership<S> {
    cache: CacheManager,
    inner: Arc<S>,
}

impl<S> CachedMembership<S> {
    pub fn new(cache: CacheManager, inner: Arc<S>) -> Self {
        CachedMembership { cache, inner }
    }

    fn server_key(user: SnowflakeId, server: SnowflakeId) -> String {
        format!("membership:server:{server}:{user}")
    }

    fn direct_key(user: SnowflakeId, conversation: SnowflakeId) -> String {
        format!("membership:direct:{conversation}:{user}")
    }

    /// Resolve through the cache; `fetch` is consulted on a miss and the
    /// answer is written back, negatives as `__NULL__`.
    async fn read_through<F>(&self, key: String, fetch: F) -> Result<bool, StoreError>
    where
        F: std::future::Future<Output = Result<bool, StoreError>>,
    {
        match self.cache.get(&key).await {
            Ok(CacheRead::Value(_)) => return Ok(true),
            Ok(CacheRead::Null) => return Ok(false),
            Ok(CacheRead::Miss) => {}
            Err(e) => {
                // A cache outage degrades to store reads; the store result
                // still decides.
                warn!(error = %e, "membership cache read failed");
            }
        }

        let member = fetch.await?;
        let write = if member {
            self.cache.set(&key, "1", MEMBERSHIP_TTL).await
        } else {
            self.cache.set_null(&key, MEMBERSHIP_TTL).await
        };
        if let Err(e) = write {
            warn!(error = %e, "membership cache write failed");
        }
        Ok(member)
    }
}

#[async_trait]
impl<S: MembershipStore> MembershipStore for CachedMembership<S> {
    async fn is_server_member(
        &self,
        user: SnowflakeId,
        server: SnowflakeId,
    ) -> Result<bool, StoreError> {
        self.read_through(
            Self::server_key(user, server),
            self.inner.is_server_member(user, server),
        )
        .await
    }

    async fn is_conversation_participant(
        &self,
        user: SnowflakeId,
        conversation: SnowflakeId,
    ) -> Result<bool, StoreError> {
        self.read_through(
            Self::direct_key(user, conversation),
            self.inner.is_conversation_participant(user, conversation),
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// Cached user directory
// ---------------------------------------------------------------------------

/// Cache-only user directory: profiles are written by the account service;
/// the hub just reads `user:info:<id>` entries in bulk.
pub struct CachedUserDirectory {
    cache: CacheManager,
}

impl CachedUserDirectory {
    pub fn new(cache: CacheManager) -> Self {
        CachedUserDirectory { cache }
    }
}

#[async_trait]
impl UserDirectory for CachedUserDirectory {
    async fn users_batch(
        &self,
        ids: &[SnowflakeId],
    ) -> Result<HashMap<SnowflakeId, UserProfile>, StoreError> {
        if ids.len() > MAX_USER_BATCH {
            return Err(StoreError::Backend(format!(
                "user batch larger than {MAX_USER_BATCH}"
            )));
        }
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| format!("user:info:{id}")).collect();
        let values = self.cache.mget(&keys).await?;

        let mut profiles = HashMap::with_capacity(ids.len());
        for value in values.into_iter().flatten() {
            if value == NULL_VALUE {
                continue;
            }
            match serde_json::from_str::<UserProfile>(&value) {
                Ok(profile) => {
                    profiles.insert(profile.id, profile);
                }
                Err(e) => warn!(error = %e, "unparseable cached user profile"),
            }
        }
        Ok(profiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_family_truncates_to_two_segments() {
        assert_eq!(key_family("membership:server:42:1001"), "membership:server");
        assert_eq!(key_family("membership:direct:7:1001"), "membership:direct");
        assert_eq!(key_family("user:info:175928847299117063"), "user:info");
        assert_eq!(key_family("one:two"), "one:two");
        assert_eq!(key_family("plain"), "plain");
    }
}
