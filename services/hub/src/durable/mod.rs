//! The durable log seam.
//!
//! The hub treats the log abstractly: a producer that appends keyed,
//! headered records to a topic, and consumers that deliver records in
//! partition order and advance their commit cursor only after the handler
//! succeeds. [`kafka`] is the production implementation; [`memory`] backs
//! the test suite and single-node development.
//!
//! Headers are the canonical timing contract: `trace_id` and `ingest_time`
//! are minted once at the edge and must be forwarded byte-for-byte across
//! every hop.

pub mod kafka;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use banter_protocol::{SnowflakeGenerator, SnowflakeId};

use crate::now_millis;

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// Parsed record headers. All values travel as base-10 strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageMetadata {
    /// Minted once per logical user action; identical on every hop.
    pub trace_id: SnowflakeId,
    pub user_id: SnowflakeId,
    /// When the originating frame entered the system. Never overwritten.
    pub ingest_time_ms: u64,
    /// When the previous producer wrote this record.
    pub publish_time_ms: u64,
}

impl MessageMetadata {
    /// Parse raw header pairs, defaulting absent timestamps to now so a
    /// record with stripped headers still yields sane latency numbers.
    pub fn from_headers<'a, I>(headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a [u8])>,
    {
        let now = now_millis();
        let mut meta = MessageMetadata {
            trace_id: SnowflakeId::default(),
            user_id: SnowflakeId::default(),
            ingest_time_ms: now,
            publish_time_ms: now,
        };
        for (key, value) in headers {
            let Ok(value) = std::str::from_utf8(value) else {
                continue;
            };
            match key {
                "trace_id" => {
                    if let Ok(id) = value.parse() {
                        meta.trace_id = id;
                    }
                }
                "user_id" => {
                    if let Ok(id) = value.parse() {
                        meta.user_id = id;
                    }
                }
                "ingest_time" => {
                    if let Ok(ms) = value.parse() {
                        meta.ingest_time_ms = ms;
                    }
                }
                "publish_time" => {
                    if let Ok(ms) = value.parse() {
                        meta.publish_time_ms = ms;
                    }
                }
                _ => {}
            }
        }
        meta
    }
}

/// What a producer caller knows about a record's provenance.
///
/// `user_id` and a fresh `publish_time` are always stamped; `trace_id` and
/// `ingest_time` are forwarded verbatim when present and minted only for
/// brand-new actions.
#[derive(Debug, Clone, Copy)]
pub struct HeaderSeed {
    pub user_id: SnowflakeId,
    pub trace_id: Option<SnowflakeId>,
    pub ingest_time_ms: Option<u64>,
}

impl HeaderSeed {
    /// Materialize the full header set for one produced record.
    pub fn into_headers(self, ids: &SnowflakeGenerator) -> Vec<(String, String)> {
        let trace_id = self.trace_id.unwrap_or_else(|| ids.generate());
        let ingest_time = self.ingest_time_ms.unwrap_or_else(now_millis);
        vec![
            ("user_id".to_owned(), self.user_id.to_string()),
            ("publish_time".to_owned(), now_millis().to_string()),
            ("trace_id".to_owned(), trace_id.to_string()),
            ("ingest_time".to_owned(), ingest_time.to_string()),
        ]
    }
}

// ---------------------------------------------------------------------------
// Producer and consumer seams
// ---------------------------------------------------------------------------

/// Error from a durable produce.
#[derive(Debug, thiserror::Error)]
pub enum DurableLogError {
    #[error("produce to `{topic}` failed: {reason}")]
    Produce { topic: String, reason: String },
}

/// Error a record handler may return; the consumer will not commit.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("room out-buffer saturated")]
    Overloaded,
}

/// One record delivered to a consumer.
#[derive(Debug, Clone)]
pub struct ConsumedRecord {
    pub topic: String,
    /// Records are keyed (and partitioned) by room name.
    pub key: String,
    pub payload: Vec<u8>,
    pub metadata: MessageMetadata,
}

/// Append-only producer half of the durable log.
#[async_trait]
pub trait DurableLog: Send + Sync {
    async fn produce(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
        seed: HeaderSeed,
    ) -> Result<(), DurableLogError>;
}

/// Consumes records one at a time. Returning an error prevents the commit
/// cursor from advancing past the record.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, record: ConsumedRecord) -> Result<(), HandlerError>;
}

/// A consumer bound to one topic + group, ready to be spawned.
pub trait DurableConsumer: Send {
    fn spawn(self: Box<Self>, shutdown: CancellationToken) -> JoinHandle<()>;
}

// ---------------------------------------------------------------------------
// Consumer manager
// ---------------------------------------------------------------------------

/// Error when consumers fail to drain within the shutdown budget.
#[derive(Debug, thiserror::Error)]
#[error("consumer manager `{0}` drain timed out")]
pub struct DrainTimeout(pub String);

/// Runs a named set of consumers and stops them as a group.
pub struct ConsumerManager {
    name: String,
    pending: Vec<Box<dyn DurableConsumer>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ConsumerManager {
    pub fn new(name: &str) -> Self {
        ConsumerManager {
            name: name.to_owned(),
            pending: Vec::new(),
            tasks: Vec::new(),
        }
    }

    /// Register a consumer; it does not run until [`ConsumerManager::start`].
    pub fn add(&mut self, consumer: Box<dyn DurableConsumer>) {
        self.pending.push(consumer);
    }

    /// Spawn every registered consumer under `shutdown`.
    pub fn start(&mut self, shutdown: &CancellationToken) {
        info!(manager = %self.name, consumers = self.pending.len(), "starting durable consumers");
        for consumer in self.pending.drain(..) {
            self.tasks.push(consumer.spawn(shutdown.clone()));
        }
    }

    /// Hand out the running tasks for a bounded join at shutdown.
    pub fn take_tasks(&mut self) -> (String, Vec<JoinHandle<()>>) {
        (self.name.clone(), std::mem::take(&mut self.tasks))
    }

    /// Wait for the tasks to finish, bounded by `drain`.
    pub async fn join_within(
        (name, tasks): (String, Vec<JoinHandle<()>>),
        drain: Duration,
    ) -> Result<(), DrainTimeout> {
        let join_all = async {
            for task in tasks {
                let _ = task.await;
            }
        };
        tokio::time::timeout(drain, join_all)
            .await
            .map_err(|_| DrainTimeout(name))
    }
}

/// Convenience for handlers held as trait objects.
pub type SharedHandler = Arc<dyn RecordHandler>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_seed_preserves_trace_id_and_ingest_time_verbatim() {
        let ids = SnowflakeGenerator::new(0).expect("node id in range");
        let seed = HeaderSeed {
            user_id: SnowflakeId(1001),
            trace_id: Some(SnowflakeId(424_242)),
            ingest_time_ms: Some(1_700_000_000_123),
        };
        let headers = seed.into_headers(&ids);
        let find = |key: &str| {
            headers
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .expect("header present")
        };
        assert_eq!(find("trace_id"), "424242");
        assert_eq!(find("ingest_time"), "1700000000123");
        assert_eq!(find("user_id"), "1001");
    }

    #[test]
    fn header_seed_mints_missing_trace_id_and_ingest_time() {
        let ids = SnowflakeGenerator::new(0).expect("node id in range");
        let before = now_millis();
        let headers = HeaderSeed {
            user_id: SnowflakeId(1001),
            trace_id: None,
            ingest_time_ms: None,
        }
        .into_headers(&ids);
        let find = |key: &str| {
            headers
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .expect("header present")
        };
        assert!(find("trace_id").parse::<u64>().expect("numeric trace id") > 0);
        assert!(find("ingest_time").parse::<u64>().expect("numeric ingest time") >= before);
    }

    #[test]
    fn metadata_round_trips_through_string_headers() {
        let ids = SnowflakeGenerator::new(3).expect("node id in range");
        let trace = ids.generate();
        let seed = HeaderSeed {
            user_id: SnowflakeId(7),
            trace_id: Some(trace),
            ingest_time_ms: Some(123_456),
        };
        let headers = seed.into_headers(&ids);
        let meta = MessageMetadata::from_headers(
            headers.iter().map(|(k, v)| (k.as_str(), v.as_bytes())),
        );
        assert_eq!(meta.trace_id, trace);
        assert_eq!(meta.user_id, SnowflakeId(7));
        assert_eq!(meta.ingest_time_ms, 123_456);
    }

    #[test]
    fn metadata_defaults_timestamps_when_headers_are_absent() {
        let before = now_millis();
        let meta = MessageMetadata::from_headers(std::iter::empty::<(&str, &[u8])>());
        assert!(meta.ingest_time_ms >= before);
        assert!(meta.trace_id.is_zero());
    }
}
