//! In-memory durable log.
//!
//! Backs the integration tests and single-node development: same produce
//! and consume semantics as the Kafka implementation (keyed records,
//! per-topic order, redelivery until the handler succeeds), minus the
//! brokers. Produced records are retained so tests can assert on them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use banter_protocol::SnowflakeGenerator;

use super::{
    ConsumedRecord, DurableConsumer, DurableLog, DurableLogError, HeaderSeed, MessageMetadata,
    SharedHandler,
};

const REDELIVERY_BACKOFF: Duration = Duration::from_millis(100);

/// A record as stored in a topic.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl StoredRecord {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Default)]
struct TopicState {
    records: Vec<StoredRecord>,
    subscribers: Vec<mpsc::UnboundedSender<ConsumedRecord>>,
}

/// The in-memory log. Clone the `Arc` freely; all handles see one store.
pub struct MemoryLog {
    topics: Mutex<HashMap<String, TopicState>>,
    ids: SnowflakeGenerator,
}

impl MemoryLog {
    pub fn new(ids: SnowflakeGenerator) -> Arc<Self> {
        Arc::new(MemoryLog {
            topics: Mutex::new(HashMap::new()),
            ids,
        })
    }

    /// Snapshot of everything produced to `topic`, in order.
    pub fn records(&self, topic: &str) -> Vec<StoredRecord> {
        self.topics
            .lock()
            .expect("topic table poisoned")
            .get(topic)
            .map(|state| state.records.clone())
            .unwrap_or_default()
    }

    /// Build a consumer for `topic`. The group id only names the consumer;
    /// the in-memory log delivers every record to every subscriber.
    pub fn consumer(self: &Arc<Self>, topic: &str, handler: SharedHandler) -> Box<MemoryConsumer> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .lock()
            .expect("topic table poisoned")
            .entry(topic.to_owned())
            .or_default()
            .subscribers
            .push(tx);
        Box::new(MemoryConsumer { rx, handler })
    }
}

#[async_trait]
impl DurableLog for MemoryLog {
    async fn produce(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
        seed: HeaderSeed,
    ) -> Result<(), DurableLogError> {
        let headers = seed.into_headers(&self.ids);
        let metadata = MessageMetadata::from_headers(
            headers.iter().map(|(k, v)| (k.as_str(), v.as_bytes())),
        );
        let record = StoredRecord {
            key: key.to_owned(),
            payload: payload.clone(),
            headers,
        };

        let mut topics = self.topics.lock().expect("topic table poisoned");
        let state = topics.entry(topic.to_owned()).or_default();
        state.records.push(record);
        state.subscribers.retain(|subscriber| {
            subscriber
                .send(ConsumedRecord {
                    topic: topic.to_owned(),
                    key: key.to_owned(),
                    payload: payload.clone(),
                    metadata,
                })
                .is_ok()
        });
        Ok(())
    }
}

/// Consumer half: delivers records one at a time and retries a failed
/// handler with backoff instead of advancing past the record.
pub struct MemoryConsumer {
    rx: mpsc::UnboundedReceiver<ConsumedRecord>,
    handler: SharedHandler,
}

impl MemoryConsumer {
    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let record = tokio::select! {
                () = shutdown.cancelled() => break,
                record = self.rx.recv() => record,
            };
            let Some(record) = record else { break };

            loop {
                match self.handler.handle(record.clone()).await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(topic = %record.topic, error = %e, "handler failed, redelivering");
                        tokio::select! {
                            () = shutdown.cancelled() => return,
                            () = tokio::time::sleep(REDELIVERY_BACKOFF) => {}
                        }
                    }
                }
            }
        }
    }
}

impl DurableConsumer for MemoryConsumer {
    fn spawn(self: Box<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
