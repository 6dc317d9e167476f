//! Kafka-backed durable log.
//!
//! The producer trades durability for latency deliberately: leader-only
//! acks, small linger, snappy compression. The fan-out stream can afford
//! that because its sibling persist stream carries the durable copy.

use rdkafka::ClientConfig;
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use banter_protocol::SnowflakeGenerator;

use super::{
    ConsumedRecord, DurableConsumer, DurableLog, DurableLogError, HeaderSeed, MessageMetadata,
    SharedHandler,
};

const PRODUCE_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

/// Producer handle. Partitioning hashes the record key, so one room is one
/// partition and stays ordered across retries.
pub struct KafkaLog {
    producer: FutureProducer,
    ids: SnowflakeGenerator,
}

impl KafkaLog {
    pub fn new(brokers: &str, ids: SnowflakeGenerator) -> Result<Self, rdkafka::error::KafkaError> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("acks", "1")
            .set("batch.num.messages", "100")
            .set("linger.ms", "10")
            .set("compression.type", "snappy")
            .set("message.send.max.retries", "3")
            .set_log_level(RDKafkaLogLevel::Warning)
            .create()?;
        Ok(KafkaLog { producer, ids })
    }
}

#[async_trait]
impl DurableLog for KafkaLog {
    async fn produce(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
        seed: HeaderSeed,
    ) -> Result<(), DurableLogError> {
        let mut headers = OwnedHeaders::new();
        for (name, value) in seed.into_headers(&self.ids) {
            headers = headers.insert(Header {
                key: &name,
                value: Some(value.as_bytes()),
            });
        }
        let record = FutureRecord::to(topic)
            .key(key)
            .payload(&payload)
            .headers(headers);
        self.producer
            .send(record, Timeout::After(PRODUCE_TIMEOUT))
            .await
            .map(|_| ())
            .map_err(|(e, _)| DurableLogError::Produce {
                topic: topic.to_owned(),
                reason: e.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

/// One topic + group consumer. Offsets are committed only after the handler
/// returns success, so an unhandled record is redelivered.
pub struct KafkaConsumer {
    consumer: StreamConsumer,
    topic: String,
    handler: SharedHandler,
}

impl KafkaConsumer {
    pub fn new(
        brokers: &str,
        group: &str,
        topic: &str,
        handler: SharedHandler,
    ) -> Result<Self, rdkafka::error::KafkaError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .set_log_level(RDKafkaLogLevel::Warning)
            .create()?;
        Ok(KafkaConsumer {
            consumer,
            topic: topic.to_owned(),
            handler,
        })
    }

    async fn run(self, shutdown: CancellationToken) {
        if let Err(e) = self.consumer.subscribe(&[&self.topic]) {
            error!(topic = %self.topic, error = %e, "failed to subscribe");
            return;
        }
        info!(topic = %self.topic, "durable consumer joined group");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                received = self.consumer.recv() => {
                    let message = match received {
                        Ok(message) => message,
                        Err(e) => {
                            warn!(topic = %self.topic, error = %e, "consumer read error");
                            continue;
                        }
                    };

                    let metadata = message
                        .headers()
                        .map(|headers| {
                            MessageMetadata::from_headers(headers.iter().map(|h| {
                                (h.key, h.value.unwrap_or_default())
                            }))
                        })
                        .unwrap_or_else(|| {
                            MessageMetadata::from_headers(std::iter::empty::<(&str, &[u8])>())
                        });
                    let record = ConsumedRecord {
                        topic: self.topic.clone(),
                        key: String::from_utf8_lossy(message.key().unwrap_or_default()).into_owned(),
                        payload: message.payload().unwrap_or_default().to_vec(),
                        metadata,
                    };

                    match self.handler.handle(record).await {
                        Ok(()) => {
                            if let Err(e) = self.consumer.commit_message(&message, CommitMode::Async) {
                                error!(topic = %self.topic, error = %e, "offset commit failed");
                            }
                        }
                        Err(e) => {
                            // No commit: the record stays on the partition
                            // and is redelivered.
                            warn!(topic = %self.topic, error = %e, "handler failed, not committing");
                        }
                    }
                }
            }
        }
        info!(topic = %self.topic, "durable consumer stopped");
    }
}

impl DurableConsumer for KafkaConsumer {
    fn spawn(self: Box<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
