//! The fan-out side of the durable bridge.
//!
//! A consumer in the `hub-broadcast` group drains the fan-out stream and
//! turns each record into a room broadcast. A record for a room this
//! process has not materialized is dropped on purpose: rooms exist only
//! while someone is subscribed, and the persist stream already holds the
//! durable copy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::value::RawValue;
use tracing::{debug, warn};

use banter_protocol::EventType;

use crate::durable::{ConsumedRecord, HandlerError, RecordHandler};
use crate::hub::Hub;
use crate::room::BroadcastRequest;

/// Consumer group for the fan-out stream; stable per process role.
pub const BROADCAST_GROUP: &str = "hub-broadcast";

/// Bounded wait for the room out-buffer before failing the delivery.
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// Handler wiring `broadcast.channel-message.add` records into room
/// out-buffers.
pub struct BroadcastFanout {
    hub: Arc<Hub>,
}

impl BroadcastFanout {
    pub fn new(hub: Arc<Hub>) -> Self {
        BroadcastFanout { hub }
    }
}

#[async_trait]
impl RecordHandler for BroadcastFanout {
    async fn handle(&self, record: ConsumedRecord) -> Result<(), HandlerError> {
        let Ok(text) = std::str::from_utf8(&record.payload) else {
            return Ok(()); // not JSON, nothing to deliver
        };
        let Ok(data) = serde_json::from_str::<Box<RawValue>>(text) else {
            return Ok(());
        };

        // The record key is the room name.
        let Some(room) = self.hub.room(&record.key) else {
            debug!(room = %record.key, "no live room for record, dropping");
            return Ok(());
        };

        let request = BroadcastRequest {
            event: EventType::BroadcastChannelMessageAdd,
            room: record.key.clone(),
            data,
            action: None,
            pipeline_start_ms: Some(record.metadata.ingest_time_ms),
        };
        if room.enqueue_within(request, ENQUEUE_TIMEOUT).await {
            Ok(())
        } else {
            // Fail the delivery so the offset is not advanced; the record
            // comes back once the room drains.
            warn!(room = %record.key, "room out-buffer saturated, failing delivery");
            Err(HandlerError::Overloaded)
        }
    }
}
