//! Inbound frame routing.
//!
//! Every text frame a read pump accepts lands here with the timestamp it
//! entered the system. Malformed frames are dropped without ceremony; a
//! client can never crash its pump.

use std::sync::Arc;

use serde_json::value::RawValue;
use tracing::{debug, warn};

use banter_protocol::{DirectMessage, EventType, SnowflakeId, SocketFrame};

use crate::connection::Connection;
use crate::durable::HeaderSeed;
use crate::hub::Hub;
use crate::room::BroadcastRequest;
use crate::subscribe::RoomRequest;

impl Hub {
    /// Everything a read pump does with one text frame: the rate-limit gate
    /// first, then routing. The pipeline-start timestamp is captured here,
    /// on entry.
    pub async fn ingest_frame(self: &Arc<Self>, conn: &Arc<Connection>, raw: &str) {
        let pipeline_start_ms = crate::now_millis();
        if self.apply_rate_limit(conn).await {
            self.handle_incoming(conn, raw, pipeline_start_ms).await;
        }
    }

    /// Parse and dispatch one inbound frame. `pipeline_start_ms` is the
    /// instant the read pump saw the frame; it rides along as the zero
    /// point for end-to-end latency.
    pub async fn handle_incoming(self: &Arc<Self>, conn: &Arc<Connection>, raw: &str, pipeline_start_ms: u64) {
        let Ok(frame) = serde_json::from_str::<SocketFrame>(raw) else {
            return;
        };
        if frame.room.is_empty() {
            warn!(user_id = %conn.user_id, "missing room in frame");
            return;
        }

        match frame.event {
            EventType::RoomJoin => {
                self.enqueue_subscribe(RoomRequest {
                    conn: conn.clone(),
                    name: frame.room,
                })
                .await;
            }
            EventType::RoomTyping => {
                // Typing for a room that was never materialized has no
                // audience; drop it.
                if let Some(room) = self.room(&frame.room) {
                    self.add_typer(&room, conn.user_id);
                }
            }
            EventType::ChannelMessageAdd => {
                self.handle_channel_message_add(conn, &frame, pipeline_start_ms).await;
            }
            EventType::DirectMessageAdd => {
                self.handle_direct_message_add(conn, &frame, pipeline_start_ms).await;
            }
            EventType::RoomLeave => {
                // Reserved: leaving is implicit in joining another room or
                // disconnecting.
                debug!(user_id = %conn.user_id, room = %frame.room, "room.leave is reserved, ignoring");
            }
            EventType::ChannelMessageUpdate
            | EventType::ChannelMessageDelete
            | EventType::DirectMessageUpdate
            | EventType::DirectMessageDelete => {
                warn!(user_id = %conn.user_id, event = %frame.event, "event is enumerated but not routed");
            }
            EventType::RoomJoined | EventType::BroadcastChannelMessageAdd | EventType::Unknown => {
                warn!(user_id = %conn.user_id, event = %frame.event, "unexpected event from client");
            }
        }
    }

    /// Channel messages cross the durable log twice: the raw payload to the
    /// persist stream and the id-enriched payload to the fan-out stream,
    /// with identical `trace_id` and `ingest_time` headers on both.
    async fn handle_channel_message_add(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        frame: &SocketFrame,
        pipeline_start_ms: u64,
    ) {
        let Some(data) = validate_room_payload(conn, frame) else {
            return;
        };
        let message_id = self.ids.generate();
        let Some(enriched) = enrich_payload(data, message_id, conn.user_id) else {
            warn!(user_id = %conn.user_id, "channel message payload is not a JSON object");
            return;
        };

        let seed = HeaderSeed {
            user_id: conn.user_id,
            trace_id: Some(message_id),
            ingest_time_ms: Some(pipeline_start_ms),
        };
        let persist = self.producer.produce(
            EventType::ChannelMessageAdd.as_str(),
            &frame.room,
            data.get().as_bytes().to_vec(),
            seed,
        );
        if let Err(e) = persist.await {
            warn!(user_id = %conn.user_id, error = %e, "durable publish failed");
            return;
        }
        let fanout = self.producer.produce(
            EventType::BroadcastChannelMessageAdd.as_str(),
            &frame.room,
            enriched.into_bytes(),
            seed,
        );
        if let Err(e) = fanout.await {
            warn!(user_id = %conn.user_id, error = %e, "fan-out publish failed");
        }
    }

    /// Direct messages skip the log: persist inline, then enqueue straight
    /// into the room's out-buffer. Persist failure means no broadcast.
    async fn handle_direct_message_add(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        frame: &SocketFrame,
        pipeline_start_ms: u64,
    ) {
        let Some(data) = validate_room_payload(conn, frame) else {
            return;
        };
        let Ok(mut message) = serde_json::from_str::<DirectMessage>(data.get()) else {
            debug!(user_id = %conn.user_id, "malformed direct message payload");
            return;
        };
        message.id = self.ids.generate();
        message.user_id = conn.user_id;

        if let Err(e) = self.direct_messages.create(&message).await {
            warn!(user_id = %conn.user_id, error = %e, "direct message persist failed, not broadcasting");
            return;
        }

        let Some(room) = self.room(&frame.room) else {
            return;
        };
        let payload = match serde_json::to_string(&message).map(RawValue::from_string) {
            Ok(Ok(payload)) => payload,
            _ => return,
        };
        let request = BroadcastRequest {
            event: EventType::DirectMessageAdd,
            room: frame.room.clone(),
            data: payload,
            action: None,
            pipeline_start_ms: Some(pipeline_start_ms),
        };
        if room.try_enqueue(request).is_err() {
            warn!(room = %frame.room, "room out-buffer full, dropping direct message");
        }
    }
}

/// Shared validation for message-bearing frames: data must be present and
/// the client must currently be subscribed to the room it is posting to.
fn validate_room_payload<'f>(conn: &Connection, frame: &'f SocketFrame) -> Option<&'f RawValue> {
    let data = frame.data.as_deref()?;
    if conn.room().as_deref() != Some(frame.room.as_str()) {
        warn!(user_id = %conn.user_id, room = %frame.room, "message for a room the client is not in");
        return None;
    }
    Some(data)
}

/// Insert `id` and `user_id` into the payload object, returning the
/// re-serialized payload. `None` if the payload is not an object.
fn enrich_payload(data: &RawValue, message_id: SnowflakeId, user_id: SnowflakeId) -> Option<String> {
    let mut object: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(data.get()).ok()?;
    object.insert("id".to_owned(), serde_json::Value::String(message_id.to_string()));
    object.insert("user_id".to_owned(), serde_json::Value::String(user_id.to_string()));
    serde_json::to_string(&object).ok()
}
