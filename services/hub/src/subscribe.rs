//! Room subscription: a bounded queue drained by a small worker pool.
//!
//! Authorizing a join may touch the cache or the backing store, which is
//! too slow for the read pump. The router enqueues with a bounded wait and
//! the workers do the rest: validate the name, check membership, switch
//! rooms, confirm. Membership is checked before the client leaves its old
//! room, so a denied join leaves it exactly where it was.

use std::sync::Arc;
use std::time::Duration;

use serde_json::value::RawValue;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use banter_protocol::{EventType, RoomKind, RoomName, SnowflakeId};

use crate::connection::{Connection, PreparedFrame};
use crate::hub::Hub;
use crate::room::BroadcastRequest;

pub const SUBSCRIBE_QUEUE: usize = 10;
pub const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(3);

/// A pending room join.
pub(crate) struct RoomRequest {
    pub conn: Arc<Connection>,
    pub name: String,
}

/// Sender half of the subscribe queue; the receiver is shared by the
/// worker pool.
pub(crate) struct SubscribePool {
    tx: mpsc::Sender<RoomRequest>,
}

pub(crate) type SharedRequests = Arc<Mutex<mpsc::Receiver<RoomRequest>>>;

impl SubscribePool {
    pub(crate) fn new() -> (Self, SharedRequests) {
        let (tx, rx) = mpsc::channel(SUBSCRIBE_QUEUE);
        (SubscribePool { tx }, Arc::new(Mutex::new(rx)))
    }
}

impl Hub {
    pub(crate) fn spawn_subscribe_workers(self: &Arc<Self>, workers: usize, rx: &SharedRequests) {
        for _ in 0..workers.max(1) {
            let hub = self.clone();
            let rx = rx.clone();
            let shutdown = self.shutdown_token();
            tokio::spawn(async move {
                loop {
                    let request = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            () = shutdown.cancelled() => return,
                            request = rx.recv() => request,
                        }
                    };
                    let Some(request) = request else { return };
                    hub.metrics.subscribe_queue_depth.dec();
                    hub.subscribe_room(request).await;
                }
            });
        }
    }

    /// Hand a join request to the pool, waiting at most
    /// [`SUBSCRIBE_TIMEOUT`]. A timeout signals the client done and drops
    /// the request: a backed-up pool must shed load, not stall read pumps.
    pub(crate) async fn enqueue_subscribe(&self, request: RoomRequest) {
        let conn = request.conn.clone();
        self.metrics.subscribe_queue_depth.inc();
        match tokio::time::timeout(SUBSCRIBE_TIMEOUT, self.subscribe.tx.send(request)).await {
            Ok(Ok(())) => {}
            _ => {
                self.metrics.subscribe_queue_depth.dec();
                self.metrics.subscribe_timeouts.inc();
                warn!(user_id = %conn.user_id, "subscribe queue full, dropping join and closing client");
                conn.close();
            }
        }
    }

    pub(crate) async fn subscribe_room(self: &Arc<Self>, request: RoomRequest) {
        let conn = request.conn;
        let name = request.name;

        let parsed: RoomName = match name.parse() {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(room = %name, error = %e, "rejecting invalid room name");
                return;
            }
        };

        let old = conn.room();
        if old.as_deref() == Some(name.as_str()) {
            return; // already in the target room
        }

        let allowed = match parsed.kind {
            RoomKind::Server => self.can_enter_server_room(conn.user_id, parsed.id).await,
            RoomKind::Direct => self.can_enter_direct_room(conn.user_id, parsed.id).await,
        };
        if !allowed {
            debug!(user_id = %conn.user_id, room = %name, "join refused");
            return;
        }

        // Switch rooms: remove-from-old then add-to-new, so the client is
        // never in two rooms and its `room` field always matches a table key.
        if let Some(old_name) = old {
            if let Some(old_room) = self.room(&old_name) {
                old_room.detach(&conn);
            }
            conn.clear_room();
        }

        let room = self.build_room_broadcaster(&name);
        room.add_client(&conn);
        send_join_confirmation(&conn, &name);
    }

    async fn can_enter_server_room(&self, user: SnowflakeId, server: SnowflakeId) -> bool {
        if self.allow_all_server_members {
            return true;
        }
        match self.membership.is_server_member(user, server).await {
            Ok(member) => member,
            Err(e) => {
                // Deny on error: membership must not leak across failures.
                warn!(user_id = %user, server_id = %server, error = %e, "membership check failed");
                false
            }
        }
    }

    async fn can_enter_direct_room(&self, user: SnowflakeId, conversation: SnowflakeId) -> bool {
        match self.membership.is_conversation_participant(user, conversation).await {
            Ok(participant) => participant,
            Err(e) => {
                warn!(user_id = %user, conversation_id = %conversation, error = %e, "participant check failed");
                false
            }
        }
    }
}

/// Push the `room.joined` acknowledgement onto the client's queue. A full
/// queue is not an error here; the broadcaster will evict the client soon
/// enough.
fn send_join_confirmation(conn: &Arc<Connection>, room: &str) {
    let data = RawValue::from_string(
        r#"{"success": true, "message": "Successfully joined room"}"#.to_owned(),
    )
    .expect("static json");
    let confirmation = BroadcastRequest {
        event: EventType::RoomJoined,
        room: room.to_owned(),
        data,
        action: None,
        pipeline_start_ms: None,
    };
    match PreparedFrame::serialize(&confirmation) {
        Ok(frame) => {
            let _ = conn.try_queue(frame);
        }
        Err(e) => warn!(error = %e, "failed to serialize join confirmation"),
    }
}
