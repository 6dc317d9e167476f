//! Room state: the client set, the bounded out-buffer feeding the room's
//! broadcaster, and the typing coalescer state.
//!
//! Lock order: room-table before per-room locks, never the reverse; the
//! client-set lock is never held across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use serde_json::value::RawValue;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use banter_protocol::EventType;

use crate::connection::{ConnId, Connection};
use crate::typing::TypingState;

/// Out-buffer capacity: requests waiting for the broadcaster.
pub const ROOM_OUT_BUFFER: usize = 100;

// ---------------------------------------------------------------------------
// BroadcastRequest
// ---------------------------------------------------------------------------

/// One event queued for fan-out to a room.
///
/// Serializes as the outbound wire shape `{event, room, data, action}`;
/// `pipeline_start_ms` never leaves the process, it is the zero point for
/// end-to-end latency.
#[derive(Debug)]
pub struct BroadcastRequest {
    pub event: EventType,
    pub room: String,
    pub data: Box<RawValue>,
    pub action: Option<String>,
    pub pipeline_start_ms: Option<u64>,
}

impl Serialize for BroadcastRequest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("BroadcastRequest", 4)?;
        s.serialize_field("event", &self.event)?;
        s.serialize_field("room", &self.room)?;
        s.serialize_field("data", &self.data)?;
        s.serialize_field("action", &self.action)?;
        s.end()
    }
}

// ---------------------------------------------------------------------------
// RoomState
// ---------------------------------------------------------------------------

/// Per-room state. The hub's table owns one of these per live room; its
/// broadcaster task holds the receiving end of the out-buffer.
pub struct RoomState {
    name: String,
    clients: RwLock<HashMap<ConnId, Arc<Connection>>>,
    out_tx: mpsc::Sender<BroadcastRequest>,
    out_rx: Mutex<Option<mpsc::Receiver<BroadcastRequest>>>,
    pub(crate) typing: Mutex<TypingState>,
}

impl RoomState {
    pub(crate) fn new(name: &str) -> Arc<Self> {
        let (out_tx, out_rx) = mpsc::channel(ROOM_OUT_BUFFER);
        Arc::new(RoomState {
            name: name.to_owned(),
            clients: RwLock::new(HashMap::new()),
            out_tx,
            out_rx: Mutex::new(Some(out_rx)),
            typing: Mutex::new(TypingState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().expect("client set poisoned").len()
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.clients.read().expect("client set poisoned").contains_key(&id)
    }

    /// Add a client and point its `room` field here, atomically under the
    /// room lock.
    pub(crate) fn add_client(&self, conn: &Arc<Connection>) {
        let mut clients = self.clients.write().expect("client set poisoned");
        conn.set_room(&self.name);
        clients.insert(conn.id, conn.clone());
    }

    /// Remove a client without closing it (room switches, unregister).
    pub(crate) fn detach(&self, conn: &Connection) {
        self.clients.write().expect("client set poisoned").remove(&conn.id);
    }

    /// Remove slow clients and close them. Called by the broadcaster after
    /// it has released the read lock it scanned under.
    pub(crate) fn evict(&self, slow: &[Arc<Connection>]) {
        if slow.is_empty() {
            return;
        }
        let mut clients = self.clients.write().expect("client set poisoned");
        for conn in slow {
            clients.remove(&conn.id);
            conn.clear_room();
            conn.close();
        }
    }

    /// Snapshot of current members, for fan-out outside the lock.
    pub(crate) fn clients_snapshot(&self) -> Vec<Arc<Connection>> {
        self.clients
            .read()
            .expect("client set poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Non-blocking enqueue to the out-buffer. Full buffer means the room
    /// is overloaded; the caller drops the request.
    pub fn try_enqueue(&self, request: BroadcastRequest) -> Result<(), TrySendError<BroadcastRequest>> {
        self.out_tx.try_send(request)
    }

    /// Enqueue with a bounded wait. Returns `false` on timeout.
    pub async fn enqueue_within(&self, request: BroadcastRequest, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.out_tx.send(request))
            .await
            .map(|sent| sent.is_ok())
            .unwrap_or(false)
    }

    /// Load-shedding probe: out-buffer at or above 90% of capacity.
    pub(crate) fn out_buffer_nearly_full(&self) -> bool {
        let capacity = self.out_tx.max_capacity();
        let queued = capacity - self.out_tx.capacity();
        queued * 10 >= capacity * 9
    }

    /// Hand the out-buffer receiver to the room's broadcaster. Yields
    /// `Some` exactly once.
    pub(crate) fn take_out_rx(&self) -> Option<mpsc::Receiver<BroadcastRequest>> {
        self.out_rx.lock().expect("out_rx lock poisoned").take()
    }
}

impl std::fmt::Debug for RoomState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomState")
            .field("name", &self.name)
            .field("clients", &self.client_count())
            .finish_non_exhaustive()
    }
}
