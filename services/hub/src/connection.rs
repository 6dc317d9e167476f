//! One websocket client: connection handle plus its read and write pumps.
//!
//! The handle (outbound queue sender + done token) is what rooms hold; the
//! pumps own the two socket halves. Producers never block on the outbound
//! queue: a full queue means the client is slow or dead and `try_queue`
//! failure is the eviction signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{Instant, interval, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use banter_protocol::SnowflakeId;

use crate::hub::Hub;

/// Outbound queue capacity per client.
pub const CLIENT_BUFFER: usize = 20;
/// Inbound frame size cap.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

pub const PING_INTERVAL: Duration = Duration::from_secs(10);
const PING_PERIOD: Duration = Duration::from_secs(25);
const MISSED_PINGS: u32 = 2;
const WRITE_WAIT: Duration = Duration::from_secs(10);
/// Read deadline: refreshed on every pong, not on data frames.
pub const PONG_WAIT: Duration =
    Duration::from_secs(PING_PERIOD.as_secs() * MISSED_PINGS as u64 + WRITE_WAIT.as_secs());

pub type ConnId = u64;

// ---------------------------------------------------------------------------
// Prepared frames
// ---------------------------------------------------------------------------

/// An outbound payload serialized exactly once.
///
/// Clones share the underlying buffer, so fanning a frame out to N
/// subscribers costs N refcount bumps and N queue pushes.
#[derive(Debug, Clone)]
pub struct PreparedFrame(Message);

impl PreparedFrame {
    pub fn from_json(json: String) -> Self {
        PreparedFrame(Message::Text(Utf8Bytes::from(json)))
    }

    pub fn serialize<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::from_json(serde_json::to_string(value)?))
    }

    pub(crate) fn into_message(self) -> Message {
        self.0
    }

    /// The frame text, for assertions and logging.
    pub fn as_str(&self) -> &str {
        match &self.0 {
            Message::Text(text) => text.as_str(),
            _ => "",
        }
    }
}

// ---------------------------------------------------------------------------
// Connection handle
// ---------------------------------------------------------------------------

/// A connected client as the rest of the hub sees it.
pub struct Connection {
    pub id: ConnId,
    pub user_id: SnowflakeId,
    /// Current room name; empty when unsubscribed. Mutated only by
    /// subscribe workers and unregister.
    room: Mutex<String>,
    frames: mpsc::Sender<PreparedFrame>,
    done: CancellationToken,
    evicted: AtomicBool,
}

impl Connection {
    /// Build a connection handle and the receiver its write pump will drain.
    /// `parent` is the hub shutdown token; closing the hub closes every pump.
    pub fn new(
        id: ConnId,
        user_id: SnowflakeId,
        parent: &CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<PreparedFrame>) {
        let (frames, rx) = mpsc::channel(CLIENT_BUFFER);
        let conn = Arc::new(Connection {
            id,
            user_id,
            room: Mutex::new(String::new()),
            frames,
            done: parent.child_token(),
            evicted: AtomicBool::new(false),
        });
        (conn, rx)
    }

    /// The room this client is subscribed to, if any.
    pub fn room(&self) -> Option<String> {
        let room = self.room.lock().expect("room lock poisoned");
        if room.is_empty() { None } else { Some(room.clone()) }
    }

    pub(crate) fn set_room(&self, name: &str) {
        *self.room.lock().expect("room lock poisoned") = name.to_owned();
    }

    pub(crate) fn clear_room(&self) {
        self.room.lock().expect("room lock poisoned").clear();
    }

    /// Non-blocking enqueue of a prepared frame. `false` means the queue is
    /// full or the pump is gone; the caller must treat the client as dead.
    pub fn try_queue(&self, frame: PreparedFrame) -> bool {
        self.frames.try_send(frame).is_ok()
    }

    /// Idempotent: signals both pumps to exit, which closes the socket.
    pub fn close(&self) {
        self.done.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Mark this connection as removed for slowness. Returns `false` if it
    /// was already marked, so eviction runs exactly once per connection.
    pub(crate) fn mark_evicted(&self) -> bool {
        !self.evicted.swap(true, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("room", &self.room.lock().expect("room lock poisoned"))
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Pumps
// ---------------------------------------------------------------------------

/// Read pump: drains the socket, applies the rate limit, and hands frames
/// to the router. Exits on read error, pong timeout, or shutdown; the
/// caller then unregisters the connection.
pub(crate) async fn read_pump(hub: Arc<Hub>, conn: Arc<Connection>, mut stream: SplitStream<WebSocket>) {
    let mut deadline = Instant::now() + PONG_WAIT;

    loop {
        tokio::select! {
            () = conn.done.cancelled() => break,
            next = timeout_at(deadline, stream.next()) => {
                match next {
                    Err(_) => {
                        debug!(user_id = %conn.user_id, "pong deadline missed, closing");
                        break;
                    }
                    Ok(None) | Ok(Some(Err(_))) => break,
                    Ok(Some(Ok(Message::Pong(_)))) => {
                        deadline = Instant::now() + PONG_WAIT;
                    }
                    Ok(Some(Ok(Message::Text(text)))) => {
                        hub.ingest_frame(&conn, text.as_str()).await;
                    }
                    Ok(Some(Ok(Message::Close(_)))) => break,
                    // Binary frames are not part of the protocol; pings are
                    // answered by the websocket layer.
                    Ok(Some(Ok(_))) => {}
                }
            }
        }
    }
}

/// Write pump: sole writer for the socket. Serves the outbound queue, the
/// ping ticker, and the done signal; any write error terminates it.
pub(crate) async fn write_pump(
    conn: Arc<Connection>,
    mut frames: mpsc::Receiver<PreparedFrame>,
    mut sink: SplitSink<WebSocket, Message>,
) {
    let mut ping = interval(PING_INTERVAL);
    ping.tick().await; // the first tick is immediate

    loop {
        tokio::select! {
            () = conn.done.cancelled() => {
                let frame = CloseFrame { code: close_code::NORMAL, reason: Utf8Bytes::default() };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            }
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(frame.into_message()).await {
                    debug!(user_id = %conn.user_id, error = %e, "websocket write error");
                    break;
                }
            }
            _ = ping.tick() => {
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    warn!(user_id = %conn.user_id, "websocket ping failed");
                    break;
                }
            }
        }
    }

    // Stop the read pump too; close is idempotent.
    conn.close();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> (Arc<Connection>, mpsc::Receiver<PreparedFrame>) {
        Connection::new(1, SnowflakeId(1001), &CancellationToken::new())
    }

    #[test]
    fn try_queue_fails_once_the_buffer_is_full() {
        let (conn, _rx) = test_conn();
        for _ in 0..CLIENT_BUFFER {
            assert!(conn.try_queue(PreparedFrame::from_json("{}".to_owned())));
        }
        assert!(
            !conn.try_queue(PreparedFrame::from_json("{}".to_owned())),
            "push past capacity must fail, not block"
        );
    }

    #[test]
    fn room_field_round_trips_and_clears() {
        let (conn, _rx) = test_conn();
        assert_eq!(conn.room(), None);
        conn.set_room("server:42");
        assert_eq!(conn.room().as_deref(), Some("server:42"));
        conn.clear_room();
        assert_eq!(conn.room(), None);
    }

    #[test]
    fn close_is_idempotent_and_observable() {
        let (conn, _rx) = test_conn();
        assert!(!conn.is_closed());
        conn.close();
        conn.close();
        assert!(conn.is_closed());
    }

    #[test]
    fn eviction_marker_fires_exactly_once() {
        let (conn, _rx) = test_conn();
        assert!(conn.mark_evicted());
        assert!(!conn.mark_evicted());
    }

    #[test]
    fn prepared_frame_clones_share_payload() {
        let frame = PreparedFrame::from_json(r#"{"event":"room.joined"}"#.to_owned());
        let clone = frame.clone();
        assert_eq!(frame.as_str(), clone.as_str());
    }
}
