//! Shared harness for the hub integration suites: a hub wired entirely to
//! the in-memory seams, plus helpers for fake connections and a real
//! listener.

#![allow(dead_code)]

use std::sync::Arc;

use tokio::sync::mpsc;

use banter_protocol::{EventType, SnowflakeGenerator, SnowflakeId};
use hub::bridge::BroadcastFanout;
use hub::connection::{Connection, PreparedFrame};
use hub::durable::memory::MemoryLog;
use hub::metrics::HubMetrics;
use hub::rate_limit::InProcessRateLimiter;
use hub::stores::memory::{MemoryDirectMessageStore, MemoryMembership, MemoryUserDirectory};
use hub::{AppState, Hub, HubDeps};

pub struct TestHub {
    pub hub: Arc<Hub>,
    pub log: Arc<MemoryLog>,
    pub membership: Arc<MemoryMembership>,
    pub users: Arc<MemoryUserDirectory>,
    pub direct_messages: Arc<MemoryDirectMessageStore>,
    pub metrics: Arc<HubMetrics>,
}

/// Hub on in-memory log, stores, and limiter, with the fan-out consumer
/// attached: the full pipeline, no brokers.
pub fn start_hub(rate_limit_per_minute: u32) -> TestHub {
    let ids = SnowflakeGenerator::new(0).expect("node id in range");
    let log = MemoryLog::new(ids.clone());
    let membership = MemoryMembership::new();
    let users = MemoryUserDirectory::new();
    let direct_messages = MemoryDirectMessageStore::new();
    let metrics = Arc::new(HubMetrics::new());

    let hub = Hub::start(HubDeps {
        producer: log.clone(),
        limiter: InProcessRateLimiter::new(rate_limit_per_minute),
        membership: membership.clone(),
        users: users.clone(),
        direct_messages: direct_messages.clone(),
        ids,
        metrics: metrics.clone(),
        subscribe_workers: 10,
        allow_all_server_members: false,
    });

    let fanout = Arc::new(BroadcastFanout::new(hub.clone()));
    let consumer = log.consumer(EventType::BroadcastChannelMessageAdd.as_str(), fanout);
    hub.attach_consumer(consumer);
    hub.start_consumers();

    TestHub {
        hub,
        log,
        membership,
        users,
        direct_messages,
        metrics,
    }
}

/// A connection handle without a socket. The caller keeps the frame
/// receiver: draining it plays the write pump, not draining it simulates a
/// stalled one.
pub fn fake_connection(
    t: &TestHub,
    user_id: u64,
) -> (Arc<Connection>, mpsc::Receiver<PreparedFrame>) {
    let (conn, rx) = Connection::new(
        t.hub.next_conn_id(),
        SnowflakeId(user_id),
        &t.hub.shutdown_token(),
    );
    assert!(t.hub.register(&conn), "register while running");
    watch_unregister(t, &conn);
    (conn, rx)
}

/// Mimic the socket handler's teardown: when the connection's done signal
/// fires, unregister it.
pub fn watch_unregister(t: &TestHub, conn: &Arc<Connection>) {
    let hub = t.hub.clone();
    let conn = conn.clone();
    tokio::spawn(async move {
        conn.done().cancelled().await;
        hub.unregister(&conn);
    });
}

/// Serve the hub on an ephemeral port; returns the websocket URL.
pub async fn serve(t: &TestHub) -> String {
    let state = AppState {
        hub: t.hub.clone(),
        metrics: t.metrics.clone(),
    };
    let router = hub::build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("test server");
    });
    format!("ws://{addr}/ws")
}

pub fn join_frame(room: &str) -> banter_protocol::SocketFrame {
    banter_protocol::SocketFrame {
        event: EventType::RoomJoin,
        room: room.to_owned(),
        data: None,
    }
}

pub fn data_frame(event: EventType, room: &str, data: &str) -> banter_protocol::SocketFrame {
    banter_protocol::SocketFrame {
        event,
        room: room.to_owned(),
        data: Some(serde_json::value::RawValue::from_string(data.to_owned()).expect("valid json")),
    }
}

/// Drain everything currently queued on a fake connection.
pub fn drain_frames(rx: &mut mpsc::Receiver<PreparedFrame>) -> Vec<String> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame.as_str().to_owned());
    }
    frames
}
