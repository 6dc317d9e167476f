//! Hub lifecycle and load-behavior scenarios, driven on fake connections
//! with a paused clock so the reaper, coalescer, and batch windows run in
//! virtual time.

mod common;

use std::time::Duration;

use banter_protocol::{BroadcastFrame, EventType, SnowflakeId, TypingPayload, UserProfile};
use common::{data_frame, drain_frames, fake_connection, join_frame, start_hub};
use hub::now_millis;

/// Let spawned workers and dispatcher tasks run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

async fn join(t: &common::TestHub, conn: &std::sync::Arc<hub::connection::Connection>, room: &str) {
    let frame = serde_json::to_string(&join_frame(room)).expect("serialize join");
    t.hub.handle_incoming(conn, &frame, now_millis()).await;
    settle().await;
}

#[tokio::test(start_paused = true)]
async fn register_and_unregister_move_the_connection_gauge() {
    let t = start_hub(1000);
    let (conn, _rx) = fake_connection(&t, 1001);
    settle().await;
    assert_eq!(t.hub.total_clients(), 1);
    assert!(t.metrics.render().contains("hub_active_connections 1"));

    conn.close();
    settle().await;
    assert_eq!(t.hub.total_clients(), 0);
    assert!(t.metrics.render().contains("hub_active_connections 0"));
}

#[tokio::test(start_paused = true)]
async fn join_places_the_client_in_a_live_room() {
    let t = start_hub(1000);
    t.membership.grant_server_member(SnowflakeId(42), SnowflakeId(1001));
    let (conn, mut rx) = fake_connection(&t, 1001);

    join(&t, &conn, "server:42").await;

    // The room field always names a key in the hub table.
    let room_name = conn.room().expect("client is in a room");
    let room = t.hub.room(&room_name).expect("room exists in the table");
    assert!(room.contains(conn.id));

    let frames = drain_frames(&mut rx);
    assert_eq!(frames.len(), 1, "exactly one joined acknowledgement");
    let ack: BroadcastFrame = serde_json::from_str(&frames[0]).expect("single-object frame");
    assert_eq!(ack.event, EventType::RoomJoined);
    assert_eq!(ack.room, "server:42");
}

#[tokio::test(start_paused = true)]
async fn denied_join_leaves_the_client_in_its_previous_room() {
    let t = start_hub(1000);
    t.membership.grant_server_member(SnowflakeId(42), SnowflakeId(1001));
    let (conn, mut rx) = fake_connection(&t, 1001);

    join(&t, &conn, "server:42").await;
    drain_frames(&mut rx);

    // No membership for server 777.
    join(&t, &conn, "server:777").await;

    assert_eq!(conn.room().as_deref(), Some("server:42"), "client stays put");
    assert!(t.hub.room("server:777").is_none() || t.hub.room("server:777").expect("room").client_count() == 0);
    assert!(drain_frames(&mut rx).is_empty(), "no joined ack, no error frame");
}

#[tokio::test(start_paused = true)]
async fn switching_rooms_is_atomic_remove_then_add() {
    let t = start_hub(1000);
    t.membership.grant_server_member(SnowflakeId(42), SnowflakeId(1001));
    t.membership.set_conversation(SnowflakeId(7), SnowflakeId(1001), SnowflakeId(1002));
    let (conn, mut rx) = fake_connection(&t, 1001);

    join(&t, &conn, "server:42").await;
    join(&t, &conn, "direct:7").await;

    assert_eq!(conn.room().as_deref(), Some("direct:7"));
    let old = t.hub.room("server:42").expect("old room still live until reaped");
    assert!(!old.contains(conn.id), "removed from the old room");
    let new = t.hub.room("direct:7").expect("new room live");
    assert!(new.contains(conn.id));
    assert_eq!(drain_frames(&mut rx).len(), 2, "one ack per successful join");
}

#[tokio::test(start_paused = true)]
async fn invalid_room_names_are_rejected_by_the_subscribe_worker() {
    let t = start_hub(1000);
    let (conn, mut rx) = fake_connection(&t, 1001);

    for room in ["server42", "lobby:42", "server:zero", "server:0"] {
        join(&t, &conn, room).await;
    }

    assert_eq!(conn.room(), None);
    assert!(drain_frames(&mut rx).is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_subscriber_is_evicted_on_the_first_failed_push() {
    let t = start_hub(1000);
    t.membership.grant_server_member(SnowflakeId(42), SnowflakeId(1001));
    let (conn, rx) = fake_connection(&t, 1001);
    join(&t, &conn, "server:42").await;
    settle().await;
    assert_eq!(t.hub.total_clients(), 1);

    // The write pump is stalled: rx is held but never drained. The joined
    // ack already occupies one slot; each flush below adds one frame.
    let room = t.hub.room("server:42").expect("room live");
    for n in 0..25 {
        room.try_enqueue(hub::room::BroadcastRequest {
            event: EventType::ChannelMessageAdd,
            room: "server:42".to_owned(),
            data: serde_json::value::RawValue::from_string(format!(r#"{{"n":{n}}}"#))
                .expect("valid json"),
            action: None,
            pipeline_start_ms: None,
        })
        .expect("out-buffer has space");
        // Let the batch window close so every request flushes alone.
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    settle().await;
    assert!(conn.is_closed(), "first failed push closes the connection");
    assert!(!room.contains(conn.id), "evicted from the room");
    assert_eq!(t.hub.total_clients(), 0, "gauge decremented after eviction");
    drop(rx);
}

#[tokio::test(start_paused = true)]
async fn out_buffer_order_is_preserved_for_a_single_producer() {
    let t = start_hub(1000);
    t.membership.grant_server_member(SnowflakeId(42), SnowflakeId(1001));
    let (conn, mut rx) = fake_connection(&t, 1001);
    join(&t, &conn, "server:42").await;
    drain_frames(&mut rx);

    let room = t.hub.room("server:42").expect("room live");
    for n in 0..5 {
        room.try_enqueue(hub::room::BroadcastRequest {
            event: EventType::ChannelMessageAdd,
            room: "server:42".to_owned(),
            data: serde_json::value::RawValue::from_string(format!(r#"{{"n":{n}}}"#))
                .expect("valid json"),
            action: None,
            pipeline_start_ms: None,
        })
        .expect("out-buffer has space");
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let frames = drain_frames(&mut rx);
    assert_eq!(frames.len(), 1, "five queued requests coalesce into one batch");
    let batch: Vec<BroadcastFrame> = serde_json::from_str(&frames[0]).expect("batch array");
    assert_eq!(batch.len(), 5);
    for (n, frame) in batch.iter().enumerate() {
        let data: serde_json::Value =
            serde_json::from_str(frame.data.as_ref().expect("payload").get()).expect("valid json");
        assert_eq!(data["n"], n as u64, "batch preserves enqueue order");
    }
}

#[tokio::test(start_paused = true)]
async fn idle_room_is_reaped_after_the_grace_period() {
    let t = start_hub(1000);
    t.membership.set_conversation(SnowflakeId(7), SnowflakeId(1001), SnowflakeId(1002));
    let (conn, _rx) = fake_connection(&t, 1001);
    join(&t, &conn, "direct:7").await;
    assert!(t.hub.room("direct:7").is_some());

    // Disconnect; the room is now empty but still within its grace period.
    conn.close();
    settle().await;
    tokio::time::sleep(Duration::from_secs(100)).await;
    assert!(t.hub.room("direct:7").is_some(), "grace period not elapsed yet");

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(t.hub.room("direct:7").is_none(), "reaper removed the empty room");
    assert!(t.metrics.render().contains("hub_active_rooms 0"));
}

#[tokio::test(start_paused = true)]
async fn occupied_room_survives_the_reaper() {
    let t = start_hub(1000);
    t.membership.grant_server_member(SnowflakeId(42), SnowflakeId(1001));
    let (conn, _rx) = fake_connection(&t, 1001);
    join(&t, &conn, "server:42").await;

    tokio::time::sleep(Duration::from_secs(400)).await;
    assert!(t.hub.room("server:42").is_some(), "room with a client is never reaped");
    assert!(conn.room().is_some());
}

#[tokio::test(start_paused = true)]
async fn typing_events_coalesce_into_a_single_broadcast() {
    let t = start_hub(100_000);
    for user in 1..=10u64 {
        t.membership.grant_server_member(SnowflakeId(42), SnowflakeId(user));
    }
    t.users.insert(UserProfile {
        id: SnowflakeId(1),
        name: "ada".to_owned(),
    });

    let (alpha, mut alpha_rx) = fake_connection(&t, 1);
    join(&t, &alpha, "server:42").await;
    drain_frames(&mut alpha_rx);

    // Ten distinct users type within 200 ms.
    for user in 1..=10u64 {
        let (conn, _rx) = fake_connection(&t, user);
        let frame =
            serde_json::to_string(&data_frame(EventType::RoomTyping, "server:42", "{}")).expect("serialize");
        t.hub.handle_incoming(&conn, &frame, now_millis()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Flush timer (500 ms) plus the batch window.
    tokio::time::sleep(Duration::from_millis(700)).await;

    let frames = drain_frames(&mut alpha_rx);
    assert_eq!(frames.len(), 1, "exactly one coalesced typing broadcast");
    let batch: Vec<BroadcastFrame> = serde_json::from_str(&frames[0]).expect("batch array");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].event, EventType::RoomTyping);

    let payload: TypingPayload =
        serde_json::from_str(batch[0].data.as_ref().expect("payload").get()).expect("typing payload");
    assert_eq!(payload.total, 10);
    assert!(payload.users.len() <= 4, "at most four typers are named");
    let ada = payload.users.iter().find(|typer| typer.id == SnowflakeId(1));
    assert_eq!(ada.expect("first typer tracked").name, "ada");
}

#[tokio::test(start_paused = true)]
async fn rate_limited_frames_are_answered_and_not_forwarded() {
    let t = start_hub(60);
    t.membership.grant_server_member(SnowflakeId(42), SnowflakeId(1001));
    let (conn, mut rx) = fake_connection(&t, 1001);
    join(&t, &conn, "server:42").await;
    drain_frames(&mut rx);

    let message =
        serde_json::to_string(&data_frame(EventType::ChannelMessageAdd, "server:42", r#"{"content":"hi"}"#))
            .expect("serialize");
    let mut rate_limit_replies = 0;
    for _ in 0..120 {
        t.hub.ingest_frame(&conn, &message).await;
        for frame in drain_frames(&mut rx) {
            if frame.contains(r#""event":"rate_limit""#) {
                rate_limit_replies += 1;
                let reply: banter_protocol::RateLimitNotice =
                    serde_json::from_str(&frame).expect("structured rate limit reply");
                assert_eq!(reply.limit, 60);
                assert_eq!(reply.error, "Too many messages. Slow down.");
            }
        }
    }

    assert!(rate_limit_replies >= 60, "the excess is answered with rate_limit");
    let produced = t.log.records(EventType::ChannelMessageAdd.as_str());
    assert!(produced.len() <= 60, "excess frames are not forwarded to the log");
    assert!(!produced.is_empty(), "frames within budget still flow");
}

#[tokio::test(start_paused = true)]
async fn direct_messages_persist_inline_and_broadcast_to_the_room() {
    let t = start_hub(1000);
    t.membership.set_conversation(SnowflakeId(7), SnowflakeId(1001), SnowflakeId(1002));
    let (alpha, mut alpha_rx) = fake_connection(&t, 1001);
    let (beta, mut beta_rx) = fake_connection(&t, 1002);
    join(&t, &alpha, "direct:7").await;
    join(&t, &beta, "direct:7").await;
    drain_frames(&mut alpha_rx);
    drain_frames(&mut beta_rx);

    let frame = serde_json::to_string(&data_frame(
        EventType::DirectMessageAdd,
        "direct:7",
        r#"{"content":"hey","conversationID":"7"}"#,
    ))
    .expect("serialize");
    t.hub.handle_incoming(&alpha, &frame, now_millis()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stored = t.direct_messages.messages();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].user_id, SnowflakeId(1001));
    assert!(!stored[0].id.is_zero(), "the hub mints the message id");

    let frames = drain_frames(&mut beta_rx);
    assert_eq!(frames.len(), 1);
    let batch: Vec<BroadcastFrame> = serde_json::from_str(&frames[0]).expect("batch array");
    assert_eq!(batch[0].event, EventType::DirectMessageAdd);
    let data: serde_json::Value =
        serde_json::from_str(batch[0].data.as_ref().expect("payload").get()).expect("valid json");
    assert_eq!(data["content"], "hey");
    assert_eq!(data["userID"], "1001");

    // The durable log is not involved in the DM path.
    assert!(t.log.records(EventType::DirectMessageAdd.as_str()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_direct_message_persist_suppresses_the_broadcast() {
    let t = start_hub(1000);
    t.membership.set_conversation(SnowflakeId(7), SnowflakeId(1001), SnowflakeId(1002));
    let (alpha, mut alpha_rx) = fake_connection(&t, 1001);
    join(&t, &alpha, "direct:7").await;
    drain_frames(&mut alpha_rx);

    t.direct_messages.fail_writes(true);
    let frame = serde_json::to_string(&data_frame(
        EventType::DirectMessageAdd,
        "direct:7",
        r#"{"content":"hey","conversationID":"7"}"#,
    ))
    .expect("serialize");
    t.hub.handle_incoming(&alpha, &frame, now_millis()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(t.direct_messages.messages().is_empty());
    assert!(drain_frames(&mut alpha_rx).is_empty(), "no broadcast on persist failure");
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_are_dropped_without_side_effects() {
    let t = start_hub(1000);
    let (conn, mut rx) = fake_connection(&t, 1001);

    for raw in ["{not-json", r#"{"event":"channel-message.add"}"#, r#"{"event":"room.explode","room":"server:1"}"#] {
        t.hub.handle_incoming(&conn, raw, now_millis()).await;
    }
    settle().await;

    assert_eq!(conn.room(), None);
    assert!(drain_frames(&mut rx).is_empty());
    assert!(t.log.records(EventType::ChannelMessageAdd.as_str()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn message_for_a_room_the_client_is_not_in_is_refused() {
    let t = start_hub(1000);
    t.membership.grant_server_member(SnowflakeId(42), SnowflakeId(1001));
    let (conn, mut rx) = fake_connection(&t, 1001);
    join(&t, &conn, "server:42").await;
    drain_frames(&mut rx);

    let frame = serde_json::to_string(&data_frame(
        EventType::ChannelMessageAdd,
        "server:99",
        r#"{"content":"hi"}"#,
    ))
    .expect("serialize");
    t.hub.handle_incoming(&conn, &frame, now_millis()).await;
    settle().await;

    assert!(t.log.records(EventType::ChannelMessageAdd.as_str()).is_empty());
}
