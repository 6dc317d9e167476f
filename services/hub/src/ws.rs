//! Websocket upgrade endpoint.
//!
//! Authentication happens upstream: the gateway verifies the bearer token
//! and forwards the identity in `x-user-id`. The hub trusts that header
//! and refuses upgrades without it.

use axum::extract::State;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use futures_util::StreamExt;
use tracing::debug;

use banter_protocol::SnowflakeId;

use crate::connection::{Connection, MAX_FRAME_BYTES, read_pump, write_pump};
use crate::state::AppState;

/// Identity header set by the upstream gateway.
pub const USER_ID_HEADER: &str = "x-user-id";

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let Some(user_id) = extract_user_id(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state, user_id))
        .into_response()
}

fn extract_user_id(headers: &HeaderMap) -> Option<SnowflakeId> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: SnowflakeId) {
    let hub = state.hub;
    let (sink, stream) = socket.split();
    let (conn, frames_rx) = Connection::new(hub.next_conn_id(), user_id, &hub.shutdown_token());

    if !hub.register(&conn) {
        return; // shutting down; the socket drops with a close frame
    }
    debug!(user_id = %user_id, conn_id = conn.id, "client connected");

    let writer = tokio::spawn(write_pump(conn.clone(), frames_rx, sink));
    read_pump(hub.clone(), conn.clone(), stream).await;

    conn.close();
    hub.unregister(&conn);
    let _ = writer.await;
    debug!(user_id = %user_id, conn_id = conn.id, "client disconnected");
}
