pub mod bridge;
pub mod broadcaster;
pub mod config;
pub mod connection;
pub mod durable;
pub mod hub;
pub mod metrics;
pub mod rate_limit;
pub mod room;
pub mod router;
pub mod state;
pub mod stores;
pub mod subscribe;
pub mod typing;
pub mod ws;

pub use hub::{Hub, HubDeps};
pub use state::AppState;

use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

mod health {
    use axum::response::IntoResponse;
    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }
    pub async fn readyz() -> impl IntoResponse {
        "ok"
    }
}

/// Milliseconds since the Unix epoch; the clock for pipeline timestamps
/// and durable-log headers.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}
