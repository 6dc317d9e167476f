//! Per-room broadcaster task.
//!
//! Serialization is the dominant fan-out cost, so the broadcaster batches:
//! it greedily drains whatever is already queued, waits out the remainder
//! of the batch window for stragglers, serializes the batch once into a
//! prepared frame, and delivers that frame to every subscriber with a
//! non-blocking push. A failed push marks the subscriber for eviction.
//!
//! The broadcaster is also the room's reaper: when an idle tick finds the
//! room empty it removes the room from the hub and exits, which is the only
//! way a room dies.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, interval, sleep_until};
use tracing::{info, warn};

use crate::connection::{Connection, PreparedFrame};
use crate::hub::Hub;
use crate::room::{BroadcastRequest, RoomState};

pub const BATCH_TIMEOUT: Duration = Duration::from_millis(50);
pub const MAX_BATCH: usize = 50;
/// An empty room survives one missed idle tick, then is reaped.
pub const IDLE_REAP: Duration = Duration::from_secs(150);

/// Spawn the broadcaster for `room`. Called once per room materialization,
/// under the hub's room-table lock.
pub(crate) fn spawn(hub: Arc<Hub>, room: Arc<RoomState>, rx: mpsc::Receiver<BroadcastRequest>) {
    tokio::spawn(run(hub, room, rx));
}

async fn run(hub: Arc<Hub>, room: Arc<RoomState>, mut rx: mpsc::Receiver<BroadcastRequest>) {
    let mut idle = interval(IDLE_REAP);
    idle.tick().await; // the first tick is immediate

    loop {
        tokio::select! {
            request = rx.recv() => {
                let Some(first) = request else { break };
                let batch = collect_batch(&mut rx, first).await;
                flush(&hub, &room, &batch);
            }
            _ = idle.tick() => {
                if room.client_count() == 0 && hub.remove_room(&room) {
                    info!(room = %room.name(), "removing idle room");
                    break;
                }
            }
        }
    }
}

/// Build one batch starting from `first`: drain what is already queued,
/// then wait out the batch window unless the batch is already full.
async fn collect_batch(
    rx: &mut mpsc::Receiver<BroadcastRequest>,
    first: BroadcastRequest,
) -> Vec<BroadcastRequest> {
    let mut batch = Vec::with_capacity(8);
    batch.push(first);

    while batch.len() < MAX_BATCH {
        match rx.try_recv() {
            Ok(request) => batch.push(request),
            Err(_) => break,
        }
    }
    if batch.len() >= MAX_BATCH {
        return batch;
    }

    let window = sleep_until(Instant::now() + BATCH_TIMEOUT);
    tokio::pin!(window);
    loop {
        tokio::select! {
            () = &mut window => break,
            request = rx.recv() => {
                match request {
                    Some(request) => {
                        batch.push(request);
                        if batch.len() >= MAX_BATCH {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
    batch
}

/// Serialize the batch once and fan it out. Subscribers whose queues are
/// full are collected under the read lock and evicted after it is released.
fn flush(hub: &Hub, room: &RoomState, batch: &[BroadcastRequest]) {
    let started = std::time::Instant::now();

    let json = match serde_json::to_string(batch) {
        Ok(json) => json,
        Err(e) => {
            warn!(room = %room.name(), error = %e, "failed to serialize batch");
            return;
        }
    };
    let frame = PreparedFrame::from_json(json);

    let mut slow: Vec<Arc<Connection>> = Vec::new();
    for conn in room.clients_snapshot() {
        if !conn.try_queue(frame.clone()) && conn.mark_evicted() {
            warn!(room = %room.name(), user_id = %conn.user_id, "send queue full, evicting client");
            slow.push(conn);
        }
    }
    room.evict(&slow);

    hub.metrics.broadcast_duration.observe(started.elapsed().as_secs_f64());
    let now_ms = crate::now_millis();
    for request in batch {
        hub.metrics
            .messages_sent
            .with_label_values(&[request.event.as_str()])
            .inc();
        if let Some(start_ms) = request.pipeline_start_ms {
            let latency_ms = now_ms.saturating_sub(start_ms);
            hub.metrics
                .pipeline_latency
                .with_label_values(&[request.event.as_str()])
                .observe(latency_ms as f64 / 1000.0);
        }
    }
}
