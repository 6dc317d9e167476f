//! Typing-event coalescing.
//!
//! Typing pings are high-frequency and low-value; each room batches them
//! into at most one broadcast per flush window. The tracked-typer list is
//! capped: the first four distinct typers are named, everyone else only
//! counts toward `total`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::value::RawValue;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use banter_protocol::{EventType, SnowflakeId, Typer, TypingPayload};

use crate::hub::Hub;
use crate::room::{BroadcastRequest, RoomState};

pub const FLUSH_TYPING_DELAY: Duration = Duration::from_millis(500);
const BROADCAST_TIMEOUT: Duration = Duration::from_millis(350);
pub const MAX_TRACKED_TYPERS: usize = 4;

/// Per-room typing accumulator. Guarded by the room's typing mutex.
#[derive(Default)]
pub struct TypingState {
    /// First-insert order; at most `MAX_TRACKED_TYPERS` entries.
    typers: Vec<SnowflakeId>,
    total: u64,
    flush_task: Option<AbortHandle>,
}

impl TypingState {
    /// Record one typing event. Returns `true` when the flush timer must be
    /// re-armed (i.e. the user was not already tracked).
    fn record(&mut self, user: SnowflakeId) -> bool {
        if self.typers.contains(&user) {
            return false;
        }
        if self.typers.len() < MAX_TRACKED_TYPERS {
            self.typers.push(user);
        }
        self.total += 1;
        true
    }

    /// Take the pending snapshot, resetting the accumulator.
    fn drain(&mut self) -> (Vec<SnowflakeId>, u64) {
        self.flush_task = None;
        (std::mem::take(&mut self.typers), std::mem::take(&mut self.total))
    }
}

impl Hub {
    /// Coalesce one `room.typing` event and (re)arm the room's flush timer.
    pub(crate) fn add_typer(self: &Arc<Self>, room: &Arc<RoomState>, user: SnowflakeId) {
        let mut typing = room.typing.lock().expect("typing lock poisoned");
        if !typing.record(user) {
            return;
        }

        if let Some(pending) = typing.flush_task.take() {
            pending.abort();
        }
        let hub = self.clone();
        let room = room.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(FLUSH_TYPING_DELAY).await;
            hub.flush_typing(&room).await;
        });
        typing.flush_task = Some(task.abort_handle());
    }

    async fn flush_typing(&self, room: &Arc<RoomState>) {
        // Load shedding: typing is the first traffic to go under pressure.
        if room.out_buffer_nearly_full() {
            debug!(room = %room.name(), "out-buffer nearly full, shedding typing flush");
            return;
        }

        let (typer_ids, total) = room.typing.lock().expect("typing lock poisoned").drain();
        if total == 0 {
            return;
        }

        // Name resolution is best-effort: a directory failure still flushes,
        // just without display names.
        let profiles = match self.users.users_batch(&typer_ids).await {
            Ok(profiles) => profiles,
            Err(e) => {
                warn!(room = %room.name(), error = %e, "typing name lookup failed");
                std::collections::HashMap::new()
            }
        };
        let users: Vec<Typer> = typer_ids
            .iter()
            .map(|id| Typer {
                id: *id,
                name: profiles.get(id).map(|p| p.name.clone()).unwrap_or_default(),
            })
            .collect();

        let payload = TypingPayload { users, total };
        let data = match serde_json::to_string(&payload).map(RawValue::from_string) {
            Ok(Ok(data)) => data,
            _ => return,
        };

        let request = BroadcastRequest {
            event: EventType::RoomTyping,
            room: room.name().to_owned(),
            data,
            action: None,
            pipeline_start_ms: None,
        };
        if room.enqueue_within(request, BROADCAST_TIMEOUT).await {
            self.metrics.typing_coalesced.inc();
        } else {
            debug!(room = %room.name(), "typing flush dropped, out-buffer full");
        }
    }
}
