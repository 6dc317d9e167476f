//! The hub: owner of the room table and the only authority that mutates it.
//!
//! Lock order is room-table → per-room; nothing takes the table lock while
//! holding a room lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use banter_protocol::SnowflakeGenerator;

use crate::broadcaster;
use crate::connection::{ConnId, Connection};
use crate::durable::{ConsumerManager, DrainTimeout, DurableConsumer, DurableLog};
use crate::metrics::HubMetrics;
use crate::rate_limit::RateLimiter;
use crate::room::RoomState;
use crate::stores::{DirectMessageStore, MembershipStore, UserDirectory};
use crate::subscribe::SubscribePool;

const REGISTER_BUFFER: usize = 100;
const UNREGISTER_BUFFER: usize = 100;

/// Everything the hub consumes, built in `main` (or a test harness) and
/// threaded through. No global instances.
pub struct HubDeps {
    pub producer: Arc<dyn DurableLog>,
    pub limiter: Arc<dyn RateLimiter>,
    pub membership: Arc<dyn MembershipStore>,
    pub users: Arc<dyn UserDirectory>,
    pub direct_messages: Arc<dyn DirectMessageStore>,
    pub ids: SnowflakeGenerator,
    pub metrics: Arc<HubMetrics>,
    pub subscribe_workers: usize,
    pub allow_all_server_members: bool,
}

/// Maintains the set of active clients and the rooms they fan out through.
pub struct Hub {
    rooms: RwLock<HashMap<String, Arc<RoomState>>>,
    register_tx: mpsc::Sender<Arc<Connection>>,
    unregister_tx: mpsc::Sender<Arc<Connection>>,
    pub(crate) subscribe: SubscribePool,
    consumers: Mutex<ConsumerManager>,

    pub(crate) producer: Arc<dyn DurableLog>,
    pub(crate) limiter: Arc<dyn RateLimiter>,
    pub(crate) membership: Arc<dyn MembershipStore>,
    pub(crate) users: Arc<dyn UserDirectory>,
    pub(crate) direct_messages: Arc<dyn DirectMessageStore>,
    pub(crate) ids: SnowflakeGenerator,
    pub(crate) metrics: Arc<HubMetrics>,
    pub(crate) allow_all_server_members: bool,

    total_clients: AtomicI64,
    next_conn_id: AtomicU64,
    shutdown: CancellationToken,
}

impl Hub {
    /// Build the hub and start its resident tasks: the register/unregister
    /// dispatcher and the subscribe workers. Durable consumers are attached
    /// separately (they need the hub handle to exist first).
    pub fn start(deps: HubDeps) -> Arc<Self> {
        let (register_tx, register_rx) = mpsc::channel(REGISTER_BUFFER);
        let (unregister_tx, unregister_rx) = mpsc::channel(UNREGISTER_BUFFER);
        let (subscribe, subscribe_rx) = SubscribePool::new();

        let hub = Arc::new(Hub {
            rooms: RwLock::new(HashMap::new()),
            register_tx,
            unregister_tx,
            subscribe,
            consumers: Mutex::new(ConsumerManager::new("hub")),
            producer: deps.producer,
            limiter: deps.limiter,
            membership: deps.membership,
            users: deps.users,
            direct_messages: deps.direct_messages,
            ids: deps.ids,
            metrics: deps.metrics,
            allow_all_server_members: deps.allow_all_server_members,
            total_clients: AtomicI64::new(0),
            next_conn_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });

        info!("starting websocket hub");
        tokio::spawn(hub.clone().run(register_rx, unregister_rx));
        hub.spawn_subscribe_workers(deps.subscribe_workers, &subscribe_rx);
        hub
    }

    /// Dispatcher loop: connection bookkeeping lives on one task so the
    /// gauge and counter never race.
    async fn run(
        self: Arc<Self>,
        mut register_rx: mpsc::Receiver<Arc<Connection>>,
        mut unregister_rx: mpsc::Receiver<Arc<Connection>>,
    ) {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                Some(conn) = register_rx.recv() => {
                    let total = self.total_clients.fetch_add(1, Ordering::Relaxed) + 1;
                    self.metrics.active_connections.inc();
                    debug!(user_id = %conn.user_id, total, "client registered");
                }
                Some(conn) = unregister_rx.recv() => {
                    if let Some(name) = conn.room() {
                        if let Some(room) = self.room(&name) {
                            room.detach(&conn);
                        }
                    }
                    conn.clear_room();
                    let total = self.total_clients.fetch_sub(1, Ordering::Relaxed) - 1;
                    self.metrics.active_connections.dec();
                    debug!(user_id = %conn.user_id, total, "client unregistered");
                }
                else => break,
            }
        }
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    pub fn next_conn_id(&self) -> ConnId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Enqueue a freshly upgraded connection. `false` means the hub is
    /// shutting down or the register queue overflowed; the caller should
    /// drop the socket.
    pub fn register(&self, conn: &Arc<Connection>) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        match self.register_tx.try_send(conn.clone()) {
            Ok(()) => true,
            Err(e) => {
                // A full register queue is a symptom of a stalled
                // dispatcher, not a transient condition.
                warn!(user_id = %conn.user_id, error = %e, "register queue overflow");
                false
            }
        }
    }

    pub fn unregister(&self, conn: &Arc<Connection>) {
        if let Err(e) = self.unregister_tx.try_send(conn.clone()) {
            warn!(user_id = %conn.user_id, error = %e, "unregister queue overflow");
        }
    }

    pub fn total_clients(&self) -> i64 {
        self.total_clients.load(Ordering::Relaxed)
    }

    // -----------------------------------------------------------------------
    // Room table
    // -----------------------------------------------------------------------

    pub fn room(&self, name: &str) -> Option<Arc<RoomState>> {
        self.rooms.read().expect("room table poisoned").get(name).cloned()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().expect("room table poisoned").len()
    }

    /// Return the room, creating and registering it if absent. Does not
    /// start its broadcaster; see [`Hub::build_room_broadcaster`].
    pub fn get_or_create_room(&self, name: &str) -> Arc<RoomState> {
        let mut rooms = self.rooms.write().expect("room table poisoned");
        if let Some(room) = rooms.get(name) {
            return room.clone();
        }
        let room = RoomState::new(name);
        rooms.insert(name.to_owned(), room.clone());
        self.metrics.active_rooms.inc();
        room
    }

    /// Ensure the room exists and its broadcaster is running. Starting is
    /// exactly-once: the out-buffer receiver can only be claimed once.
    pub fn build_room_broadcaster(self: &Arc<Self>, name: &str) -> Arc<RoomState> {
        let room = self.get_or_create_room(name);
        if let Some(rx) = room.take_out_rx() {
            broadcaster::spawn(self.clone(), room.clone(), rx);
        }
        room
    }

    /// Remove an idle room. Only its own broadcaster calls this; the table
    /// entry is dropped only if it still maps to `room` and the room is
    /// still empty, so a client that joined between the idle check and this
    /// call keeps its room.
    pub(crate) fn remove_room(&self, room: &Arc<RoomState>) -> bool {
        let mut rooms = self.rooms.write().expect("room table poisoned");
        match rooms.get(room.name()) {
            Some(current) if Arc::ptr_eq(current, room) => {
                if current.client_count() > 0 {
                    return false;
                }
                rooms.remove(room.name());
                self.metrics.active_rooms.dec();
                true
            }
            _ => false,
        }
    }

    // -----------------------------------------------------------------------
    // Durable consumers and shutdown
    // -----------------------------------------------------------------------

    pub fn attach_consumer(&self, consumer: Box<dyn DurableConsumer>) {
        self.consumers.lock().expect("consumer manager poisoned").add(consumer);
    }

    pub fn start_consumers(&self) {
        self.consumers
            .lock()
            .expect("consumer manager poisoned")
            .start(&self.shutdown);
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting registers, cancel every pump and worker, and drain the
    /// consumer manager within `drain`.
    pub async fn shutdown(&self, drain: Duration) -> Result<(), DrainTimeout> {
        info!("shutting down websocket hub");
        self.shutdown.cancel();
        let handles = {
            let mut consumers = self.consumers.lock().expect("consumer manager poisoned");
            consumers.take_tasks()
        };
        ConsumerManager::join_within(handles, drain).await
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("rooms", &self.room_count())
            .field("total_clients", &self.total_clients())
            .finish_non_exhaustive()
    }
}
