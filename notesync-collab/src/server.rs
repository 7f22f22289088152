//! WebSocket room server.
//!
//! ```text
//! Client A ──┐
//!             ├── Room ("note-{id}") ── SharedDocument ── BroadcastGroup
//! Client B ──┘                               │
//!                                            └── PersistenceBridge ── SnapshotStore
//! ```
//!
//! A room is created by the first `Join` for its note and removed when its
//! last peer leaves. Each connection runs one select loop over its socket
//! and the room's broadcast receiver.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use notesync_core::{DocumentError, SharedDocument, TxnOrigin};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;
use yrs::Subscription;

use crate::broadcast::{BroadcastGroup, RoomFrame};
use crate::persistence::{PersistenceBridge, PersistenceError, PersistenceStats};
use crate::protocol::{note_id_from_room, room_name, MessageType, PeerInfo, ProtocolError, SyncMessage};
use crate::storage::{DocumentStore, SnapshotStore, StoreConfig, StoreError};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room.
    pub broadcast_capacity: usize,
    /// Interval of WebSocket-level keepalive pings.
    pub heartbeat_interval_secs: u64,
    /// RocksDB directory; `None` keeps rooms in memory only.
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `NOTESYNC_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: lookup("NOTESYNC_BIND_ADDR").unwrap_or(defaults.bind_addr),
            max_peers_per_room: parse_or(&lookup, "NOTESYNC_MAX_PEERS_PER_ROOM", defaults.max_peers_per_room),
            broadcast_capacity: parse_or(&lookup, "NOTESYNC_BROADCAST_CAPACITY", defaults.broadcast_capacity),
            heartbeat_interval_secs: defaults.heartbeat_interval_secs,
            storage_path: lookup("NOTESYNC_STORAGE_PATH")
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
        }
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            log::warn!("ignoring invalid {key}={raw:?}");
            default
        }),
        None => default,
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub refused_joins: u64,
    pub malformed_deltas: u64,
    pub persisted_snapshots: u64,
    pub persistence_failures: u64,
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

struct Room {
    doc: Arc<SharedDocument>,
    broadcast: Arc<BroadcastGroup>,
    bridge: Mutex<Option<PersistenceBridge>>,
    _relay: Subscription,
}

impl Room {
    fn open(
        note_id: &str,
        capacity: usize,
        store: Option<Arc<dyn SnapshotStore>>,
    ) -> Result<Self, ServerError> {
        let doc = Arc::new(SharedDocument::new(note_id));
        let broadcast = Arc::new(BroadcastGroup::new(capacity));

        // Client deltas are relayed by the connection that received them;
        // only state loaded from the store has to be pushed from here.
        let relay = {
            let group = broadcast.clone();
            let room = room_name(note_id);
            doc.observe_updates(move |origin, delta| {
                if origin != TxnOrigin::Persistence {
                    return;
                }
                let msg = SyncMessage::update(Uuid::nil(), &room, 0, delta.to_vec());
                if let Err(e) = group.broadcast(None, &msg) {
                    log::warn!("failed to relay loaded snapshot for {room}: {e}");
                }
            })?
        };

        let bridge = match store {
            Some(store) => Some(PersistenceBridge::bind(doc.clone(), store)?),
            None => None,
        };

        Ok(Self {
            doc,
            broadcast,
            bridge: Mutex::new(bridge),
            _relay: relay,
        })
    }

    fn persistence_stats(&self) -> Option<PersistenceStats> {
        self.bridge
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(PersistenceBridge::stats)
    }

    async fn close(&self) -> Option<PersistenceStats> {
        let bridge = self.bridge.lock().unwrap_or_else(|e| e.into_inner()).take();
        let stats = match bridge {
            Some(bridge) => Some(bridge.unbind().await),
            None => None,
        };
        self.doc.destroy();
        stats
    }
}

/// A connection that has completed `Join`.
struct Member {
    peer_id: Uuid,
    note_id: String,
    room_name: String,
    room: Arc<Room>,
    frames: broadcast::Receiver<RoomFrame>,
}

enum Flow {
    Continue,
    Close,
}

#[derive(Clone)]
struct ServerContext {
    config: ServerConfig,
    rooms: Arc<RwLock<HashMap<String, Arc<Room>>>>,
    /// Rooms removed from `rooms` whose last snapshot is still being written.
    /// Flips to `true` once the close has finished.
    closing: Arc<Mutex<HashMap<String, watch::Receiver<bool>>>>,
    stats: Arc<RwLock<ServerStats>>,
    store: Option<Arc<dyn SnapshotStore>>,
}

impl ServerContext {
    fn closing(&self) -> std::sync::MutexGuard<'_, HashMap<String, watch::Receiver<bool>>> {
        self.closing.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct SyncServer {
    ctx: ServerContext,
}

impl SyncServer {
    /// Opens the RocksDB store when `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let store: Option<Arc<dyn SnapshotStore>> = match &config.storage_path {
            Some(path) => {
                let store = DocumentStore::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?;
                log::info!("snapshots stored in {}", store.path().display());
                Some(Arc::new(store))
            }
            None => None,
        };
        Ok(Self::build(config, store))
    }

    /// Use `store` regardless of `config.storage_path`.
    pub fn with_store(config: ServerConfig, store: Arc<dyn SnapshotStore>) -> Self {
        Self::build(config, Some(store))
    }

    fn build(config: ServerConfig, store: Option<Arc<dyn SnapshotStore>>) -> Self {
        Self {
            ctx: ServerContext {
                config,
                rooms: Arc::new(RwLock::new(HashMap::new())),
                closing: Arc::new(Mutex::new(HashMap::new())),
                stats: Arc::new(RwLock::new(ServerStats::default())),
                store,
            },
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.ctx.config
    }

    /// Bind `config.bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.ctx.config.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("sync server listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, ctx).await {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.ctx.stats.read().await.clone();
        let rooms = self.ctx.rooms.read().await;
        for room in rooms.values() {
            if let Some(persisted) = room.persistence_stats() {
                stats.persisted_snapshots += persisted.writes_completed;
                stats.persistence_failures += persisted.writes_failed;
            }
        }
        stats.active_rooms = rooms.len();
        stats
    }

    pub async fn room_count(&self) -> usize {
        self.ctx.rooms.read().await.len()
    }

    /// The server replica of an open room.
    pub async fn room_document(&self, note_id: &str) -> Option<Arc<SharedDocument>> {
        self.ctx.rooms.read().await.get(note_id).map(|room| room.doc.clone())
    }

    pub async fn room_peers(&self, note_id: &str) -> Vec<PeerInfo> {
        let room = self.ctx.rooms.read().await.get(note_id).cloned();
        match room {
            Some(room) => room.broadcast.peers().await,
            None => Vec::new(),
        }
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, ctx: ServerContext) -> Result<(), ServerError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut source) = ws_stream.split();
    log::info!("websocket connection established from {addr}");

    {
        let mut s = ctx.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut member: Option<Member> = None;
    let outcome = pump(&ctx, addr, &mut sink, &mut source, &mut member).await;

    if let Some(member) = member {
        leave_room(&ctx, member).await;
    }
    {
        let mut s = ctx.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }
    let _ = sink.close().await;
    outcome
}

async fn pump(
    ctx: &ServerContext,
    addr: SocketAddr,
    sink: &mut WsSink,
    source: &mut WsSource,
    member: &mut Option<Member>,
) -> Result<(), ServerError> {
    let mut heartbeat = tokio::time::interval(Duration::from_secs(ctx.config.heartbeat_interval_secs.max(1)));
    heartbeat.tick().await;

    loop {
        tokio::select! {
            msg = source.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        {
                            let mut s = ctx.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += data.len() as u64;
                        }
                        let sync_msg = match SyncMessage::decode(&data) {
                            Ok(sync_msg) => sync_msg,
                            Err(e) => {
                                log::warn!("failed to decode message from {addr}: {e}");
                                continue;
                            }
                        };
                        if let Flow::Close = handle_message(ctx, sink, member, sync_msg).await? {
                            return Ok(());
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        sink.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("connection closed from {addr}");
                        return Ok(());
                    }
                    Some(Err(e)) => {
                        log::warn!("websocket error from {addr}: {e}");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                }
            }

            frame = async {
                match member.as_mut() {
                    Some(m) => m.frames.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                let Some(m) = member.as_ref() else { continue };
                match frame {
                    Ok((from, bytes)) => {
                        if from == Some(m.peer_id) {
                            continue;
                        }
                        sink.send(Message::Binary(bytes.to_vec().into())).await?;
                    }
                    Err(RecvError::Lagged(n)) => {
                        // The skipped frames may carry deltas; resend everything.
                        log::warn!("peer {} lagged by {n} frames in {}, resyncing", m.peer_id, m.room_name);
                        m.room.broadcast.record_dropped(n);
                        let full = m.room.doc.encode_full_state()?;
                        send(sink, &SyncMessage::sync_step2(Uuid::nil(), &m.room_name, full)).await?;
                    }
                    Err(RecvError::Closed) => return Ok(()),
                }
            }

            _ = heartbeat.tick() => {
                sink.send(Message::Ping(Vec::new().into())).await?;
            }
        }
    }
}

async fn send(sink: &mut WsSink, msg: &SyncMessage) -> Result<(), ServerError> {
    sink.send(Message::Binary(msg.encode()?.into())).await?;
    Ok(())
}

async fn handle_message(
    ctx: &ServerContext,
    sink: &mut WsSink,
    member: &mut Option<Member>,
    msg: SyncMessage,
) -> Result<Flow, ServerError> {
    if msg.msg_type == MessageType::Join {
        if member.is_some() {
            log::debug!("ignoring repeated join from {}", msg.peer_id);
            return Ok(Flow::Continue);
        }
        return join_room(ctx, sink, member, msg).await;
    }

    if msg.msg_type == MessageType::Ping {
        send(sink, &SyncMessage::pong(Uuid::nil())).await?;
        return Ok(Flow::Continue);
    }

    let Some(m) = member.as_ref() else {
        log::debug!("{:?} from {} before join, ignored", msg.msg_type, msg.peer_id);
        return Ok(Flow::Continue);
    };
    log::trace!("{:?} from {} in {}", msg.msg_type, m.peer_id, m.room_name);

    match msg.msg_type {
        MessageType::SyncStep1 => {
            let diff = match m.room.doc.encode_diff(&msg.payload) {
                Ok(diff) => diff,
                Err(e) => {
                    log::warn!("bad state vector from {} in {}: {e}", m.peer_id, m.room_name);
                    m.room.doc.encode_full_state()?
                }
            };
            send(sink, &SyncMessage::sync_step2(Uuid::nil(), &m.room_name, diff)).await?;
            let state_vector = m.room.doc.state_vector()?;
            send(sink, &SyncMessage::sync_step1(Uuid::nil(), &m.room_name, state_vector)).await?;
        }

        MessageType::SyncStep2 | MessageType::Update => {
            if let Err(e) = m.room.doc.apply_remote_delta(&msg.payload) {
                log::warn!("discarding malformed delta from {} for {}: {e}", m.peer_id, m.note_id);
                ctx.stats.write().await.malformed_deltas += 1;
                return Ok(Flow::Continue);
            }
            let relay = SyncMessage::update(m.peer_id, &m.room_name, msg.clock, msg.payload);
            m.room.broadcast.broadcast(Some(m.peer_id), &relay)?;
        }

        MessageType::Awareness => {
            let relay = SyncMessage { peer_id: m.peer_id, ..msg };
            m.room.broadcast.broadcast(Some(m.peer_id), &relay)?;
        }

        MessageType::Leave => return Ok(Flow::Close),

        other => log::debug!("unhandled {other:?} from {}", m.peer_id),
    }
    Ok(Flow::Continue)
}

async fn join_room(
    ctx: &ServerContext,
    sink: &mut WsSink,
    member: &mut Option<Member>,
    msg: SyncMessage,
) -> Result<Flow, ServerError> {
    let Some(note_id) = note_id_from_room(&msg.room).map(str::to_string) else {
        send(sink, &SyncMessage::refused(Uuid::nil(), &msg.room, "invalid room name")).await?;
        return Ok(Flow::Close);
    };
    let info = msg
        .peer_info()
        .unwrap_or_else(|_| PeerInfo::with_id(msg.peer_id, "Anonymous"));

    // A reopened room must load the snapshot its predecessor wrote last.
    let mut rooms = loop {
        let rooms = ctx.rooms.write().await;
        let pending = ctx.closing().get(&note_id).cloned();
        match pending {
            None => break rooms,
            Some(mut closed) => {
                drop(rooms);
                log::debug!("{} waits for {} to finish closing", info.peer_id, msg.room);
                if closed.wait_for(|done| *done).await.is_err() {
                    // The closing task went away without finishing.
                    ctx.closing().remove(&note_id);
                }
            }
        }
    };
    let occupancy = match rooms.get(&note_id) {
        Some(room) => room.broadcast.peer_count().await,
        None => 0,
    };
    if occupancy >= ctx.config.max_peers_per_room {
        drop(rooms);
        log::warn!("refusing {} in {}: room is full", info.peer_id, msg.room);
        ctx.stats.write().await.refused_joins += 1;
        send(sink, &SyncMessage::refused(Uuid::nil(), &msg.room, "room is full")).await?;
        return Ok(Flow::Close);
    }

    let room = match rooms.get(&note_id) {
        Some(room) => room.clone(),
        None => {
            let room = Arc::new(Room::open(&note_id, ctx.config.broadcast_capacity, ctx.store.clone())?);
            rooms.insert(note_id.clone(), room.clone());
            log::info!("room {} created", msg.room);
            room
        }
    };
    let frames = room.broadcast.add_peer(info.clone()).await;
    drop(rooms);

    log::info!("peer {} ({}) joined {}", info.name, info.peer_id, msg.room);
    *member = Some(Member {
        peer_id: info.peer_id,
        note_id,
        room_name: msg.room,
        room,
        frames,
    });
    Ok(Flow::Continue)
}

async fn leave_room(ctx: &ServerContext, member: Member) {
    let Member {
        peer_id,
        note_id,
        room_name,
        room,
        frames,
    } = member;
    drop(frames);

    let mut rooms = ctx.rooms.write().await;
    room.broadcast.remove_peer(&peer_id).await;
    if let Err(e) = room.broadcast.broadcast(Some(peer_id), &SyncMessage::leave(peer_id, &room_name)) {
        log::warn!("failed to announce departure of {peer_id}: {e}");
    }

    if room.broadcast.peer_count().await > 0 {
        log::info!("peer {peer_id} left {room_name}");
        return;
    }
    rooms.remove(&note_id);
    let (closed_tx, closed_rx) = watch::channel(false);
    ctx.closing().insert(note_id.clone(), closed_rx);
    drop(rooms);

    if let Some(persisted) = room.close().await {
        let mut s = ctx.stats.write().await;
        s.persisted_snapshots += persisted.writes_completed;
        s.persistence_failures += persisted.writes_failed;
    }
    ctx.closing().remove(&note_id);
    let _ = closed_tx.send(true);
    log::info!("room {room_name} removed (empty)");
}
