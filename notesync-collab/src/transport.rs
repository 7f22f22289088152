//! Client connection of one replica to its note room.
//!
//! A [`TransportSession`] owns a background task that keeps a WebSocket
//! open to `"{server_url}/note-{id}"`, reconnecting with exponential backoff.
//! Every (re)connect runs the two-step state-vector handshake, so edits made
//! while offline reach the room without an explicit queue.
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──► Connected
//!      ▲                          │              │
//!      └──────── backoff ◄────────┴── lost ◄─────┘
//! any ──destroy()──► Destroyed
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use notesync_core::{DocumentError, SharedDocument, TxnOrigin};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::awareness::{AwarenessState, PresenceRoom};
use crate::protocol::{room_name, MessageType, PeerInfo, ProtocolError, SyncMessage};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Destroyed,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Base URL; the room name is appended as a path segment.
    pub server_url: String,
    pub reconnect_min_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub heartbeat_interval: Duration,
    /// Display name announced in `Join`.
    pub user_name: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            reconnect_min_delay: Duration::from_millis(100),
            reconnect_max_delay: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
            user_name: "Anonymous".to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport has been destroyed")]
    Destroyed,

    #[error("connect requires a Tokio runtime")]
    NoRuntime,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Why a single connection ended.
enum Exit {
    Shutdown,
    Lost,
    Refused(String),
}

struct SessionShared {
    doc: Arc<SharedDocument>,
    config: TransportConfig,
    peer: PeerInfo,
    room: String,
    state: watch::Sender<ConnectionState>,
    presence: Mutex<PresenceRoom>,
    awareness: watch::Sender<Option<AwarenessState>>,
    clock: AtomicU64,
}

impl SessionShared {
    fn presence(&self) -> std::sync::MutexGuard<'_, PresenceRoom> {
        self.presence.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn url(&self) -> String {
        format!("{}/{}", self.config.server_url.trim_end_matches('/'), self.room)
    }
}

struct Control {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct TransportSession {
    shared: Arc<SessionShared>,
    control: Mutex<Option<Control>>,
}

impl TransportSession {
    /// Create a session for `doc`'s room. Nothing is opened until
    /// [`connect`](Self::connect).
    pub fn new(doc: Arc<SharedDocument>, config: TransportConfig) -> Self {
        let peer = PeerInfo::new(config.user_name.clone());
        let room = room_name(doc.note_id());
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (awareness, _) = watch::channel(None);
        Self {
            shared: Arc::new(SessionShared {
                presence: Mutex::new(PresenceRoom::new(peer.peer_id)),
                doc,
                config,
                peer,
                room,
                state,
                awareness,
                clock: AtomicU64::new(0),
            }),
            control: Mutex::new(None),
        }
    }

    pub fn document(&self) -> &Arc<SharedDocument> {
        &self.shared.doc
    }

    pub fn note_id(&self) -> &str {
        self.shared.doc.note_id()
    }

    pub fn room(&self) -> &str {
        &self.shared.room
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.shared.peer
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Resolve once the session reaches `target` (or is destroyed).
    pub async fn wait_for_state(&self, target: ConnectionState) -> ConnectionState {
        let mut rx = self.shared.state.subscribe();
        let state = match rx
            .wait_for(|s| *s == target || *s == ConnectionState::Destroyed)
            .await
        {
            Ok(state) => *state,
            Err(_) => ConnectionState::Destroyed,
        };
        state
    }

    /// Start the connection task. No-op while it is already running.
    pub fn connect(&self) -> Result<(), TransportError> {
        if self.state() == ConnectionState::Destroyed {
            return Err(TransportError::Destroyed);
        }
        let mut control = self.lock_control();
        if control.as_ref().is_some_and(|c| !c.task.is_finished()) {
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = runtime.spawn(run_session(self.shared.clone(), shutdown_rx));
        *control = Some(Control { shutdown, task });
        Ok(())
    }

    /// Close the connection and forget remote presence. The document is
    /// left untouched.
    pub fn disconnect(&self) {
        if let Some(control) = self.lock_control().take() {
            let _ = control.shutdown.send(true);
            log::info!("disconnecting from {}", self.shared.room);
        }
        self.shared.presence().clear();
        self.shared.state.send_if_modified(|state| {
            if matches!(state, ConnectionState::Destroyed | ConnectionState::Disconnected) {
                return false;
            }
            *state = ConnectionState::Disconnected;
            true
        });
    }

    /// Disconnect for good; later `connect` calls fail.
    pub fn destroy(&self) {
        self.disconnect();
        self.shared.state.send_replace(ConnectionState::Destroyed);
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == ConnectionState::Destroyed
    }

    /// Publish our presence; sent now if connected and again on reconnect.
    pub fn set_local_awareness(&self, state: AwarenessState) {
        self.shared.awareness.send_replace(Some(state));
    }

    pub fn local_awareness(&self) -> Option<AwarenessState> {
        self.shared.awareness.borrow().clone()
    }

    pub fn remote_awareness(&self) -> Vec<AwarenessState> {
        self.shared.presence().peers()
    }

    fn lock_control(&self) -> std::sync::MutexGuard<'_, Option<Control>> {
        self.control.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        if let Some(control) = self.lock_control().take() {
            let _ = control.shutdown.send(true);
        }
    }
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession")
            .field("room", &self.shared.room)
            .field("peer_id", &self.shared.peer.peer_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Set `state` unless this task has been told to stop.
fn publish(shared: &SessionShared, shutdown: &watch::Receiver<bool>, state: ConnectionState) {
    shared.state.send_if_modified(|current| {
        // Checked under the state lock so a concurrent disconnect wins.
        if *shutdown.borrow() || *current == ConnectionState::Destroyed || *current == state {
            return false;
        }
        *current = state;
        true
    });
}

async fn run_session(shared: Arc<SessionShared>, mut shutdown: watch::Receiver<bool>) {
    let min_delay = shared.config.reconnect_min_delay;
    let max_delay = shared.config.reconnect_max_delay.max(min_delay);
    let mut delay = min_delay;
    let url = shared.url();

    loop {
        publish(&shared, &shutdown, ConnectionState::Connecting);
        log::info!("connecting to {url}");

        let connected = tokio::select! {
            result = tokio_tungstenite::connect_async(url.as_str()) => result,
            _ = shutdown.changed() => return,
        };

        match connected {
            Ok((socket, _)) => {
                delay = min_delay;
                match run_connection(&shared, socket, &mut shutdown).await {
                    Ok(Exit::Shutdown) => return,
                    Ok(Exit::Lost) => log::warn!("connection to {} lost", shared.room),
                    Ok(Exit::Refused(reason)) => {
                        log::warn!("server refused {}: {reason}", shared.room);
                        delay = max_delay;
                    }
                    Err(e) => log::warn!("connection to {} failed: {e}", shared.room),
                }
            }
            Err(e) => log::warn!("connect to {url} failed: {e}"),
        }

        shared.presence().clear();
        publish(&shared, &shutdown, ConnectionState::Disconnected);
        log::info!("reconnecting to {} in {delay:?}", shared.room);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
        delay = (delay * 2).min(max_delay);
    }
}

async fn send(socket: &mut Socket, msg: &SyncMessage) -> Result<(), TransportError> {
    socket.send(Message::Binary(msg.encode()?.into())).await?;
    Ok(())
}

async fn run_connection(
    shared: &SessionShared,
    mut socket: Socket,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Exit, TransportError> {
    let doc = &shared.doc;
    let peer_id = shared.peer.peer_id;
    let room = shared.room.as_str();

    // Subscribe before taking the state vector so no local edit falls
    // between the handshake and live forwarding.
    let (local_tx, mut local_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let _forward = doc.observe_updates(move |origin, delta| {
        if !matches!(origin, TxnOrigin::Remote | TxnOrigin::Persistence) {
            let _ = local_tx.send(delta.to_vec());
        }
    })?;

    send(&mut socket, &SyncMessage::join(room, &shared.peer)?).await?;
    send(&mut socket, &SyncMessage::sync_step1(peer_id, room, doc.state_vector()?)).await?;

    let mut awareness = shared.awareness.subscribe();
    let current = awareness.borrow_and_update().clone();
    if let Some(state) = current {
        send(&mut socket, &SyncMessage::awareness(peer_id, room, 0, &state)?).await?;
    }

    publish(shared, shutdown, ConnectionState::Connected);
    log::info!("connected to {room} as {peer_id}");

    let mut heartbeat = tokio::time::interval(shared.config.heartbeat_interval.max(Duration::from_millis(10)));
    heartbeat.tick().await;

    loop {
        tokio::select! {
            biased;

            // Edits made after disconnect() belong to the next handshake.
            _ = shutdown.changed() => {
                let _ = send(&mut socket, &SyncMessage::leave(peer_id, room)).await;
                let _ = socket.close(None).await;
                return Ok(Exit::Shutdown);
            }

            frame = socket.next() => {
                let data = match frame {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Close(_))) | None => return Ok(Exit::Lost),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        log::warn!("websocket error on {room}: {e}");
                        return Ok(Exit::Lost);
                    }
                };
                let msg = match SyncMessage::decode(&data) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::warn!("undecodable frame on {room}: {e}");
                        continue;
                    }
                };
                if let Some(exit) = handle_incoming(shared, &mut socket, msg).await? {
                    return Ok(exit);
                }
            }

            Some(delta) = local_rx.recv() => {
                let clock = shared.clock.fetch_add(1, Ordering::Relaxed) + 1;
                send(&mut socket, &SyncMessage::update(peer_id, room, clock, delta)).await?;
            }

            Ok(()) = awareness.changed() => {
                let current = awareness.borrow_and_update().clone();
                if let Some(state) = current {
                    let clock = shared.clock.fetch_add(1, Ordering::Relaxed) + 1;
                    send(&mut socket, &SyncMessage::awareness(peer_id, room, clock, &state)?).await?;
                }
            }

            _ = heartbeat.tick() => {
                send(&mut socket, &SyncMessage::ping(peer_id)).await?;
                let idle = shared.presence().prune_idle();
                if !idle.is_empty() {
                    log::debug!("pruned {} idle peers in {room}", idle.len());
                }
            }

        }
    }
}

async fn handle_incoming(
    shared: &SessionShared,
    socket: &mut Socket,
    msg: SyncMessage,
) -> Result<Option<Exit>, TransportError> {
    let doc = &shared.doc;
    log::trace!("{:?} from {} on {}", msg.msg_type, msg.peer_id, shared.room);

    match msg.msg_type {
        MessageType::SyncStep1 => {
            let diff = doc.encode_diff(&msg.payload)?;
            send(socket, &SyncMessage::sync_step2(shared.peer.peer_id, &shared.room, diff)).await?;
        }
        MessageType::SyncStep2 | MessageType::Update => {
            if let Err(e) = doc.apply_remote_delta(&msg.payload) {
                log::warn!("discarding malformed delta for {}: {e}", doc.note_id());
            }
        }
        MessageType::Awareness => match msg.awareness_state() {
            Ok(state) => shared.presence().handle(msg.peer_id, state),
            Err(e) => log::debug!("bad awareness payload from {}: {e}", msg.peer_id),
        },
        MessageType::Leave => {
            shared.presence().remove(&msg.peer_id);
        }
        MessageType::Ping => {
            send(socket, &SyncMessage::pong(shared.peer.peer_id)).await?;
        }
        MessageType::Refused => {
            return Ok(Some(Exit::Refused(msg.refusal_reason()?)));
        }
        MessageType::Pong | MessageType::Join => {}
    }
    Ok(None)
}
