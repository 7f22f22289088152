//! # notesync-collab — networking and persistence for replicated notes
//!
//! ```text
//! ┌──────────────────┐    WebSocket     ┌──────────────────┐
//! │ TransportSession │ ◄──────────────► │ SyncServer       │
//! │ (per note)       │   note-{id} room │ (rooms)          │
//! └────────┬─────────┘                  └────────┬─────────┘
//!          │                                     │
//!          ▼                                     ▼
//! ┌──────────────────┐                  ┌──────────────────┐
//! │ SharedDocument   │                  │ SharedDocument   │
//! │ (client replica) │                  │ (room replica)   │
//! └──────────────────┘                  └────────┬─────────┘
//!                                                │
//!                                     ┌──────────┴──────────┐
//!                                     │ BroadcastGroup      │
//!                                     │ PersistenceBridge   │──► SnapshotStore
//!                                     └─────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — bincode-encoded `SyncMessage` frames and room naming
//! - [`broadcast`] — per-room fan-out
//! - [`server`] — room server with snapshot persistence
//! - [`transport`] — client connection with reconnect and handshake
//! - [`registry`] — per-process document/transport cache
//! - [`coordinator`] — page-structure domain for the open root note
//! - [`sync`] — the `NoteSync` facade used by editors
//! - [`persistence`], [`storage`] — snapshot load/save
//! - [`awareness`] — ephemeral presence

pub mod awareness;
pub mod broadcast;
pub mod coordinator;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod storage;
pub mod sync;
pub mod transport;

pub use awareness::{AwarenessState, CursorColor, CursorPosition, PresenceRoom};
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomFrame};
pub use coordinator::PageStructureCoordinator;
pub use persistence::{PersistenceBridge, PersistenceError, PersistenceStats};
pub use protocol::{room_name, MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use registry::ReplicaRegistry;
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use storage::{DocumentStore, MemoryStore, SnapshotMetadata, SnapshotStore, StoreConfig, StoreError};
pub use sync::{ContentCallbacks, NoteContent, NoteSync, ReplicaHandles, SyncError};
pub use transport::{ConnectionState, TransportConfig, TransportError, TransportSession};
