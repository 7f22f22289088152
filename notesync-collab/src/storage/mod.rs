//! Durable snapshot storage.
//!
//! Each note owns exactly one stored value: the last flushed full document
//! state. Writes overwrite it; there is no append-only log.
//!
//! ```text
//! PersistenceBridge ──save_snapshot──► SnapshotStore ──► RocksDB (CF "snapshots", CF "metadata")
//!                   ◄──load_snapshot──                └► MemoryStore (tests)
//! ```

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{DocumentStore, SnapshotMetadata, StoreConfig};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Blocking snapshot storage keyed by note id.
///
/// Implementations are called from `spawn_blocking` and may block.
pub trait SnapshotStore: Send + Sync + 'static {
    /// `Ok(None)` when the note was never flushed.
    fn load_snapshot(&self, note_id: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Overwrite the note's snapshot with `snapshot`.
    fn save_snapshot(&self, note_id: &str, snapshot: &[u8]) -> Result<(), StoreError>;
}
