//! In-process snapshot store with failure injection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use super::{SnapshotStore, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    snapshots: Mutex<HashMap<String, Vec<u8>>>,
    failing: AtomicBool,
    save_attempts: AtomicU64,
    saves: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate a note as if it had been flushed earlier.
    pub fn with_snapshot(self, note_id: &str, snapshot: Vec<u8>) -> Self {
        self.lock().insert(note_id.to_string(), snapshot);
        self
    }

    /// While set, every load and save fails with [`StoreError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn save_attempts(&self) -> u64 {
        self.save_attempts.load(Ordering::SeqCst)
    }

    /// Successful saves.
    pub fn saves(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self, note_id: &str) -> Option<Vec<u8>> {
        self.lock().get(note_id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.snapshots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

impl SnapshotStore for MemoryStore {
    fn load_snapshot(&self, note_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_available()?;
        Ok(self.snapshot(note_id))
    }

    fn save_snapshot(&self, note_id: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        self.save_attempts.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        self.lock().insert(note_id.to_string(), snapshot.to_vec());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
