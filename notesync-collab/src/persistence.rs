//! Server-side persistence of room documents.
//!
//! A [`PersistenceBridge`] is bound once per room when its first peer joins:
//!
//! ```text
//! bind ──► writer task: load snapshot ──► apply (persistence origin) ──► loaded
//!                            │
//! doc update ──signal──► writer task: encode full state ──► save_snapshot (overwrite)
//! ```
//!
//! The writer processes signals strictly in order and only after the load
//! has finished, so a save can never overwrite the stored snapshot with a
//! state that lacks it. Store failures are logged and counted; they never
//! reach the editing session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use notesync_core::{DocumentError, SharedDocument, TxnOrigin};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use yrs::Subscription;

use crate::storage::{SnapshotStore, StoreError};

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("persistence requires a Tokio runtime")]
    NoRuntime,

    #[error("background task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistenceStats {
    pub writes_completed: u64,
    pub writes_failed: u64,
    /// Size of the snapshot applied at bind, 0 if none.
    pub loaded_bytes: u64,
}

#[derive(Default)]
struct Counters {
    writes_completed: AtomicU64,
    writes_failed: AtomicU64,
    loaded_bytes: AtomicU64,
}

pub struct PersistenceBridge {
    note_id: String,
    subscription: Option<Subscription>,
    writer: Option<JoinHandle<()>>,
    loaded: watch::Receiver<bool>,
    counters: Arc<Counters>,
}

impl PersistenceBridge {
    /// Start loading `doc`'s snapshot and persisting every later change.
    ///
    /// Returns immediately; the load completes in the background.
    pub fn bind(
        doc: Arc<SharedDocument>,
        store: Arc<dyn SnapshotStore>,
    ) -> Result<Self, PersistenceError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| PersistenceError::NoRuntime)?;
        let note_id = doc.note_id().to_string();

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let subscription = doc.observe_updates(move |origin, _| {
            // The loaded snapshot is already what the store holds.
            if origin != TxnOrigin::Persistence {
                let _ = signal_tx.send(());
            }
        })?;

        let (loaded_tx, loaded) = watch::channel(false);
        let counters = Arc::new(Counters::default());
        let writer = runtime.spawn(run_writer(
            doc,
            store,
            signal_rx,
            loaded_tx,
            counters.clone(),
        ));

        log::debug!("persistence bound for {note_id}");
        Ok(Self {
            note_id,
            subscription: Some(subscription),
            writer: Some(writer),
            loaded,
            counters,
        })
    }

    pub fn note_id(&self) -> &str {
        &self.note_id
    }

    pub fn is_loaded(&self) -> bool {
        *self.loaded.borrow()
    }

    /// Resolve once the bind-time load has been applied (or given up on).
    pub async fn wait_loaded(&self) {
        let mut loaded = self.loaded.clone();
        let _ = loaded.wait_for(|done| *done).await;
    }

    pub fn stats(&self) -> PersistenceStats {
        PersistenceStats {
            writes_completed: self.counters.writes_completed.load(Ordering::SeqCst),
            writes_failed: self.counters.writes_failed.load(Ordering::SeqCst),
            loaded_bytes: self.counters.loaded_bytes.load(Ordering::SeqCst),
        }
    }

    /// Stop observing and wait for already-queued writes to finish.
    /// No extra flush is performed.
    pub async fn unbind(mut self) -> PersistenceStats {
        self.subscription.take();
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.await {
                log::error!("persistence writer for {} ended abnormally: {e}", self.note_id);
            }
        }
        log::debug!("persistence unbound for {}", self.note_id);
        self.stats()
    }
}

impl Drop for PersistenceBridge {
    fn drop(&mut self) {
        // Dropping the subscription closes the signal channel; the writer
        // drains what is queued and exits on its own.
        self.subscription.take();
    }
}

async fn run_writer(
    doc: Arc<SharedDocument>,
    store: Arc<dyn SnapshotStore>,
    mut signals: mpsc::UnboundedReceiver<()>,
    loaded: watch::Sender<bool>,
    counters: Arc<Counters>,
) {
    let note_id = doc.note_id().to_string();

    match load(&doc, store.clone()).await {
        Ok(0) => log::debug!("no stored snapshot for {note_id}, starting empty"),
        Ok(bytes) => {
            counters.loaded_bytes.store(bytes as u64, Ordering::SeqCst);
            log::info!("loaded snapshot for {note_id} ({bytes} bytes)");
        }
        Err(e) => log::warn!("snapshot load for {note_id} failed, starting empty: {e}"),
    }
    let _ = loaded.send(true);

    while signals.recv().await.is_some() {
        match save(&doc, store.clone()).await {
            Ok(size) => {
                counters.writes_completed.fetch_add(1, Ordering::SeqCst);
                log::trace!("persisted {note_id} ({size} bytes)");
            }
            Err(PersistenceError::Document(DocumentError::Destroyed(_))) => break,
            Err(e) => {
                counters.writes_failed.fetch_add(1, Ordering::SeqCst);
                log::error!("failed to persist {note_id}: {e}");
            }
        }
    }
}

async fn load(doc: &SharedDocument, store: Arc<dyn SnapshotStore>) -> Result<usize, PersistenceError> {
    let note_id = doc.note_id().to_string();
    let snapshot = tokio::task::spawn_blocking(move || store.load_snapshot(&note_id))
        .await
        .map_err(|e| PersistenceError::Task(e.to_string()))??;

    match snapshot {
        Some(bytes) if !bytes.is_empty() => {
            doc.apply_persisted_snapshot(&bytes)?;
            Ok(bytes.len())
        }
        _ => Ok(0),
    }
}

async fn save(doc: &Arc<SharedDocument>, store: Arc<dyn SnapshotStore>) -> Result<usize, PersistenceError> {
    let doc = doc.clone();
    tokio::task::spawn_blocking(move || {
        let snapshot = doc.encode_full_state()?;
        store.save_snapshot(doc.note_id(), &snapshot)?;
        Ok(snapshot.len())
    })
    .await
    .map_err(|e| PersistenceError::Task(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use notesync_core::{LocalOrigin, StrokeAdapter, Stroke};
    use std::time::Duration;
    use yrs::Array;

    async fn settle(bridge: &PersistenceBridge, writes: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let stats = bridge.stats();
                if stats.writes_completed + stats.writes_failed >= writes {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_missing_snapshot_starts_empty() {
        let store = Arc::new(MemoryStore::new());
        let doc = Arc::new(SharedDocument::new("n1"));
        let bridge = PersistenceBridge::bind(doc.clone(), store.clone()).unwrap();
        bridge.wait_loaded().await;

        assert!(bridge.is_loaded());
        assert_eq!(bridge.stats().loaded_bytes, 0);
        assert_eq!(doc.array_len("strokes").unwrap(), 0);
        assert_eq!(store.save_attempts(), 0);
    }

    #[tokio::test]
    async fn test_existing_snapshot_is_applied() {
        let source = SharedDocument::new("n1");
        source
            .transact(LocalOrigin::Handwrite, |txn, c| {
                c.strokes.push_back(txn, "s");
            })
            .unwrap();
        let store = Arc::new(MemoryStore::new().with_snapshot("n1", source.encode_full_state().unwrap()));

        let doc = Arc::new(SharedDocument::new("n1"));
        let bridge = PersistenceBridge::bind(doc.clone(), store.clone()).unwrap();
        bridge.wait_loaded().await;

        assert_eq!(doc.array_len("strokes").unwrap(), 1);
        assert!(bridge.stats().loaded_bytes > 0);
        // Applying the stored state is not itself persisted again.
        assert_eq!(bridge.unbind().await.writes_completed, 0);
    }

    #[tokio::test]
    async fn test_load_failure_is_not_fatal() {
        let store = Arc::new(MemoryStore::new().with_snapshot("n1", vec![1, 2, 3]));
        store.set_failing(true);
        let doc = Arc::new(SharedDocument::new("n1"));
        let bridge = PersistenceBridge::bind(doc.clone(), store.clone()).unwrap();
        bridge.wait_loaded().await;
        assert_eq!(bridge.stats().loaded_bytes, 0);
        assert!(!doc.is_destroyed());
    }

    #[tokio::test]
    async fn test_every_update_overwrites_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let doc = Arc::new(SharedDocument::new("n1"));
        let bridge = PersistenceBridge::bind(doc.clone(), store.clone()).unwrap();
        bridge.wait_loaded().await;

        let adapter = StrokeAdapter::new(doc.clone());
        adapter.sync_to_local(&vec![Stroke::new("a", "#000", 1.0)]).unwrap();
        adapter.sync_to_local(&vec![Stroke::new("b", "#000", 1.0)]).unwrap();
        settle(&bridge, 2).await;

        let restored = SharedDocument::new("n1");
        restored
            .apply_persisted_snapshot(&store.snapshot("n1").unwrap())
            .unwrap();
        let strokes = StrokeAdapter::new(Arc::new(restored)).read().unwrap();
        assert_eq!(strokes.len(), 1);
        assert_eq!(strokes[0].id, "b");
        assert_eq!(bridge.unbind().await.writes_completed, 2);
    }

    #[tokio::test]
    async fn test_unbind_stops_persisting() {
        let store = Arc::new(MemoryStore::new());
        let doc = Arc::new(SharedDocument::new("n1"));
        let bridge = PersistenceBridge::bind(doc.clone(), store.clone()).unwrap();
        bridge.unbind().await;

        StrokeAdapter::new(doc)
            .sync_to_local(&vec![Stroke::new("late", "#000", 1.0)])
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.save_attempts(), 0);
    }

    #[test]
    fn test_bind_outside_runtime_fails() {
        let doc = Arc::new(SharedDocument::new("n1"));
        let result = PersistenceBridge::bind(doc, Arc::new(MemoryStore::new()));
        assert!(matches!(result, Err(PersistenceError::NoRuntime)));
    }
}
