//! The replicated document for one note.
//!
//! A [`SharedDocument`] wraps a yrs [`Doc`] and exposes the four named
//! containers every note carries. All local mutations go through
//! [`SharedDocument::transact`] so they are tagged with a [`LocalOrigin`];
//! remote deltas and persisted snapshots are applied with their own tags so
//! observers can tell them apart.
//!
//! Merging is commutative and idempotent: applying the same set of deltas in
//! any order, any number of times, yields the same state on every replica.

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, ArrayRef, Doc, GetString, Map, MapRef, Out, ReadTxn, StateVector, Subscription,
    TextRef, Transact, Transaction, TransactionMut, Update,
};

use crate::adapter::HTML_KEY;
use crate::origin::{LocalOrigin, TxnOrigin, PERSISTENCE_TAG, REMOTE_TAG};

static NEXT_DISPATCH_KEY: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Documents whose remote changes are being delivered on this thread.
    static DISPATCHING: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("document `{0}` has been destroyed")]
    Destroyed(String),

    #[error("malformed delta: {0}")]
    Decode(String),

    #[error("failed to apply delta: {0}")]
    Apply(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to register observer: {0}")]
    Subscribe(String),
}

/// The four containers of a note document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerName {
    RichText,
    WordState,
    Frames,
    Strokes,
}

impl ContainerName {
    pub const ALL: [ContainerName; 4] = [
        ContainerName::RichText,
        ContainerName::WordState,
        ContainerName::Frames,
        ContainerName::Strokes,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            ContainerName::RichText => "richText",
            ContainerName::WordState => "wordState",
            ContainerName::Frames => "frames",
            ContainerName::Strokes => "strokes",
        }
    }
}

/// A raw container reference, for callers that bind their own editor
/// directly to the replicated structure.
#[derive(Clone)]
pub enum ContainerHandle {
    Text(TextRef),
    Map(MapRef),
    Array(ArrayRef),
}

/// Root references resolved once at construction.
#[derive(Clone)]
pub struct Containers {
    pub rich_text: TextRef,
    pub word_state: MapRef,
    pub frames: ArrayRef,
    pub strokes: ArrayRef,
}

impl Containers {
    fn resolve(doc: &Doc) -> Self {
        Self {
            rich_text: doc.get_or_insert_text(ContainerName::RichText.as_str()),
            word_state: doc.get_or_insert_map(ContainerName::WordState.as_str()),
            frames: doc.get_or_insert_array(ContainerName::Frames.as_str()),
            strokes: doc.get_or_insert_array(ContainerName::Strokes.as_str()),
        }
    }
}

/// Replicated state of one note.
pub struct SharedDocument {
    note_id: String,
    doc: Doc,
    containers: Containers,
    alive: Arc<AtomicBool>,
    dispatch_key: DispatchKey,
}

impl SharedDocument {
    pub fn new(note_id: impl Into<String>) -> Self {
        let doc = Doc::new();
        let containers = Containers::resolve(&doc);
        Self {
            note_id: note_id.into(),
            doc,
            containers,
            alive: Arc::new(AtomicBool::new(true)),
            dispatch_key: DispatchKey(NEXT_DISPATCH_KEY.fetch_add(1, Ordering::Relaxed)),
        }
    }

    pub fn note_id(&self) -> &str {
        &self.note_id
    }

    pub fn containers(&self) -> &Containers {
        &self.containers
    }

    pub fn container(&self, name: ContainerName) -> ContainerHandle {
        match name {
            ContainerName::RichText => ContainerHandle::Text(self.containers.rich_text.clone()),
            ContainerName::WordState => ContainerHandle::Map(self.containers.word_state.clone()),
            ContainerName::Frames => ContainerHandle::Array(self.containers.frames.clone()),
            ContainerName::Strokes => ContainerHandle::Array(self.containers.strokes.clone()),
        }
    }

    /// Named array root outside the four note containers.
    pub fn array(&self, name: &str) -> ArrayRef {
        self.doc.get_or_insert_array(name)
    }

    /// Named map root outside the four note containers.
    pub fn map(&self, name: &str) -> MapRef {
        self.doc.get_or_insert_map(name)
    }

    /// Run `f` inside one transaction tagged with `origin`. Every change made
    /// in `f` is emitted as a single delta.
    pub fn transact<R>(
        &self,
        origin: LocalOrigin,
        f: impl FnOnce(&mut TransactionMut, &Containers) -> R,
    ) -> Result<R, DocumentError> {
        self.ensure_alive()?;
        let mut txn = self.doc.transact_mut_with(origin.origin());
        Ok(f(&mut txn, &self.containers))
    }

    /// Run `f` against a read-only view of the current state.
    pub fn read<R>(
        &self,
        f: impl FnOnce(&Transaction<'_>, &Containers) -> R,
    ) -> Result<R, DocumentError> {
        self.ensure_alive()?;
        let txn = self.doc.transact();
        Ok(f(&txn, &self.containers))
    }

    /// Merge a delta received from a peer.
    pub fn apply_remote_delta(&self, delta: &[u8]) -> Result<(), DocumentError> {
        self.apply_tagged(delta, REMOTE_TAG)
    }

    /// Merge a snapshot read back from durable storage.
    pub fn apply_persisted_snapshot(&self, snapshot: &[u8]) -> Result<(), DocumentError> {
        self.apply_tagged(snapshot, PERSISTENCE_TAG)
    }

    fn apply_tagged(&self, bytes: &[u8], tag: &str) -> Result<(), DocumentError> {
        self.ensure_alive()?;
        // Decode before opening the transaction so a malformed delta leaves
        // no trace.
        let update = Update::decode_v1(bytes).map_err(|e| DocumentError::Decode(e.to_string()))?;
        {
            let mut txn = self.doc.transact_mut_with(tag);
            txn.apply_update(update)
                .map_err(|e| DocumentError::Apply(e.to_string()))?;
        }
        self.reconcile_text_cache();
        Ok(())
    }

    /// Concurrent text writes merge in `rich_text` but race on the cached
    /// copy in `wordState`. Rewrite the cache whenever the two disagree.
    fn reconcile_text_cache(&self) {
        let Containers {
            rich_text,
            word_state,
            ..
        } = &self.containers;
        let stale = {
            let txn = self.doc.transact();
            let sequence = rich_text.get_string(&txn);
            match word_state.get(&txn, HTML_KEY) {
                Some(Out::Any(Any::String(cached))) if *cached == *sequence => None,
                Some(_) => Some(sequence),
                None => None,
            }
        };
        if let Some(sequence) = stale {
            log::debug!("text cache of {} repaired after merge", self.note_id);
            let mut txn = self.doc.transact_mut_with(LocalOrigin::Word.origin());
            word_state.insert(&mut txn, HTML_KEY, sequence);
        }
    }

    /// Full state as one delta; applying it to an empty replica reproduces
    /// this document.
    pub fn encode_full_state(&self) -> Result<Vec<u8>, DocumentError> {
        self.ensure_alive()?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&StateVector::default()))
    }

    pub fn state_vector(&self) -> Result<Vec<u8>, DocumentError> {
        self.ensure_alive()?;
        let txn = self.doc.transact();
        Ok(txn.state_vector().encode_v1())
    }

    /// Everything this replica has that the peer described by
    /// `remote_state_vector` lacks.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        self.ensure_alive()?;
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| DocumentError::Decode(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Observe every committed transaction as a delta plus its classified
    /// origin. The callback runs synchronously on the committing thread and
    /// must not open a transaction on this document.
    pub fn observe_updates<F>(&self, f: F) -> Result<Subscription, DocumentError>
    where
        F: Fn(TxnOrigin, &[u8]) + Send + Sync + 'static,
    {
        self.ensure_alive()?;
        let alive = self.alive.clone();
        self.doc
            .observe_update_v1(move |txn, event| {
                if !alive.load(Ordering::Acquire) {
                    return;
                }
                f(TxnOrigin::classify(txn.origin()), &event.update);
            })
            .map_err(|e| DocumentError::Subscribe(e.to_string()))
    }

    /// Mark the document as released. Outstanding observers stop firing and
    /// every further operation fails with [`DocumentError::Destroyed`].
    pub fn destroy(&self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            log::debug!("document {} destroyed", self.note_id);
        }
    }

    pub fn is_destroyed(&self) -> bool {
        !self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn alive_flag(&self) -> Arc<AtomicBool> {
        self.alive.clone()
    }

    /// True while a remote change is being delivered to an adapter callback
    /// on the calling thread. Other threads are unaffected.
    pub fn is_dispatching_remote(&self) -> bool {
        DISPATCHING.with(|keys| keys.borrow().contains(&self.dispatch_key.0))
    }

    pub(crate) fn dispatch_key(&self) -> DispatchKey {
        self.dispatch_key
    }

    /// Number of elements in a named array root. Diagnostic helper.
    pub fn array_len(&self, name: &str) -> Result<u32, DocumentError> {
        let array = self.array(name);
        self.read(|txn, _| array.len(txn))
    }

    /// Number of entries in a named map root. Diagnostic helper.
    pub fn map_len(&self, name: &str) -> Result<u32, DocumentError> {
        let map = self.map(name);
        self.read(|txn, _| map.len(txn))
    }

    fn ensure_alive(&self) -> Result<(), DocumentError> {
        if self.is_destroyed() {
            return Err(DocumentError::Destroyed(self.note_id.clone()));
        }
        Ok(())
    }
}

impl fmt::Debug for SharedDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedDocument")
            .field("note_id", &self.note_id)
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DispatchKey(u64);

/// Marks a document as dispatching on the current thread until dropped,
/// including on unwind.
pub(crate) struct DispatchGuard {
    key: DispatchKey,
    _thread_bound: PhantomData<*const ()>,
}

impl DispatchGuard {
    pub(crate) fn enter(key: DispatchKey) -> Self {
        DISPATCHING.with(|keys| keys.borrow_mut().push(key.0));
        Self {
            key,
            _thread_bound: PhantomData,
        }
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        let _ = DISPATCHING.try_with(|keys| {
            let mut keys = keys.borrow_mut();
            if let Some(pos) = keys.iter().rposition(|k| *k == self.key.0) {
                keys.swap_remove(pos);
            }
        });
    }
}
