//! Adapters between editor values and document containers.
//!
//! Each editing mode owns one container shape:
//!
//! | mode      | value         | container                                   |
//! |-----------|---------------|---------------------------------------------|
//! | Word      | `String`      | `richText` sequence + `wordState["html"]`   |
//! | Ppt       | `Vec<Frame>`  | `frames` array of JSON records              |
//! | Handwrite | `Vec<Stroke>` | `strokes` array of JSON records             |
//!
//! Local writes replace the whole container inside one transaction tagged
//! with the mode's origin. Remote observers skip notifications carrying that
//! same tag, so an adapter never hears its own echo.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use yrs::{
    Any, Array, ArrayRef, GetString, Map, Observable, Out, ReadTxn, Subscription, Text,
    TransactionMut,
};

use crate::document::{Containers, DispatchGuard, DocumentError, SharedDocument};
use crate::origin::LocalOrigin;
use crate::{EditingMode, Frame, Stroke};

/// Key of the cached HTML rendering inside `wordState`.
pub const HTML_KEY: &str = "html";

/// Callback invoked from inside a committed transaction.
pub type ChangeFn = Arc<dyn Fn(&TransactionMut, &Containers) + Send + Sync>;

/// How one editing mode maps its value onto the document.
pub trait ContentMode: Send + Sync + 'static {
    type Value: Send + 'static;

    const MODE: EditingMode;
    const ORIGIN: LocalOrigin;

    /// Replace the mode's container contents with `value`.
    fn write(
        txn: &mut TransactionMut,
        containers: &Containers,
        value: &Self::Value,
    ) -> Result<(), DocumentError>;

    fn read<T: ReadTxn>(txn: &T, containers: &Containers) -> Self::Value;

    fn is_empty(value: &Self::Value) -> bool;

    /// Register `f` on the container(s) whose changes this mode reports.
    fn observe(containers: &Containers, f: ChangeFn) -> Subscription;
}

/// Rich text with a cached whole-string copy in `wordState`.
pub struct TextMode;

impl ContentMode for TextMode {
    type Value = String;

    const MODE: EditingMode = EditingMode::Word;
    const ORIGIN: LocalOrigin = LocalOrigin::Word;

    fn write(
        txn: &mut TransactionMut,
        containers: &Containers,
        value: &String,
    ) -> Result<(), DocumentError> {
        let text = &containers.rich_text;
        let len = text.len(&*txn);
        if len > 0 {
            text.remove_range(txn, 0, len);
        }
        if !value.is_empty() {
            text.insert(txn, 0, value);
        }
        // Same transaction as the sequence write; observers never see them apart.
        containers.word_state.insert(txn, HTML_KEY, value.as_str());
        Ok(())
    }

    /// The sequence is authoritative; the cache may briefly lag it after a
    /// concurrent merge until [`SharedDocument`] repairs it.
    fn read<T: ReadTxn>(txn: &T, containers: &Containers) -> String {
        containers.rich_text.get_string(txn)
    }

    fn is_empty(value: &String) -> bool {
        value.is_empty()
    }

    fn observe(containers: &Containers, f: ChangeFn) -> Subscription {
        let owned = containers.clone();
        containers
            .rich_text
            .observe(move |txn, _| f(txn, &owned))
    }
}

/// Slide frames, one JSON record per array element.
pub struct FrameMode;

impl ContentMode for FrameMode {
    type Value = Vec<Frame>;

    const MODE: EditingMode = EditingMode::Ppt;
    const ORIGIN: LocalOrigin = LocalOrigin::Ppt;

    fn write(
        txn: &mut TransactionMut,
        containers: &Containers,
        value: &Vec<Frame>,
    ) -> Result<(), DocumentError> {
        write_records(txn, &containers.frames, value)
    }

    fn read<T: ReadTxn>(txn: &T, containers: &Containers) -> Vec<Frame> {
        read_records(txn, &containers.frames, "frame")
    }

    fn is_empty(value: &Vec<Frame>) -> bool {
        value.is_empty()
    }

    fn observe(containers: &Containers, f: ChangeFn) -> Subscription {
        observe_array(containers, &containers.frames, f)
    }
}

/// Ink strokes, one JSON record per array element.
pub struct StrokeMode;

impl ContentMode for StrokeMode {
    type Value = Vec<Stroke>;

    const MODE: EditingMode = EditingMode::Handwrite;
    const ORIGIN: LocalOrigin = LocalOrigin::Handwrite;

    fn write(
        txn: &mut TransactionMut,
        containers: &Containers,
        value: &Vec<Stroke>,
    ) -> Result<(), DocumentError> {
        write_records(txn, &containers.strokes, value)
    }

    fn read<T: ReadTxn>(txn: &T, containers: &Containers) -> Vec<Stroke> {
        read_records(txn, &containers.strokes, "stroke")
    }

    fn is_empty(value: &Vec<Stroke>) -> bool {
        value.is_empty()
    }

    fn observe(containers: &Containers, f: ChangeFn) -> Subscription {
        observe_array(containers, &containers.strokes, f)
    }
}

fn write_records<R: Serialize>(
    txn: &mut TransactionMut,
    array: &ArrayRef,
    records: &[R],
) -> Result<(), DocumentError> {
    // Encode everything first so a bad record leaves the container untouched.
    let encoded = records
        .iter()
        .map(serde_json::to_string)
        .collect::<Result<Vec<_>, _>>()?;

    let len = array.len(&*txn);
    if len > 0 {
        array.remove_range(txn, 0, len);
    }
    for json in encoded {
        array.push_back(txn, json);
    }
    Ok(())
}

fn read_records<R: DeserializeOwned, T: ReadTxn>(txn: &T, array: &ArrayRef, kind: &str) -> Vec<R> {
    array
        .iter(txn)
        .filter_map(|item| match item {
            Out::Any(Any::String(json)) => match serde_json::from_str(&json) {
                Ok(record) => Some(record),
                Err(e) => {
                    log::warn!("skipping malformed {} record: {}", kind, e);
                    None
                }
            },
            _ => {
                log::warn!("skipping non-string {} entry", kind);
                None
            }
        })
        .collect()
}

fn observe_array(containers: &Containers, array: &ArrayRef, f: ChangeFn) -> Subscription {
    let owned = containers.clone();
    array.observe(move |txn, _| f(txn, &owned))
}

/// Callbacks registered through [`ModeSyncAdapter::observe_remote`].
pub struct AdapterCallbacks<V> {
    on_initial_content: Option<Box<dyn FnOnce(V) + Send>>,
    on_content_change: Arc<dyn Fn(V) + Send + Sync>,
}

impl<V> AdapterCallbacks<V> {
    pub fn new(on_content_change: impl Fn(V) + Send + Sync + 'static) -> Self {
        Self {
            on_initial_content: None,
            on_content_change: Arc::new(on_content_change),
        }
    }

    /// Called once, synchronously, if the container already holds content.
    pub fn with_initial_content(mut self, f: impl FnOnce(V) + Send + 'static) -> Self {
        self.on_initial_content = Some(Box::new(f));
        self
    }
}

/// Live registration returned by the observe calls.
///
/// Unsubscribing is idempotent and takes effect before any in-flight
/// notification is delivered. Dropping the handle unsubscribes too.
pub struct ObserverHandle {
    active: Arc<AtomicBool>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl ObserverHandle {
    pub fn new(active: Arc<AtomicBool>, subscriptions: Vec<Subscription>) -> Self {
        Self {
            active,
            subscriptions: Mutex::new(subscriptions),
        }
    }

    /// A handle that observes nothing.
    pub fn inactive() -> Self {
        Self::new(Arc::new(AtomicBool::new(false)), Vec::new())
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn unsubscribe(&self) {
        self.active.store(false, Ordering::Release);
        let subs = std::mem::take(&mut *self.subscriptions.lock().unwrap_or_else(|e| e.into_inner()));
        drop(subs);
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for ObserverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverHandle")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Binds one content mode of one document to an editor.
pub struct ModeSyncAdapter<M: ContentMode> {
    doc: Arc<SharedDocument>,
    _mode: PhantomData<fn() -> M>,
}

pub type TextAdapter = ModeSyncAdapter<TextMode>;
pub type FrameAdapter = ModeSyncAdapter<FrameMode>;
pub type StrokeAdapter = ModeSyncAdapter<StrokeMode>;

impl<M: ContentMode> ModeSyncAdapter<M> {
    pub fn new(doc: Arc<SharedDocument>) -> Self {
        Self {
            doc,
            _mode: PhantomData,
        }
    }

    pub fn document(&self) -> &Arc<SharedDocument> {
        &self.doc
    }

    pub fn mode(&self) -> EditingMode {
        M::MODE
    }

    /// Replace the container with `value`.
    ///
    /// Returns `Ok(false)` without touching the document when called while a
    /// remote change is being delivered, which breaks re-broadcast loops.
    pub fn sync_to_local(&self, value: &M::Value) -> Result<bool, DocumentError> {
        if self.doc.is_dispatching_remote() {
            log::trace!("{:?} write suppressed during remote dispatch", M::MODE);
            return Ok(false);
        }
        self.doc
            .transact(M::ORIGIN, |txn, containers| M::write(txn, containers, value))??;
        Ok(true)
    }

    /// Current materialized value.
    pub fn read(&self) -> Result<M::Value, DocumentError> {
        self.doc.read(|txn, containers| M::read(txn, containers))
    }

    /// Deliver every change not produced by this mode's own writes.
    pub fn observe_remote(
        &self,
        callbacks: AdapterCallbacks<M::Value>,
    ) -> Result<ObserverHandle, DocumentError> {
        let AdapterCallbacks {
            on_initial_content,
            on_content_change,
        } = callbacks;

        let current = self.read()?;
        if !M::is_empty(&current) {
            if let Some(initial) = on_initial_content {
                initial(current);
            }
        }

        let active = Arc::new(AtomicBool::new(true));
        let subscribed = active.clone();
        let alive = self.doc.alive_flag();
        let dispatching = self.doc.dispatch_key();

        let subscription = M::observe(
            self.doc.containers(),
            Arc::new(move |txn: &TransactionMut, containers: &Containers| {
                if !subscribed.load(Ordering::Acquire) || !alive.load(Ordering::Acquire) {
                    return;
                }
                if M::ORIGIN.matches(txn.origin()) {
                    return;
                }
                let value = M::read(txn, containers);
                let _guard = DispatchGuard::enter(dispatching);
                on_content_change(value);
            }),
        );

        Ok(ObserverHandle::new(active, vec![subscription]))
    }
}

impl<M: ContentMode> Clone for ModeSyncAdapter<M> {
    fn clone(&self) -> Self {
        Self::new(self.doc.clone())
    }
}
