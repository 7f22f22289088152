//! Page structure of a multi-page note.
//!
//! The ordered list of sub-page note ids lives in the `pageNoteIds` array and
//! per-page background images in the `pageBackgrounds` map (keyed by the page
//! index as a decimal string). Both are scoped to the root note's room.
//!
//! Page-id updates are applied as a minimal diff rather than clear-and-rewrite
//! so a connected peer never observes a transiently empty list.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use yrs::{Any, Array, ArrayRef, Map, MapRef, Observable, Out, ReadTxn, Subscription};

use crate::adapter::ObserverHandle;
use crate::document::{DispatchGuard, DocumentError, SharedDocument};
use crate::origin::LocalOrigin;

pub const PAGE_IDS: &str = "pageNoteIds";
pub const PAGE_BACKGROUNDS: &str = "pageBackgrounds";

/// What a call to [`PageStructure::set_page_ids`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageIdsDiff {
    pub removed: Vec<String>,
    pub inserted: Vec<String>,
    /// Ids that were already present but out of place; each costs one
    /// remove and one insert.
    pub moved: Vec<String>,
}

impl PageIdsDiff {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.inserted.is_empty() && self.moved.is_empty()
    }
}

/// The page-structure CRDT domain for one root note.
pub struct PageStructure {
    doc: Arc<SharedDocument>,
    page_ids: ArrayRef,
    backgrounds: MapRef,
    cache: Arc<Mutex<Vec<String>>>,
    _cache_subscription: Subscription,
}

impl PageStructure {
    pub fn new(root_note_id: impl Into<String>) -> Self {
        let doc = Arc::new(SharedDocument::new(root_note_id));
        let page_ids = doc.array(PAGE_IDS);
        let backgrounds = doc.map(PAGE_BACKGROUNDS);

        let cache = Arc::new(Mutex::new(Vec::new()));
        let sink = cache.clone();
        let array = page_ids.clone();
        let alive = doc.alive_flag();
        let cache_subscription = page_ids.observe(move |txn, _| {
            if alive.load(Ordering::Acquire) {
                *sink.lock().unwrap_or_else(|e| e.into_inner()) = read_ids(txn, &array);
            }
        });

        Self {
            doc,
            page_ids,
            backgrounds,
            cache,
            _cache_subscription: cache_subscription,
        }
    }

    pub fn document(&self) -> &Arc<SharedDocument> {
        &self.doc
    }

    pub fn root_note_id(&self) -> &str {
        self.doc.note_id()
    }

    /// Last known page id list, updated by every local and remote change.
    pub fn page_ids(&self) -> Vec<String> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Bring the replicated list in line with `ids` using the fewest
    /// removals and insertions. Duplicate and empty ids in `ids` are dropped,
    /// keeping the first occurrence.
    pub fn set_page_ids(&self, ids: &[String]) -> Result<PageIdsDiff, DocumentError> {
        if self.doc.is_dispatching_remote() {
            log::trace!("page id write suppressed during remote dispatch");
            return Ok(PageIdsDiff::default());
        }

        let mut seen = HashSet::new();
        let target: Vec<&String> = ids
            .iter()
            .filter(|id| !id.is_empty() && seen.insert(id.as_str()))
            .collect();
        let wanted: HashSet<&str> = target.iter().map(|id| id.as_str()).collect();

        let array = self.page_ids.clone();
        let diff = self.doc.transact(LocalOrigin::PageStructure, |txn, _| {
            // Non-string entries read as "" and are always removed.
            let mut current: Vec<String> = array
                .iter(&*txn)
                .map(|item| match item {
                    Out::Any(Any::String(s)) => s.to_string(),
                    _ => String::new(),
                })
                .collect();
            let mut diff = PageIdsDiff::default();

            for i in (0..current.len()).rev() {
                if !wanted.contains(current[i].as_str()) {
                    array.remove_range(txn, i as u32, 1);
                    let id = current.remove(i);
                    if !id.is_empty() {
                        diff.removed.push(id);
                    }
                }
            }
            diff.removed.reverse();

            for (i, id) in target.iter().enumerate() {
                if current.get(i) == Some(*id) {
                    continue;
                }
                match current[i..].iter().position(|c| c == *id) {
                    Some(offset) => {
                        array.remove_range(txn, (i + offset) as u32, 1);
                        current.remove(i + offset);
                        diff.moved.push((*id).clone());
                    }
                    None => diff.inserted.push((*id).clone()),
                }
                array.insert(txn, i as u32, id.as_str());
                current.insert(i, (*id).clone());
            }

            // Concurrent inserts of the same id leave duplicates at the tail.
            while current.len() > target.len() {
                let last = current.len() - 1;
                array.remove_range(txn, last as u32, 1);
                diff.removed.push(current.remove(last));
            }
            diff
        })?;

        if !diff.is_empty() {
            log::debug!(
                "page ids for {}: -{} +{} ~{}",
                self.root_note_id(),
                diff.removed.len(),
                diff.inserted.len(),
                diff.moved.len()
            );
        }
        Ok(diff)
    }

    /// Observe page-id changes made by other replicas. `callback` receives the
    /// full list and the ids this observer had not seen before.
    pub fn observe_page_ids<F>(&self, callback: F) -> Result<ObserverHandle, DocumentError>
    where
        F: Fn(&[String], &[String]) + Send + Sync + 'static,
    {
        let array = self.page_ids.clone();
        let known = Mutex::new(self.doc.read(|txn, _| read_ids(txn, &array))?);

        let active = Arc::new(AtomicBool::new(true));
        let subscribed = active.clone();
        let alive = self.doc.alive_flag();
        let dispatching = self.doc.dispatch_key();

        let subscription = self.page_ids.observe(move |txn, _| {
            if !subscribed.load(Ordering::Acquire) || !alive.load(Ordering::Acquire) {
                return;
            }
            let ids = read_ids(txn, &array);
            let mut known = known.lock().unwrap_or_else(|e| e.into_inner());
            if LocalOrigin::PageStructure.matches(txn.origin()) {
                *known = ids;
                return;
            }
            let added: Vec<String> = ids.iter().filter(|id| !known.contains(*id)).cloned().collect();
            *known = ids.clone();
            drop(known);

            let _guard = DispatchGuard::enter(dispatching);
            callback(&ids, &added);
        });

        Ok(ObserverHandle::new(active, vec![subscription]))
    }

    pub fn set_page_background(&self, index: usize, url: &str) -> Result<(), DocumentError> {
        if self.doc.is_dispatching_remote() {
            return Ok(());
        }
        let backgrounds = self.backgrounds.clone();
        self.doc.transact(LocalOrigin::Background, |txn, _| {
            backgrounds.insert(txn, index.to_string(), url);
        })
    }

    pub fn page_background(&self, index: usize) -> Result<Option<String>, DocumentError> {
        let backgrounds = self.backgrounds.clone();
        self.doc.read(|txn, _| match backgrounds.get(txn, &index.to_string()) {
            Some(Out::Any(Any::String(url))) => Some(url.to_string()),
            _ => None,
        })
    }

    /// Observe background changes made by other replicas, one call per
    /// changed page in index order. `None` means the background was removed.
    pub fn observe_page_backgrounds<F>(&self, callback: F) -> Result<ObserverHandle, DocumentError>
    where
        F: Fn(usize, Option<&str>) + Send + Sync + 'static,
    {
        let map = self.backgrounds.clone();
        let known = Mutex::new(self.doc.read(|txn, _| read_backgrounds(txn, &map))?);

        let active = Arc::new(AtomicBool::new(true));
        let subscribed = active.clone();
        let alive = self.doc.alive_flag();
        let dispatching = self.doc.dispatch_key();

        let subscription = self.backgrounds.observe(move |txn, _| {
            if !subscribed.load(Ordering::Acquire) || !alive.load(Ordering::Acquire) {
                return;
            }
            let current = read_backgrounds(txn, &map);
            let mut known = known.lock().unwrap_or_else(|e| e.into_inner());
            if LocalOrigin::Background.matches(txn.origin()) {
                *known = current;
                return;
            }
            let changed: Vec<(usize, Option<String>)> = current
                .iter()
                .filter(|(index, url)| known.get(*index) != Some(*url))
                .map(|(index, url)| (*index, Some(url.clone())))
                .chain(
                    known
                        .keys()
                        .filter(|index| !current.contains_key(*index))
                        .map(|index| (*index, None)),
                )
                .collect::<BTreeMap<_, _>>()
                .into_iter()
                .collect();
            *known = current;
            drop(known);

            let _guard = DispatchGuard::enter(dispatching);
            for (index, url) in changed {
                callback(index, url.as_deref());
            }
        });

        Ok(ObserverHandle::new(active, vec![subscription]))
    }

    /// Release the document; outstanding observers stop firing.
    pub fn destroy(&self) {
        self.doc.destroy();
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

fn read_ids<T: ReadTxn>(txn: &T, array: &ArrayRef) -> Vec<String> {
    array
        .iter(txn)
        .filter_map(|item| match item {
            Out::Any(Any::String(id)) => Some(id.to_string()),
            _ => None,
        })
        .collect()
}

/// Background entries keyed by page index; non-numeric keys are ignored.
fn read_backgrounds<T: ReadTxn>(txn: &T, map: &MapRef) -> BTreeMap<usize, String> {
    map.iter(txn)
        .filter_map(|(key, value)| {
            let index = key.parse::<usize>().ok()?;
            match value {
                Out::Any(Any::String(url)) => Some((index, url.to_string())),
                _ => None,
            }
        })
        .collect()
}
