//! Page ordering and backgrounds for the root note being edited.

use std::sync::{Arc, Mutex, MutexGuard};

use notesync_core::{DocumentError, ObserverHandle, PageIdsDiff, PageStructure};

use crate::transport::{ConnectionState, TransportConfig, TransportError, TransportSession};

struct Domain {
    structure: PageStructure,
    transport: Arc<TransportSession>,
}

impl Domain {
    fn teardown(self) {
        self.transport.destroy();
        self.structure.destroy();
        log::info!("page structure for {} torn down", self.structure.root_note_id());
    }
}

/// Holds at most one page-structure domain, scoped to one root note.
///
/// The domain is a dedicated replica of the root note's room: it syncs over
/// its own connection to `note-{root}` and only touches the page containers.
pub struct PageStructureCoordinator {
    config: TransportConfig,
    domain: Mutex<Option<Domain>>,
    /// Page ids recorded before `initialize`.
    cache: Mutex<Vec<String>>,
}

impl PageStructureCoordinator {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            domain: Mutex::new(None),
            cache: Mutex::new(Vec::new()),
        }
    }

    /// Attach to `root_note_id`, replacing any domain for a different root.
    /// Re-initializing the current root is a no-op.
    pub fn initialize(&self, root_note_id: &str) -> Result<(), TransportError> {
        let mut domain = self.lock_domain();
        if let Some(current) = domain.as_ref() {
            if current.structure.root_note_id() == root_note_id {
                return Ok(());
            }
        }
        if let Some(previous) = domain.take() {
            previous.teardown();
        }

        let structure = PageStructure::new(root_note_id);
        let transport = Arc::new(TransportSession::new(structure.document().clone(), self.config.clone()));
        if let Err(e) = transport.connect() {
            structure.destroy();
            return Err(e);
        }
        log::info!("page structure initialized for {root_note_id}");
        *domain = Some(Domain { structure, transport });
        Ok(())
    }

    pub fn root_note_id(&self) -> Option<String> {
        self.lock_domain()
            .as_ref()
            .map(|d| d.structure.root_note_id().to_string())
    }

    pub fn is_initialized(&self) -> bool {
        self.lock_domain().is_some()
    }

    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.lock_domain().as_ref().map(|d| d.transport.state())
    }

    pub fn transport(&self) -> Option<Arc<TransportSession>> {
        self.lock_domain().as_ref().map(|d| d.transport.clone())
    }

    /// Apply `ids` as a minimal diff. Before `initialize` only the local
    /// cache is updated and `None` is returned.
    pub fn set_page_ids(&self, ids: &[String]) -> Result<Option<PageIdsDiff>, DocumentError> {
        *self.lock_cache() = ids.to_vec();
        match self.lock_domain().as_ref() {
            Some(domain) => domain.structure.set_page_ids(ids).map(Some),
            None => Ok(None),
        }
    }

    pub fn page_ids(&self) -> Vec<String> {
        match self.lock_domain().as_ref() {
            Some(domain) => domain.structure.page_ids(),
            None => self.lock_cache().clone(),
        }
    }

    /// `callback(all_ids, added_ids)` for changes made elsewhere. `None`
    /// before `initialize`.
    pub fn observe_page_ids<F>(&self, callback: F) -> Result<Option<ObserverHandle>, DocumentError>
    where
        F: Fn(&[String], &[String]) + Send + Sync + 'static,
    {
        match self.lock_domain().as_ref() {
            Some(domain) => domain.structure.observe_page_ids(callback).map(Some),
            None => Ok(None),
        }
    }

    /// Returns `false` when there is no domain to write to.
    pub fn set_page_background(&self, index: usize, url: &str) -> Result<bool, DocumentError> {
        match self.lock_domain().as_ref() {
            Some(domain) => domain.structure.set_page_background(index, url).map(|_| true),
            None => Ok(false),
        }
    }

    pub fn page_background(&self, index: usize) -> Result<Option<String>, DocumentError> {
        match self.lock_domain().as_ref() {
            Some(domain) => domain.structure.page_background(index),
            None => Ok(None),
        }
    }

    pub fn observe_page_backgrounds<F>(&self, callback: F) -> Result<Option<ObserverHandle>, DocumentError>
    where
        F: Fn(usize, Option<&str>) + Send + Sync + 'static,
    {
        match self.lock_domain().as_ref() {
            Some(domain) => domain.structure.observe_page_backgrounds(callback).map(Some),
            None => Ok(None),
        }
    }

    /// Disconnect and free the current domain, if any.
    pub fn destroy(&self) {
        let domain = self.lock_domain().take();
        if let Some(domain) = domain {
            domain.teardown();
        }
        self.lock_cache().clear();
    }

    fn lock_domain(&self) -> MutexGuard<'_, Option<Domain>> {
        self.domain.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_cache(&self) -> MutexGuard<'_, Vec<String>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for PageStructureCoordinator {
    fn drop(&mut self) {
        self.destroy();
    }
}
