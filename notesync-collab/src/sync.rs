//! Entry points used by editors: join a note in one mode, push local
//! content, leave.

use std::sync::Arc;

use notesync_core::{
    AdapterCallbacks, Containers, DocumentError, EditingMode, Frame, FrameAdapter, ObserverHandle,
    SharedDocument, Stroke, StrokeAdapter, TextAdapter,
};
use thiserror::Error;

use crate::coordinator::PageStructureCoordinator;
use crate::registry::ReplicaRegistry;
use crate::transport::{TransportConfig, TransportError, TransportSession};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Document(#[from] DocumentError),
}

/// A value for one content mode.
#[derive(Debug, Clone, PartialEq)]
pub enum NoteContent {
    Text(String),
    Frames(Vec<Frame>),
    Strokes(Vec<Stroke>),
}

impl NoteContent {
    pub fn mode(&self) -> EditingMode {
        match self {
            NoteContent::Text(_) => EditingMode::Word,
            NoteContent::Frames(_) => EditingMode::Ppt,
            NoteContent::Strokes(_) => EditingMode::Handwrite,
        }
    }
}

/// Callbacks for the mode being joined; the variant selects the mode.
pub enum ContentCallbacks {
    Text(AdapterCallbacks<String>),
    Frames(AdapterCallbacks<Vec<Frame>>),
    Strokes(AdapterCallbacks<Vec<Stroke>>),
}

impl ContentCallbacks {
    pub fn mode(&self) -> EditingMode {
        match self {
            ContentCallbacks::Text(_) => EditingMode::Word,
            ContentCallbacks::Frames(_) => EditingMode::Ppt,
            ContentCallbacks::Strokes(_) => EditingMode::Handwrite,
        }
    }
}

/// Everything a renderer may need to reach a note's replica directly.
#[derive(Clone)]
pub struct ReplicaHandles {
    pub document: Arc<SharedDocument>,
    pub containers: Containers,
    pub transport: Option<Arc<TransportSession>>,
}

pub struct NoteSync {
    registry: ReplicaRegistry,
    pages: PageStructureCoordinator,
}

impl Default for NoteSync {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

impl NoteSync {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            pages: PageStructureCoordinator::new(config.clone()),
            registry: ReplicaRegistry::new(config),
        }
    }

    pub fn registry(&self) -> &ReplicaRegistry {
        &self.registry
    }

    pub fn pages(&self) -> &PageStructureCoordinator {
        &self.pages
    }

    /// Open (or reuse) `note_id`'s replica, connect it, and deliver remote
    /// changes for the mode selected by `callbacks`.
    ///
    /// Callbacks run inside the document's commit: they must not read or
    /// write the same document synchronously. Writes attempted from them
    /// are dropped.
    pub fn join_note(&self, note_id: &str, callbacks: ContentCallbacks) -> Result<ObserverHandle, SyncError> {
        let doc = self.registry.get_or_create_document(note_id);
        let mode = callbacks.mode();

        // Observe first so content arriving with the handshake is delivered.
        let handle = match callbacks {
            ContentCallbacks::Text(cb) => TextAdapter::new(doc).observe_remote(cb)?,
            ContentCallbacks::Frames(cb) => FrameAdapter::new(doc).observe_remote(cb)?,
            ContentCallbacks::Strokes(cb) => StrokeAdapter::new(doc).observe_remote(cb)?,
        };
        self.registry.get_or_create_transport(note_id).connect()?;
        log::debug!("joined {note_id} in {mode:?} mode");
        Ok(handle)
    }

    /// Disconnect `note_id`, or every note when `None`. Documents are kept.
    pub fn leave_note(&self, note_id: Option<&str>) -> usize {
        match note_id {
            Some(id) => usize::from(self.registry.disconnect(id)),
            None => self.registry.disconnect_all(),
        }
    }

    /// Write a local value. `Ok(false)` if the write was suppressed because
    /// it happened while a remote change was being delivered.
    pub fn sync_content(&self, note_id: &str, content: &NoteContent) -> Result<bool, SyncError> {
        let doc = self.registry.get_or_create_document(note_id);
        let written = match content {
            NoteContent::Text(text) => TextAdapter::new(doc).sync_to_local(text)?,
            NoteContent::Frames(frames) => FrameAdapter::new(doc).sync_to_local(frames)?,
            NoteContent::Strokes(strokes) => StrokeAdapter::new(doc).sync_to_local(strokes)?,
        };
        Ok(written)
    }

    /// Current value of one mode.
    pub fn content(&self, note_id: &str, mode: EditingMode) -> Result<Option<NoteContent>, SyncError> {
        let Some(doc) = self.registry.document(note_id) else {
            return Ok(None);
        };
        let content = match mode {
            EditingMode::Word => NoteContent::Text(TextAdapter::new(doc).read()?),
            EditingMode::Ppt => NoteContent::Frames(FrameAdapter::new(doc).read()?),
            EditingMode::Handwrite => NoteContent::Strokes(StrokeAdapter::new(doc).read()?),
        };
        Ok(Some(content))
    }

    pub fn replica_handles(&self, note_id: &str) -> Option<ReplicaHandles> {
        let document = self.registry.document(note_id)?;
        Some(ReplicaHandles {
            containers: document.containers().clone(),
            transport: self.registry.transport(note_id),
            document,
        })
    }

    /// Free one note's replica.
    pub fn destroy_note(&self, note_id: &str) -> bool {
        self.registry.destroy(note_id)
    }

    /// Free every replica and the page-structure domain.
    pub fn destroy_all(&self) -> usize {
        self.pages.destroy();
        self.registry.destroy_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notesync_core::FrameType;
    use std::sync::Mutex;

    fn offline() -> NoteSync {
        NoteSync::new(TransportConfig {
            server_url: "ws://127.0.0.1:1".to_string(),
            ..TransportConfig::default()
        })
    }

    #[test]
    fn test_content_mode() {
        assert_eq!(NoteContent::Text(String::new()).mode(), EditingMode::Word);
        assert_eq!(NoteContent::Frames(vec![]).mode(), EditingMode::Ppt);
        assert_eq!(NoteContent::Strokes(vec![]).mode(), EditingMode::Handwrite);
    }

    #[test]
    fn test_sync_content_without_join() {
        let sync = offline();
        let frames = vec![Frame::new("f1", FrameType::Shape, 0.0, 0.0, 1.0, 1.0)];
        assert!(sync.sync_content("n1", &NoteContent::Frames(frames.clone())).unwrap());
        assert_eq!(
            sync.content("n1", EditingMode::Ppt).unwrap(),
            Some(NoteContent::Frames(frames))
        );
        assert_eq!(sync.content("missing", EditingMode::Ppt).unwrap(), None);
    }

    #[tokio::test]
    async fn test_join_delivers_initial_content() {
        let sync = offline();
        sync.sync_content("n1", &NoteContent::Text("draft".into())).unwrap();

        let initial = Arc::new(Mutex::new(None));
        let sink = initial.clone();
        let callbacks = AdapterCallbacks::new(|_| {})
            .with_initial_content(move |text: String| *sink.lock().unwrap() = Some(text));
        let handle = sync.join_note("n1", ContentCallbacks::Text(callbacks)).unwrap();

        assert_eq!(initial.lock().unwrap().as_deref(), Some("draft"));
        assert!(handle.is_active());
        let handles = sync.replica_handles("n1").unwrap();
        assert!(handles.transport.is_some());
        assert_eq!(handles.document.note_id(), "n1");
    }

    #[tokio::test]
    async fn test_leave_keeps_documents() {
        let sync = offline();
        sync.join_note("a", ContentCallbacks::Strokes(AdapterCallbacks::new(|_| {}))).unwrap();
        sync.join_note("b", ContentCallbacks::Frames(AdapterCallbacks::new(|_| {}))).unwrap();

        assert_eq!(sync.leave_note(Some("a")), 1);
        assert!(sync.registry().transport("a").is_none());
        assert!(sync.registry().transport("b").is_some());
        assert_eq!(sync.leave_note(None), 1);
        assert_eq!(sync.registry().active_note_ids(), vec!["a", "b"]);

        assert!(sync.destroy_note("a"));
        assert_eq!(sync.destroy_all(), 1);
        assert!(sync.replica_handles("b").is_none());
    }
}
