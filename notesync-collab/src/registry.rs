//! Lifecycle of the replicas a process holds open.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use notesync_core::SharedDocument;

use crate::transport::{TransportConfig, TransportSession};

struct Replica {
    doc: Arc<SharedDocument>,
    transport: Option<Arc<TransportSession>>,
}

/// Get-or-create cache of documents and their transports, keyed by note id.
///
/// Entries live until [`destroy`](Self::destroy) or
/// [`destroy_all`](Self::destroy_all); nothing is evicted automatically.
pub struct ReplicaRegistry {
    config: TransportConfig,
    replicas: Mutex<HashMap<String, Replica>>,
}

impl Default for ReplicaRegistry {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

impl ReplicaRegistry {
    /// `config` is used for every transport this registry creates.
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            replicas: Mutex::new(HashMap::new()),
        }
    }

    pub fn transport_config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn get_or_create_document(&self, note_id: &str) -> Arc<SharedDocument> {
        let mut replicas = self.lock();
        replicas
            .entry(note_id.to_string())
            .or_insert_with(|| {
                log::debug!("creating replica for {note_id}");
                Replica {
                    doc: Arc::new(SharedDocument::new(note_id)),
                    transport: None,
                }
            })
            .doc
            .clone()
    }

    pub fn document(&self, note_id: &str) -> Option<Arc<SharedDocument>> {
        self.lock().get(note_id).map(|r| r.doc.clone())
    }

    /// The transport for `note_id`'s document, created (not connected) on
    /// first use.
    pub fn get_or_create_transport(&self, note_id: &str) -> Arc<TransportSession> {
        let mut replicas = self.lock();
        let replica = replicas.entry(note_id.to_string()).or_insert_with(|| Replica {
            doc: Arc::new(SharedDocument::new(note_id)),
            transport: None,
        });
        let doc = replica.doc.clone();
        replica
            .transport
            .get_or_insert_with(|| Arc::new(TransportSession::new(doc, self.config.clone())))
            .clone()
    }

    pub fn transport(&self, note_id: &str) -> Option<Arc<TransportSession>> {
        self.lock().get(note_id).and_then(|r| r.transport.clone())
    }

    /// Disconnect and drop `note_id`'s transport, keeping its document.
    pub fn disconnect(&self, note_id: &str) -> bool {
        let transport = self.lock().get_mut(note_id).and_then(|r| r.transport.take());
        match transport {
            Some(transport) => {
                transport.destroy();
                true
            }
            None => false,
        }
    }

    /// [`disconnect`](Self::disconnect) every note.
    pub fn disconnect_all(&self) -> usize {
        let transports: Vec<_> = self
            .lock()
            .values_mut()
            .filter_map(|r| r.transport.take())
            .collect();
        for transport in &transports {
            transport.destroy();
        }
        transports.len()
    }

    /// Disconnect, free and forget `note_id`.
    pub fn destroy(&self, note_id: &str) -> bool {
        let replica = self.lock().remove(note_id);
        match replica {
            Some(replica) => {
                release(replica);
                log::debug!("destroyed replica for {note_id}");
                true
            }
            None => false,
        }
    }

    pub fn destroy_all(&self) -> usize {
        let replicas: Vec<Replica> = self.lock().drain().map(|(_, r)| r).collect();
        let count = replicas.len();
        replicas.into_iter().for_each(release);
        if count > 0 {
            log::info!("destroyed {count} replicas");
        }
        count
    }

    /// Sorted ids of every cached note.
    pub fn active_note_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Replica>> {
        self.replicas.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn release(replica: Replica) {
    if let Some(transport) = replica.transport {
        transport.destroy();
    }
    replica.doc.destroy();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ConnectionState;

    #[test]
    fn test_get_or_create_is_cached() {
        let registry = ReplicaRegistry::default();
        let a = registry.get_or_create_document("n1");
        let b = registry.get_or_create_document("n1");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.document("n2").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_transport_wraps_cached_document() {
        let registry = ReplicaRegistry::default();
        let transport = registry.get_or_create_transport("n1");
        let doc = registry.get_or_create_document("n1");
        assert!(Arc::ptr_eq(transport.document(), &doc));
        assert!(Arc::ptr_eq(&transport, &registry.get_or_create_transport("n1")));
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_destroy_frees_and_evicts() {
        let registry = ReplicaRegistry::default();
        let doc = registry.get_or_create_document("n1");
        let transport = registry.get_or_create_transport("n1");

        assert!(registry.destroy("n1"));
        assert!(doc.is_destroyed());
        assert!(transport.is_destroyed());
        assert!(registry.document("n1").is_none());
        assert!(!registry.destroy("n1"));

        // A new replica under the same id is a fresh document.
        let again = registry.get_or_create_document("n1");
        assert!(!Arc::ptr_eq(&doc, &again));
        assert!(!again.is_destroyed());
    }

    #[test]
    fn test_disconnect_keeps_document() {
        let registry = ReplicaRegistry::default();
        let doc = registry.get_or_create_document("n1");
        let transport = registry.get_or_create_transport("n1");

        assert!(registry.disconnect("n1"));
        assert!(transport.is_destroyed());
        assert!(registry.transport("n1").is_none());
        assert!(!doc.is_destroyed());
        assert_eq!(registry.active_note_ids(), vec!["n1".to_string()]);
    }

    #[test]
    fn test_destroy_all_and_listing() {
        let registry = ReplicaRegistry::default();
        for id in ["b", "a", "c"] {
            registry.get_or_create_transport(id);
        }
        assert_eq!(registry.active_note_ids(), vec!["a", "b", "c"]);
        assert_eq!(registry.disconnect_all(), 3);
        assert_eq!(registry.destroy_all(), 3);
        assert!(registry.is_empty());
    }
}
