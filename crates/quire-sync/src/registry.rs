//! Documents held by the hub: loading, connection counting, persistence
//! and idle eviction.

use crate::backoff::Backoff;
use crate::config::SyncConfig;
use crate::document::{CollabDocument, DocumentHandle};
use crate::error::{Result, SyncError};
use crate::persistence::Persistence;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

struct Entry {
    document: DocumentHandle,
    connections: usize,
    idle_since: Option<Instant>,
}

pub struct DocumentRegistry<P: Persistence> {
    hub_id: String,
    persistence: Arc<P>,
    config: SyncConfig,
    entries: Mutex<HashMap<String, Entry>>,
}

impl<P: Persistence> DocumentRegistry<P> {
    pub fn new(hub_id: impl Into<String>, persistence: Arc<P>, config: SyncConfig) -> Self {
        Self {
            hub_id: hub_id.into(),
            persistence,
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn persistence(&self) -> &Arc<P> {
        &self.persistence
    }

    /// The loaded document, loading or creating it on first use.
    pub async fn open(&self, document_id: &str) -> Result<DocumentHandle> {
        if let Some(entry) = self.entries.lock().get(document_id) {
            return Ok(entry.document.clone());
        }

        // Each load gets its own replica id so a hub restart never reuses
        // clocks of the previous incarnation.
        let replica = format!("{}-{}", self.hub_id, Ulid::new());
        let document = match self.persistence.load_snapshot(document_id).await? {
            Some(state) => {
                info!(document_id, "loaded document from storage");
                CollabDocument::from_state(state, replica, self.hub_id.clone(), &self.config)
            }
            None => {
                info!(document_id, "created new document");
                CollabDocument::new(document_id, replica, self.hub_id.clone(), &self.config)
            }
        };

        let mut entries = self.entries.lock();
        let entry = entries.entry(document_id.to_string()).or_insert(Entry {
            document,
            connections: 0,
            idle_since: Some(Instant::now()),
        });
        Ok(entry.document.clone())
    }

    pub fn get(&self, document_id: &str) -> Option<DocumentHandle> {
        self.entries
            .lock()
            .get(document_id)
            .map(|e| e.document.clone())
    }

    pub fn documents(&self) -> Vec<DocumentHandle> {
        self.entries
            .lock()
            .values()
            .map(|e| e.document.clone())
            .collect()
    }

    pub fn contains(&self, document_id: &str) -> bool {
        self.entries.lock().contains_key(document_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn connections(&self, document_id: &str) -> usize {
        self.entries
            .lock()
            .get(document_id)
            .map_or(0, |e| e.connections)
    }

    /// Count a new session on an open document.
    pub fn attach(&self, document_id: &str) {
        if let Some(entry) = self.entries.lock().get_mut(document_id) {
            entry.connections += 1;
            entry.idle_since = None;
        }
    }

    pub fn detach(&self, document_id: &str, now: Instant) {
        if let Some(entry) = self.entries.lock().get_mut(document_id) {
            entry.connections = entry.connections.saturating_sub(1);
            if entry.connections == 0 {
                entry.idle_since = Some(now);
            }
        }
    }

    /// Save a document's snapshot, retrying with backoff. On final failure
    /// the document is flagged and stays dirty.
    pub async fn persist(&self, document_id: &str) -> Result<()> {
        let Some(document) = self.get(document_id) else {
            return Ok(());
        };
        document.take_dirty();
        let state = document.snapshot();
        let state_vector = state.state_vector().clone();

        let mut backoff = Backoff::new(
            Duration::from_millis(self.config.persist_retry_base_ms),
            Duration::from_millis(self.config.persist_retry_base_ms.saturating_mul(16)),
        );
        let attempts = self.config.persist_retries.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self
                .persistence
                .save_snapshot(document_id, &state, &state_vector)
                .await
            {
                Ok(()) => {
                    debug!(document_id, attempt, "snapshot saved");
                    document.set_persistence_failed(false);
                    return Ok(());
                }
                Err(err) => {
                    warn!(document_id, attempt, %err, "snapshot save failed");
                    last_error = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(backoff.next_delay()).await;
                    }
                }
            }
        }

        document.mark_dirty();
        document.set_persistence_failed(true);
        error!(document_id, attempts, "giving up on snapshot save");
        Err(match last_error {
            Some(err) => SyncError::Persistence(err),
            None => SyncError::Timeout("snapshot save"),
        })
    }

    /// Persist every document with unsaved changes. Returns how many were
    /// saved.
    pub async fn persist_dirty(&self) -> usize {
        let dirty: Vec<String> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| e.document.is_dirty())
            .map(|(id, _)| id.clone())
            .collect();

        let mut saved = 0;
        for id in dirty {
            if self.persist(&id).await.is_ok() {
                saved += 1;
            }
        }
        saved
    }

    /// Drop documents nobody has used for the idle timeout, persisting
    /// them first. A document whose save fails stays loaded.
    pub async fn evict_idle(&self, now: Instant) -> Vec<String> {
        let idle_for = self.config.idle_evict();
        let candidates: Vec<String> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| {
                e.connections == 0
                    && e.idle_since
                        .is_some_and(|since| now.saturating_duration_since(since) >= idle_for)
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut evicted = Vec::new();
        for id in candidates {
            let dirty = self.get(&id).is_some_and(|d| d.is_dirty());
            if dirty && self.persist(&id).await.is_err() {
                continue;
            }
            let mut entries = self.entries.lock();
            let still_idle = entries.get(&id).is_some_and(|e| e.connections == 0);
            if still_idle {
                entries.remove(&id);
                info!(document_id = %id, "evicted idle document");
                evicted.push(id);
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use quire_doc::{BlockKind, Operation};

    fn registry(store: Arc<MemoryStore>) -> DocumentRegistry<MemoryStore> {
        let config = SyncConfig::builder()
            .idle_evict(1000)
            .persist_retries(3, 1)
            .build();
        DocumentRegistry::new("hub", store, config)
    }

    fn edit(document: &CollabDocument) {
        document
            .apply_local(Operation::InsertBlock {
                after: None,
                kind: BlockKind::Paragraph,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_open_returns_same_document() {
        let registry = registry(Arc::new(MemoryStore::new()));
        let a = registry.open("doc").await.unwrap();
        let b = registry.open("doc").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_evict_persists_and_reload_restores() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone());
        let document = registry.open("doc").await.unwrap();
        registry.attach("doc");
        edit(&document);
        let text_before = document.render();

        let start = Instant::now();
        registry.detach("doc", start);
        assert!(registry.evict_idle(start).await.is_empty());

        let evicted = registry.evict_idle(start + Duration::from_secs(2)).await;
        assert_eq!(evicted, vec!["doc".to_string()]);
        assert_eq!(store.save_count(), 1);
        assert!(!registry.contains("doc"));

        let reloaded = registry.open("doc").await.unwrap();
        assert_eq!(reloaded.render(), text_before);
        assert_ne!(reloaded.replica_id(), document.replica_id());
    }

    #[tokio::test]
    async fn test_attached_documents_stay() {
        let registry = registry(Arc::new(MemoryStore::new()));
        registry.open("doc").await.unwrap();
        registry.attach("doc");
        let later = Instant::now() + Duration::from_secs(60);
        assert!(registry.evict_idle(later).await.is_empty());
        assert_eq!(registry.connections("doc"), 1);
    }

    #[tokio::test]
    async fn test_persist_retries_then_succeeds() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone());
        let document = registry.open("doc").await.unwrap();
        edit(&document);

        store.fail_next_saves(2);
        registry.persist("doc").await.unwrap();
        assert_eq!(store.save_count(), 1);
        assert!(!document.sync_status().borrow().persistence_failed);
    }

    #[tokio::test]
    async fn test_persist_failure_flags_document() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone());
        let document = registry.open("doc").await.unwrap();
        edit(&document);

        store.fail_next_saves(3);
        assert!(registry.persist("doc").await.is_err());
        assert!(document.sync_status().borrow().persistence_failed);
        assert!(document.is_dirty());

        // Still dirty, so the next round picks it up
        assert_eq!(registry.persist_dirty().await, 1);
        assert!(!document.is_dirty());
        assert!(!document.sync_status().borrow().persistence_failed);
    }

    #[tokio::test]
    async fn test_failed_save_blocks_eviction() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone());
        let document = registry.open("doc").await.unwrap();
        edit(&document);

        store.fail_next_saves(3);
        let later = Instant::now() + Duration::from_secs(5);
        assert!(registry.evict_idle(later).await.is_empty());
        assert!(registry.contains("doc"));
    }
}
