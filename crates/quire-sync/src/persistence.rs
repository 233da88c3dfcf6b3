//! Storage collaborators: document snapshots and offline buffers.

use async_trait::async_trait;
use parking_lot::RwLock;
use quire_codec::{decode_snapshot, encode_snapshot, CodecError};
use quire_core::StateVector;
use quire_doc::DocumentState;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("stored data is corrupt: {0}")]
    Corrupt(#[from] CodecError),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Durable home of document snapshots.
#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    async fn load_snapshot(&self, document_id: &str) -> Result<Option<DocumentState>>;

    async fn save_snapshot(
        &self,
        document_id: &str,
        state: &DocumentState,
        state_vector: &StateVector,
    ) -> Result<()>;
}

/// Offline buffers are scoped to one client editing one document.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BufferKey {
    pub document_id: String,
    pub client_id: String,
}

impl BufferKey {
    pub fn new(document_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            client_id: client_id.into(),
        }
    }
}

impl fmt::Display for BufferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.document_id, self.client_id)
    }
}

/// Durable ordered list of encoded updates per buffer key.
#[async_trait]
pub trait PendingStore: Send + Sync + 'static {
    async fn load(&self, key: &BufferKey) -> Result<Vec<Vec<u8>>>;

    async fn append(&self, key: &BufferKey, frame: Vec<u8>) -> Result<()>;

    /// Drop the first `count` entries.
    async fn truncate_front(&self, key: &BufferKey, count: usize) -> Result<()>;

    /// Replace the whole list.
    async fn replace(&self, key: &BufferKey, frames: Vec<Vec<u8>>) -> Result<()>;
}

/// In-process store for tests, demos and the stress runner.
///
/// Snapshots are kept encoded so every load goes through the codec.
#[derive(Default)]
pub struct MemoryStore {
    snapshots: RwLock<HashMap<String, (Vec<u8>, StateVector)>>,
    pending: RwLock<HashMap<BufferKey, VecDeque<Vec<u8>>>>,
    failing_saves: AtomicUsize,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` snapshot saves fail.
    pub fn fail_next_saves(&self, count: usize) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    /// Successful snapshot saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn stored_state_vector(&self, document_id: &str) -> Option<StateVector> {
        self.snapshots
            .read()
            .get(document_id)
            .map(|(_, sv)| sv.clone())
    }

    pub fn pending_len(&self, key: &BufferKey) -> usize {
        self.pending.read().get(key).map_or(0, |q| q.len())
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn load_snapshot(&self, document_id: &str) -> Result<Option<DocumentState>> {
        let stored = self
            .snapshots
            .read()
            .get(document_id)
            .map(|(bytes, _)| bytes.clone());
        match stored {
            Some(bytes) => Ok(Some(decode_snapshot(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save_snapshot(
        &self,
        document_id: &str,
        state: &DocumentState,
        state_vector: &StateVector,
    ) -> Result<()> {
        let failing = self
            .failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(PersistenceError::Unavailable("injected failure".into()));
        }

        let bytes = encode_snapshot(state)?;
        self.snapshots
            .write()
            .insert(document_id.to_string(), (bytes, state_vector.clone()));
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl PendingStore for MemoryStore {
    async fn load(&self, key: &BufferKey) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .pending
            .read()
            .get(key)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn append(&self, key: &BufferKey, frame: Vec<u8>) -> Result<()> {
        self.pending
            .write()
            .entry(key.clone())
            .or_default()
            .push_back(frame);
        Ok(())
    }

    async fn truncate_front(&self, key: &BufferKey, count: usize) -> Result<()> {
        if let Some(queue) = self.pending.write().get_mut(key) {
            let count = count.min(queue.len());
            queue.drain(..count);
        }
        Ok(())
    }

    async fn replace(&self, key: &BufferKey, frames: Vec<Vec<u8>>) -> Result<()> {
        self.pending
            .write()
            .insert(key.clone(), frames.into_iter().collect());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_doc::{BlockKind, DocumentEngine, Operation};

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let store = MemoryStore::new();
        assert!(store.load_snapshot("doc").await.unwrap().is_none());

        let mut engine = DocumentEngine::new("doc", "r");
        engine
            .apply_local(Operation::InsertBlock {
                after: None,
                kind: BlockKind::Paragraph,
            })
            .unwrap();
        store
            .save_snapshot("doc", &engine.snapshot(), &engine.state_vector())
            .await
            .unwrap();

        assert_eq!(store.load_snapshot("doc").await.unwrap(), Some(engine.snapshot()));
        assert_eq!(store.stored_state_vector("doc"), Some(engine.state_vector()));
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_run_out() {
        let store = MemoryStore::new();
        let state = DocumentState::new("doc");
        store.fail_next_saves(2);

        let sv = StateVector::new();
        assert!(store.save_snapshot("doc", &state, &sv).await.is_err());
        assert!(store.save_snapshot("doc", &state, &sv).await.is_err());
        assert!(store.save_snapshot("doc", &state, &sv).await.is_ok());
    }

    #[tokio::test]
    async fn test_pending_queue_operations() {
        let store = MemoryStore::new();
        let key = BufferKey::new("doc", "client");
        for i in 0..4u8 {
            store.append(&key, vec![i]).await.unwrap();
        }
        store.truncate_front(&key, 3).await.unwrap();
        assert_eq!(store.load(&key).await.unwrap(), vec![vec![3]]);

        store.truncate_front(&key, 10).await.unwrap();
        assert!(store.load(&key).await.unwrap().is_empty());

        let other = BufferKey::new("doc", "someone-else");
        assert_eq!(store.pending_len(&other), 0);
        assert_eq!(key.to_string(), "doc/client");
    }
}
