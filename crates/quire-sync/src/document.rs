//! A document shared between the editor, sessions and the registry.

use crate::awareness::Awareness;
use crate::config::SyncConfig;
use parking_lot::Mutex;
use quire_codec::{diff, Diff};
use quire_core::{OpId, StateVector};
use quire_doc::{
    ApplyResult, BatchOutcome, DocError, DocumentEngine, DocumentId, DocumentState, Operation,
    RenderedDocument, Update,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, watch};

pub type SessionId = String;

/// Where an applied update came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote(SessionId),
    /// Re-applied from the offline buffer after a restart.
    Replay,
}

/// Emitted for every change to the document, in application order.
#[derive(Clone, Debug)]
pub enum DocEvent {
    Applied { update: Update, origin: Origin },
    /// A full state was merged; re-render from scratch.
    Reset { origin: Origin },
    /// Queued updates waited too long for their dependencies and were
    /// dropped. Sessions should ask their peer for a full state.
    DependencyTimeout { update: OpId },
}

/// What the editor shows next to the document title.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncStatus {
    /// Local updates not yet confirmed by the hub.
    pub unconfirmed: usize,
    /// The last snapshot save failed after all retries.
    pub persistence_failed: bool,
}

impl SyncStatus {
    pub fn is_synced(&self) -> bool {
        self.unconfirmed == 0
    }
}

/// One replica of a document plus its awareness state.
///
/// The engine lock is only held for synchronous mutation and never across
/// an await. Events are broadcast under the lock so subscribers see them in
/// application order.
pub struct CollabDocument {
    document_id: DocumentId,
    engine: Mutex<DocumentEngine>,
    awareness: Arc<Awareness>,
    events: broadcast::Sender<DocEvent>,
    status: watch::Sender<SyncStatus>,
    dirty: AtomicBool,
}

pub type DocumentHandle = Arc<CollabDocument>;

impl CollabDocument {
    /// An empty document edited as `replica_id` by `client_id`.
    pub fn new(
        document_id: impl Into<DocumentId>,
        replica_id: impl Into<String>,
        client_id: impl Into<String>,
        config: &SyncConfig,
    ) -> DocumentHandle {
        let document_id = document_id.into();
        let engine =
            DocumentEngine::with_config(document_id.clone(), replica_id, config.engine_config());
        Self::from_engine(engine, client_id, config)
    }

    /// A document resumed from a stored state.
    pub fn from_state(
        state: DocumentState,
        replica_id: impl Into<String>,
        client_id: impl Into<String>,
        config: &SyncConfig,
    ) -> DocumentHandle {
        let engine = DocumentEngine::from_snapshot(state, replica_id, config.engine_config());
        Self::from_engine(engine, client_id, config)
    }

    fn from_engine(
        engine: DocumentEngine,
        client_id: impl Into<String>,
        config: &SyncConfig,
    ) -> DocumentHandle {
        let document_id = engine.document_id().to_string();
        let (events, _) = broadcast::channel(1024);
        let (status, _) = watch::channel(SyncStatus::default());
        Arc::new(Self {
            awareness: Arc::new(Awareness::new(
                document_id.clone(),
                client_id,
                config.awareness_timeout(),
            )),
            document_id,
            engine: Mutex::new(engine),
            events,
            status,
            dirty: AtomicBool::new(false),
        })
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn replica_id(&self) -> String {
        self.engine.lock().replica_id().to_string()
    }

    pub fn awareness(&self) -> &Arc<Awareness> {
        &self.awareness
    }

    // === Editing ===

    pub fn apply_local(&self, op: Operation) -> Result<Update, DocError> {
        let mut engine = self.engine.lock();
        let update = engine.apply_local(op)?;
        self.dirty.store(true, Ordering::SeqCst);
        let _ = self.events.send(DocEvent::Applied {
            update: update.clone(),
            origin: Origin::Local,
        });
        Ok(update)
    }

    pub fn apply_local_batch(&self, ops: Vec<Operation>) -> BatchOutcome {
        let mut engine = self.engine.lock();
        let outcome = engine.apply_local_batch(ops);
        if !outcome.updates.is_empty() {
            self.dirty.store(true, Ordering::SeqCst);
        }
        for update in &outcome.updates {
            let _ = self.events.send(DocEvent::Applied {
                update: update.clone(),
                origin: Origin::Local,
            });
        }
        outcome
    }

    pub fn apply_remote(&self, update: Update, origin: Origin) -> Result<ApplyResult, DocError> {
        let mut engine = self.engine.lock();
        let result = engine.apply_remote(update)?;
        if let ApplyResult::Applied(applied) = &result {
            self.dirty.store(true, Ordering::SeqCst);
            for update in applied {
                let _ = self.events.send(DocEvent::Applied {
                    update: update.clone(),
                    origin: origin.clone(),
                });
            }
        }
        Ok(result)
    }

    pub fn merge_snapshot(&self, state: &DocumentState, origin: Origin) -> Result<(), DocError> {
        let mut engine = self.engine.lock();
        let unblocked = engine.merge_snapshot(state)?;
        self.dirty.store(true, Ordering::SeqCst);
        let _ = self.events.send(DocEvent::Reset {
            origin: origin.clone(),
        });
        for update in unblocked {
            let _ = self.events.send(DocEvent::Applied {
                update,
                origin: origin.clone(),
            });
        }
        Ok(())
    }

    pub fn expire_pending(&self, now: Instant) -> Result<(), DocError> {
        let mut engine = self.engine.lock();
        let result = engine.expire_pending(now);
        if let Err(DocError::DependencyTimeout { update, .. }) = &result {
            let _ = self.events.send(DocEvent::DependencyTimeout {
                update: update.clone(),
            });
        }
        result
    }

    pub fn compact_log(&self, stable: &StateVector) -> usize {
        self.engine.lock().compact_log(stable)
    }

    // === Reading ===

    pub fn snapshot(&self) -> DocumentState {
        self.engine.lock().snapshot()
    }

    pub fn state_vector(&self) -> StateVector {
        self.engine.lock().state_vector()
    }

    pub fn contains(&self, id: &OpId) -> bool {
        self.engine.lock().contains(id)
    }

    pub fn pending_len(&self) -> usize {
        self.engine.lock().pending_len()
    }

    /// Catch-up payload for a peer at `remote`.
    pub fn diff_for(&self, remote: &StateVector) -> Diff {
        let engine = self.engine.lock();
        diff(engine.log(), engine.state().state_vector(), remote)
    }

    /// This replica's own updates that `remote` has not seen, in order.
    pub fn local_updates_since(&self, remote: &StateVector) -> Vec<Update> {
        let engine = self.engine.lock();
        let replica = engine.replica_id();
        engine
            .log()
            .iter()
            .filter(|u| u.id.replica == replica && !remote.contains(&u.id))
            .cloned()
            .collect()
    }

    pub fn render(&self) -> RenderedDocument {
        self.engine.lock().render()
    }

    pub fn plain_text(&self) -> String {
        self.engine.lock().plain_text()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DocEvent> {
        self.events.subscribe()
    }

    // === Status ===

    pub fn sync_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn set_unconfirmed(&self, unconfirmed: usize) {
        self.status.send_if_modified(|s| {
            let changed = s.unconfirmed != unconfirmed;
            s.unconfirmed = unconfirmed;
            changed
        });
    }

    pub fn set_persistence_failed(&self, failed: bool) {
        self.status.send_if_modified(|s| {
            let changed = s.persistence_failed != failed;
            s.persistence_failed = failed;
            changed
        });
    }

    /// Clear the dirty flag, returning whether it was set.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }
}
