//! Client entry point: one [`Client`] per user, one session per open
//! document.

use crate::config::SyncConfig;
use crate::document::{CollabDocument, DocumentHandle};
use crate::error::Result;
use crate::identity::{Identity, IdentityProvider};
use crate::network::Connector;
use crate::offline::OfflineReconciler;
use crate::persistence::{BufferKey, PendingStore};
use crate::session::{spawn_client_session, SessionHandle, SessionState};
use quire_doc::{DocError, Operation, Update};
use std::sync::Arc;
use tracing::info;
use ulid::Ulid;

pub struct Client<C, I> {
    connector: C,
    identity: I,
    store: Arc<dyn PendingStore>,
    config: SyncConfig,
}

impl<C: Connector + Clone, I: IdentityProvider> Client<C, I> {
    /// `store` holds the offline buffers and survives restarts.
    pub fn new(connector: C, identity: I, store: Arc<dyn PendingStore>, config: SyncConfig) -> Self {
        Self {
            connector,
            identity,
            store,
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Open `document_id` and start syncing it in the background.
    ///
    /// Every open gets a fresh replica id. Updates a previous run left in
    /// the offline buffer are reloaded and flushed once the session is live.
    ///
    /// The document itself always starts empty. Buffered updates are not
    /// applied locally on open: they become visible only after the hub
    /// catch-up, when the flush re-applies whatever the hub did not have.
    /// Until then [`ClientDocument::pending_count`] reports them.
    pub async fn open_document(&self, document_id: &str) -> Result<ClientDocument> {
        let identity = self.identity.identify().await?;
        let replica_id = Ulid::new().to_string();
        let document = CollabDocument::new(
            document_id,
            replica_id.clone(),
            identity.client_id.clone(),
            &self.config,
        );
        let reconciler = OfflineReconciler::load(
            BufferKey::new(document_id, identity.client_id.clone()),
            Arc::clone(&self.store),
        )
        .await?;
        info!(
            document_id,
            client = %identity.client_id,
            replica = %replica_id,
            buffered = reconciler.pending_count(),
            "opening document"
        );

        let session = spawn_client_session(
            self.connector.clone(),
            identity.clone(),
            document.clone(),
            reconciler,
            self.config.clone(),
        );
        Ok(ClientDocument {
            identity,
            document,
            session,
        })
    }
}

/// An open document and its running session.
pub struct ClientDocument {
    identity: Identity,
    document: DocumentHandle,
    session: SessionHandle,
}

impl ClientDocument {
    pub fn document(&self) -> &DocumentHandle {
        &self.document
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Edit the local replica. Applies immediately, whatever the link state.
    pub fn edit(&self, op: Operation) -> std::result::Result<Update, DocError> {
        self.document.apply_local(op)
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn pending_count(&self) -> usize {
        self.session.pending_count()
    }

    pub async fn close(&self) {
        self.session.close().await;
    }
}
