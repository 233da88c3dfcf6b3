//! # quire-sync
//!
//! Sessions, awareness and offline reconciliation for Quire documents.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use quire_sync::{
//!     memory_network, Client, Hub, MemoryStore, SessionState, StaticIdentity, Identity,
//!     SyncConfig,
//! };
//! use quire_doc::{BlockKind, Operation};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> quire_sync::Result<()> {
//!     let (connector, listener) = memory_network();
//!     let hub = Hub::new("hub", Arc::new(MemoryStore::new()), SyncConfig::default());
//!     hub.spawn_listener(listener);
//!
//!     let client = Client::new(
//!         connector,
//!         StaticIdentity(Identity::new("Alice")),
//!         Arc::new(MemoryStore::new()),
//!         SyncConfig::default(),
//!     );
//!     let notes = client.open_document("notes").await?;
//!     notes.session().wait_for(SessionState::Live, Duration::from_secs(5)).await;
//!
//!     notes.edit(Operation::InsertBlock { after: None, kind: BlockKind::Paragraph })?;
//!     notes.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - [`session`] - Client session state machine and the wire protocol driver
//! - [`server`] - The hub answering sessions and relaying between them
//! - [`registry`] - Documents loaded on the hub, persistence and eviction
//! - [`offline`] - Durable buffer of unconfirmed local updates
//! - [`awareness`] - Presence, cursors and heartbeats
//! - [`document`] - A document shared by the editor and its session
//! - [`network`] - Transport traits and an in-memory network
//! - [`persistence`] - Snapshot and offline buffer storage traits

pub mod awareness;
pub mod backoff;
pub mod client;
pub mod config;
pub mod document;
pub mod error;
pub mod identity;
pub mod network;
pub mod offline;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

// Re-exports for convenience
pub use awareness::{
    Awareness, AwarenessEntry, AwarenessEvent, AwarenessState, AwarenessUpdate, CursorColors,
    PresenceStatus, Selection,
};
pub use backoff::Backoff;
pub use client::{Client, ClientDocument};
pub use config::{SyncConfig, SyncConfigBuilder};
pub use document::{CollabDocument, DocEvent, DocumentHandle, Origin, SessionId, SyncStatus};
pub use error::{Result, SyncError};
pub use identity::{Identity, IdentityProvider, StaticIdentity};
pub use network::{
    memory_network, Connector, LinkHandle, Listener, MemoryConnector, MemoryListener,
    MemoryTransport, Transport, TransportError, TransportEvent,
};
pub use offline::{FlushResult, FlushSink, OfflineReconciler};
pub use persistence::{BufferKey, MemoryStore, PendingStore, Persistence, PersistenceError};
pub use protocol::{Hello, ProtocolMessage, PROTOCOL_VERSION};
pub use registry::DocumentRegistry;
pub use server::{Hub, MaintenanceReport};
pub use session::{SessionHandle, SessionState};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::awareness::{AwarenessState, Selection};
    pub use crate::client::{Client, ClientDocument};
    pub use crate::config::SyncConfig;
    pub use crate::error::SyncError;
    pub use crate::identity::{Identity, StaticIdentity};
    pub use crate::server::Hub;
    pub use crate::session::SessionState;
}
