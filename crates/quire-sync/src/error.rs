//! Error types for sessions, registry and reconciliation.

use crate::network::TransportError;
use crate::persistence::PersistenceError;
use quire_codec::CodecError;
use quire_doc::DocError;
use thiserror::Error;

/// Everything that can go wrong above the document engine.
///
/// None of these are fatal to the process. Local edits keep applying and
/// failures surface through `SyncStatus` and session state.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Document(#[from] DocError),

    #[error("codec: {0}")]
    Codec(#[from] CodecError),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("persistence: {0}")]
    Persistence(#[from] PersistenceError),

    /// The peer broke the protocol or is incompatible. Not retried.
    #[error("protocol: {0}")]
    Protocol(String),

    #[error("identity: {0}")]
    Identity(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("cancelled")]
    Cancelled,
}

impl SyncError {
    /// Whether reconnecting can help.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SyncError::Protocol(_) | SyncError::Identity(_) | SyncError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
