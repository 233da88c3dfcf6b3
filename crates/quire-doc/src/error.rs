//! Error types for the document engine.

use quire_core::OpId;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocError {
    /// A local operation could not be applied to the current structure.
    /// Recoverable: the caller drops it or the engine transforms it.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A queued remote update waited too long for its predecessor.
    #[error("update {update} waited {waited:?} for its dependencies")]
    DependencyTimeout { update: OpId, waited: Duration },

    /// A remote update whose dependencies are observed but refers to
    /// something that does not exist.
    #[error("malformed update {update}: {reason}")]
    MalformedUpdate { update: OpId, reason: String },

    #[error("update for document {actual} applied to document {expected}")]
    DocumentMismatch { expected: String, actual: String },
}

pub type Result<T> = std::result::Result<T, DocError>;
