//! Session protocol messages.
//!
//! Every message travels in a sealed envelope. Updates inside a message
//! stay in their own update frames so a corrupt chunk can be detected and
//! discarded as a whole.

use crate::awareness::AwarenessUpdate;
use quire_codec::{open, seal, CodecError, TAG_MESSAGE};
use quire_core::StateVector;
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u16 = 1;

/// First message on every link, sent by both sides.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub document_id: String,
    pub protocol_version: u16,
    pub client_id: String,
    pub display_name: String,
    pub state_vector: StateVector,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolMessage {
    Hello(Hello),
    /// Part of the catch-up diff: encoded update frames.
    SyncChunk { updates: Vec<Vec<u8>> },
    /// Part of an encoded full snapshot.
    SnapshotChunk { index: u32, total: u32, bytes: Vec<u8> },
    /// The sender has sent everything the peer was missing.
    SyncDone,
    /// Live updates.
    Update { updates: Vec<Vec<u8>> },
    /// The receiver's state vector after applying a batch.
    Ack { state_vector: StateVector },
    Awareness {
        updates: Vec<AwarenessUpdate>,
        removed: Vec<String>,
    },
    /// Ask the peer for its full state.
    ResyncRequest,
    Goodbye { reason: String },
}

impl ProtocolMessage {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        seal(TAG_MESSAGE, self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        open(TAG_MESSAGE, bytes)
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolMessage::Hello(_) => "hello",
            ProtocolMessage::SyncChunk { .. } => "sync-chunk",
            ProtocolMessage::SnapshotChunk { .. } => "snapshot-chunk",
            ProtocolMessage::SyncDone => "sync-done",
            ProtocolMessage::Update { .. } => "update",
            ProtocolMessage::Ack { .. } => "ack",
            ProtocolMessage::Awareness { .. } => "awareness",
            ProtocolMessage::ResyncRequest => "resync-request",
            ProtocolMessage::Goodbye { .. } => "goodbye",
        }
    }
}

/// Split an encoded snapshot into chunk messages.
pub fn snapshot_chunks(bytes: &[u8], chunk_bytes: usize) -> Vec<ProtocolMessage> {
    let parts: Vec<&[u8]> = bytes.chunks(chunk_bytes.max(1)).collect();
    let total = parts.len() as u32;
    parts
        .into_iter()
        .enumerate()
        .map(|(index, part)| ProtocolMessage::SnapshotChunk {
            index: index as u32,
            total,
            bytes: part.to_vec(),
        })
        .collect()
}

/// Reassembles snapshot chunks. Chunks must arrive in order; a gap or a
/// new transfer discards whatever was collected.
#[derive(Debug, Default)]
pub struct SnapshotAssembler {
    total: u32,
    parts: Vec<Vec<u8>>,
}

impl SnapshotAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a transfer is half done.
    pub fn in_progress(&self) -> bool {
        !self.parts.is_empty()
    }

    /// Returns the whole snapshot once its last chunk arrives.
    pub fn push(&mut self, index: u32, total: u32, bytes: Vec<u8>) -> Option<Vec<u8>> {
        if index == 0 {
            self.reset();
            self.total = total;
        }
        if total == 0 || total != self.total || index as usize != self.parts.len() {
            self.reset();
            return None;
        }
        self.parts.push(bytes);
        if self.parts.len() == total as usize {
            let whole = self.parts.concat();
            self.reset();
            return Some(whole);
        }
        None
    }

    pub fn reset(&mut self) {
        self.total = 0;
        self.parts.clear();
    }
}
