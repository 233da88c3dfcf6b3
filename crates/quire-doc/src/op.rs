//! Operations and updates.
//!
//! An [`Operation`] is what an editor asks for, addressed by visible
//! offsets. The engine resolves it against the current state into a
//! [`Change`] addressed by stable ids, stamps it with the next logical clock
//! and hands it out as an [`Update`]. Updates are what replicas exchange.

use crate::block::{BlockId, BlockKind};
use crate::marks::MarkType;
use crate::text::CharId;
use quire_core::{Clock, OpId};
use serde::{Deserialize, Serialize};

pub type DocumentId = String;

/// A local edit intent, addressed by offsets into visible text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Insert a new block after `after`, or at the top when `None`.
    InsertBlock {
        after: Option<BlockId>,
        kind: BlockKind,
    },
    DeleteBlock {
        block: BlockId,
    },
    SetBlockKind {
        block: BlockId,
        kind: BlockKind,
    },
    InsertText {
        block: BlockId,
        offset: usize,
        text: String,
    },
    DeleteText {
        block: BlockId,
        offset: usize,
        len: usize,
    },
    Format {
        block: BlockId,
        offset: usize,
        len: usize,
        mark: MarkType,
        enabled: bool,
    },
}

/// The id-addressed content of an update.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    InsertBlock {
        origin: Option<BlockId>,
        kind: BlockKind,
    },
    DeleteBlock {
        block: BlockId,
    },
    SetBlockKind {
        block: BlockId,
        kind: BlockKind,
    },
    InsertText {
        block: BlockId,
        origin: Option<CharId>,
        text: String,
    },
    DeleteText {
        block: BlockId,
        first: CharId,
        last: CharId,
    },
    Format {
        block: BlockId,
        start: CharId,
        end: CharId,
        mark: MarkType,
        enabled: bool,
    },
}

/// Wire tag of each change variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpKind {
    InsertBlock = 1,
    DeleteBlock = 2,
    SetBlockKind = 3,
    InsertText = 4,
    DeleteText = 5,
    Format = 6,
}

impl OpKind {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(OpKind::InsertBlock),
            2 => Some(OpKind::DeleteBlock),
            3 => Some(OpKind::SetBlockKind),
            4 => Some(OpKind::InsertText),
            5 => Some(OpKind::DeleteText),
            6 => Some(OpKind::Format),
            _ => None,
        }
    }
}

impl Change {
    pub fn kind(&self) -> OpKind {
        match self {
            Change::InsertBlock { .. } => OpKind::InsertBlock,
            Change::DeleteBlock { .. } => OpKind::DeleteBlock,
            Change::SetBlockKind { .. } => OpKind::SetBlockKind,
            Change::InsertText { .. } => OpKind::InsertText,
            Change::DeleteText { .. } => OpKind::DeleteText,
            Change::Format { .. } => OpKind::Format,
        }
    }

    /// Ids of the updates whose effects this change refers to.
    pub fn references(&self) -> Vec<OpId> {
        match self {
            Change::InsertBlock { origin, .. } => origin.iter().cloned().collect(),
            Change::DeleteBlock { block } | Change::SetBlockKind { block, .. } => {
                vec![block.clone()]
            }
            Change::InsertText { block, origin, .. } => {
                let mut refs = vec![block.clone()];
                refs.extend(origin.iter().map(|c| c.op.clone()));
                refs
            }
            Change::DeleteText {
                block, first, last, ..
            } => vec![block.clone(), first.op.clone(), last.op.clone()],
            Change::Format {
                block, start, end, ..
            } => vec![block.clone(), start.op.clone(), end.op.clone()],
        }
    }
}

/// An immutable, causally tagged mutation of one document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub document_id: DocumentId,
    pub id: OpId,
    /// Clock of the same replica's previous update, 0 for its first.
    pub prev: Clock,
    pub change: Change,
}

impl Update {
    pub fn kind(&self) -> OpKind {
        self.change.kind()
    }

    /// Every update that must be applied before this one.
    pub fn dependencies(&self) -> Vec<OpId> {
        let mut deps = self.change.references();
        if self.prev > 0 {
            deps.push(OpId::new(self.id.replica.clone(), self.prev));
        }
        deps.sort();
        deps.dedup();
        deps
    }
}
