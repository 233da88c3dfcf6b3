//! Full replicated state of one document.

use crate::block::{Block, BlockId, BlockKind, BlockList};
use crate::error::{DocError, Result};
use crate::marks::{FormatSpan, TextRun};
use crate::op::{Change, DocumentId, Update};
use crate::text::CharId;
use quire_core::{Lattice, OpId, StateVector};
use serde::{Deserialize, Serialize};

/// Blocks plus the state vector of every update folded into them.
///
/// Two replicas that have integrated the same set of updates hold equal
/// `DocumentState`s, whatever order the updates arrived in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentState {
    document_id: DocumentId,
    blocks: BlockList,
    state_vector: StateVector,
}

/// Read-only view handed to the rendering layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedDocument {
    pub document_id: DocumentId,
    pub blocks: Vec<RenderedBlock>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedBlock {
    pub id: BlockId,
    pub kind: BlockKind,
    pub runs: Vec<TextRun>,
}

impl RenderedBlock {
    pub fn text(&self) -> String {
        self.runs.iter().map(|r| r.text.as_str()).collect()
    }
}

impl DocumentState {
    pub fn new(document_id: impl Into<DocumentId>) -> Self {
        Self {
            document_id: document_id.into(),
            blocks: BlockList::new(),
            state_vector: StateVector::new(),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.state_vector
    }

    pub fn blocks(&self) -> &BlockList {
        &self.blocks
    }

    pub fn block(&self, id: &BlockId) -> Option<&Block> {
        self.blocks.get(id)
    }

    /// Visible blocks in document order.
    pub fn visible_blocks(&self) -> Vec<BlockId> {
        self.blocks.visible()
    }

    pub fn has_observed(&self, id: &OpId) -> bool {
        self.state_vector.contains(id)
    }

    pub fn render(&self) -> RenderedDocument {
        let blocks = self
            .blocks
            .visible()
            .into_iter()
            .filter_map(|id| {
                let block = self.blocks.get(&id)?;
                Some(RenderedBlock {
                    kind: block.kind().clone(),
                    runs: block.runs(),
                    id,
                })
            })
            .collect();
        RenderedDocument {
            document_id: self.document_id.clone(),
            blocks,
        }
    }

    /// Visible text, one line per visible block.
    pub fn plain_text(&self) -> String {
        self.blocks
            .visible()
            .iter()
            .filter_map(|id| self.blocks.get(id))
            .map(|b| b.text().to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Dependencies of `update` this state has not observed yet.
    pub fn missing_dependencies(&self, update: &Update) -> Vec<OpId> {
        update
            .dependencies()
            .into_iter()
            .filter(|dep| !self.state_vector.contains(dep))
            .collect()
    }

    /// Check that everything `update` points at exists. Only meaningful once
    /// its dependencies are observed.
    pub(crate) fn check_references(&self, update: &Update) -> Result<()> {
        let malformed = |reason: &str| DocError::MalformedUpdate {
            update: update.id.clone(),
            reason: reason.to_string(),
        };
        let block_of = |id: &BlockId| self.blocks.get(id).ok_or_else(|| malformed("unknown block"));
        let has_char = |block: &Block, id: &CharId| {
            if block.text().contains(id) {
                Ok(())
            } else {
                Err(malformed("unknown character"))
            }
        };

        match &update.change {
            Change::InsertBlock { origin, .. } => {
                if let Some(origin) = origin {
                    block_of(origin)?;
                }
            }
            Change::DeleteBlock { block } | Change::SetBlockKind { block, .. } => {
                block_of(block)?;
            }
            Change::InsertText {
                block, origin, text,
            } => {
                let block = block_of(block)?;
                if let Some(origin) = origin {
                    has_char(block, origin)?;
                }
                if text.is_empty() {
                    return Err(malformed("empty text insert"));
                }
            }
            Change::DeleteText {
                block, first, last,
            } => {
                let block = block_of(block)?;
                has_char(block, first)?;
                has_char(block, last)?;
            }
            Change::Format {
                block, start, end, ..
            } => {
                let block = block_of(block)?;
                has_char(block, start)?;
                has_char(block, end)?;
            }
        }
        Ok(())
    }

    /// Fold `update` into the state. Callers check dependencies and
    /// references first; a missing target is skipped.
    pub(crate) fn integrate(&mut self, update: &Update) {
        let id = &update.id;
        match &update.change {
            Change::InsertBlock { origin, kind } => {
                self.blocks.insert(id.clone(), origin.clone(), kind.clone());
            }
            Change::DeleteBlock { block } => {
                if let Some(block) = self.blocks.get_mut(block) {
                    block.mark_deleted();
                }
            }
            Change::SetBlockKind { block, kind } => {
                if let Some(block) = self.blocks.get_mut(block) {
                    block.set_kind(kind.clone(), id.clone());
                }
            }
            Change::InsertText {
                block, origin, text,
            } => {
                if let Some(block) = self.blocks.get_mut(block) {
                    block.text_mut().integrate_run(id, origin.clone(), text);
                }
            }
            Change::DeleteText {
                block, first, last,
            } => {
                if let Some(block) = self.blocks.get_mut(block) {
                    block.text_mut().delete_range(first.clone(), last.clone());
                }
            }
            Change::Format {
                block,
                start,
                end,
                mark,
                enabled,
            } => {
                if let Some(block) = self.blocks.get_mut(block) {
                    block.formatting_mut().add(
                        id.clone(),
                        FormatSpan {
                            start: start.clone(),
                            end: end.clone(),
                            mark: mark.clone(),
                            enabled: *enabled,
                        },
                    );
                }
            }
        }
        self.state_vector.observe(&id.replica, id.clock);
    }
}

impl Lattice for DocumentState {
    fn bottom() -> Self {
        Self::new(DocumentId::new())
    }

    fn join(&self, other: &Self) -> Self {
        let mut joined = self.clone();
        if joined.document_id.is_empty() {
            joined.document_id = other.document_id.clone();
        }
        joined.blocks.merge(&other.blocks);
        joined.state_vector.merge(&other.state_vector);
        joined
    }
}
