//! Blocks and the block list.
//!
//! The document is an RGA of blocks. A block is named by the id of the
//! update that created it and carries:
//! - its kind (paragraph, heading, list item, ...) as a LWW register
//! - its own character sequence and formatting
//! - a tombstone flag; a deleted block keeps its content for late updates

use crate::marks::{Formatting, TextRun};
use crate::rga::RgaIndex;
use crate::text::TextSequence;
use quire_core::{LwwRegister, OpId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type BlockId = OpId;

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockKind {
    #[default]
    Paragraph,
    Heading {
        level: u8,
    },
    BulletItem,
    NumberedItem,
    Todo {
        checked: bool,
    },
    Quote,
    CodeBlock,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    origin: Option<BlockId>,
    kind: LwwRegister<BlockKind>,
    text: TextSequence,
    formatting: Formatting,
    deleted: bool,
}

impl Block {
    fn new(id: &BlockId, origin: Option<BlockId>, kind: BlockKind) -> Self {
        Self {
            origin,
            kind: LwwRegister::new(kind, id.clone()),
            text: TextSequence::new(),
            formatting: Formatting::new(),
            deleted: false,
        }
    }

    pub fn kind(&self) -> &BlockKind {
        self.kind.get()
    }

    pub fn text(&self) -> &TextSequence {
        &self.text
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn runs(&self) -> Vec<TextRun> {
        self.formatting.runs(&self.text)
    }

    pub(crate) fn set_kind(&mut self, kind: BlockKind, stamp: OpId) {
        self.kind.set(kind, stamp);
    }

    pub(crate) fn text_mut(&mut self) -> &mut TextSequence {
        &mut self.text
    }

    pub(crate) fn formatting_mut(&mut self) -> &mut Formatting {
        &mut self.formatting
    }

    pub(crate) fn mark_deleted(&mut self) {
        self.deleted = true;
    }

    fn merge(&mut self, other: &Block) {
        self.kind = quire_core::Lattice::join(&self.kind, &other.kind);
        self.text.merge(&other.text);
        self.formatting.merge(&other.formatting);
        self.deleted |= other.deleted;
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockList {
    blocks: BTreeMap<BlockId, Block>,
    index: RgaIndex<BlockId>,
}

impl Default for BlockList {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockList {
    pub fn new() -> Self {
        Self {
            blocks: BTreeMap::new(),
            index: RgaIndex::new(),
        }
    }

    pub fn get(&self, id: &BlockId) -> Option<&Block> {
        self.blocks.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &BlockId) -> Option<&mut Block> {
        self.blocks.get_mut(id)
    }

    pub fn contains(&self, id: &BlockId) -> bool {
        self.blocks.contains_key(id)
    }

    /// Number of blocks ever created, deleted ones included.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub(crate) fn insert(&mut self, id: BlockId, origin: Option<BlockId>, kind: BlockKind) {
        if self.blocks.contains_key(&id) {
            return;
        }
        self.index.insert(id.clone(), origin.as_ref());
        self.blocks.insert(id.clone(), Block::new(&id, origin, kind));
    }

    /// All block ids in document order, deleted ones included.
    pub fn order(&self) -> Vec<BlockId> {
        self.index.order()
    }

    /// Visible block ids in document order.
    pub fn visible(&self) -> Vec<BlockId> {
        self.order()
            .into_iter()
            .filter(|id| self.blocks.get(id).is_some_and(|b| !b.deleted))
            .collect()
    }

    /// The visible block nearest to `id` in document order: the closest one
    /// before it, else the closest one after it.
    pub fn nearest_visible(&self, id: &BlockId) -> Option<(BlockId, Placement)> {
        let order = self.order();
        let pos = order.iter().position(|b| b == id)?;
        let is_visible = |b: &BlockId| self.blocks.get(b).is_some_and(|b| !b.deleted);

        if let Some(before) = order[..pos].iter().rev().find(|b| is_visible(b)) {
            return Some((before.clone(), Placement::End));
        }
        order[pos + 1..]
            .iter()
            .find(|b| is_visible(b))
            .map(|after| (after.clone(), Placement::Start))
    }

    pub(crate) fn merge(&mut self, other: &BlockList) {
        for id in other.index.order() {
            let Some(block) = other.blocks.get(&id) else {
                continue;
            };
            match self.blocks.get_mut(&id) {
                Some(existing) => existing.merge(block),
                None => {
                    self.index.insert(id.clone(), block.origin.as_ref());
                    self.blocks.insert(id, block.clone());
                }
            }
        }
    }
}

/// Where relocated text lands in its new block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    Start,
    End,
}
