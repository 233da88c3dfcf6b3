//! Character sequence of a single block.
//!
//! An RGA of characters with tombstones:
//! - a text insert is a run of characters chained one after another, all
//!   named by the inserting update's id plus their index in the run
//! - a delete records the first and last character it covered; every
//!   character that lands between them, now or after a later merge, is
//!   tombstoned (delete wins over concurrent inserts inside the range)
//! - deleted characters stay in the sequence so late updates can still
//!   anchor on them

use crate::rga::RgaIndex;
use quire_core::OpId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Identifier of a character: the `index`-th character inserted by `op`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharId {
    pub op: OpId,
    pub index: u32,
}

impl CharId {
    pub fn new(op: OpId, index: u32) -> Self {
        Self { op, index }
    }
}

impl Ord for CharId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.op
            .cmp(&other.op)
            .then_with(|| self.index.cmp(&other.index))
    }
}

impl PartialOrd for CharId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct CharNode {
    ch: char,
    origin: Option<CharId>,
    deleted: bool,
}

/// A deleted span, inclusive on both ends.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeletedRange {
    pub first: CharId,
    pub last: CharId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSequence {
    nodes: BTreeMap<CharId, CharNode>,
    index: RgaIndex<CharId>,
    deleted_ranges: BTreeSet<DeletedRange>,
}

impl Default for TextSequence {
    fn default() -> Self {
        Self::new()
    }
}

impl TextSequence {
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            index: RgaIndex::new(),
            deleted_ranges: BTreeSet::new(),
        }
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.nodes.values().filter(|n| !n.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tombstoned characters kept in history.
    pub fn tombstone_count(&self) -> usize {
        self.nodes.values().filter(|n| n.deleted).count()
    }

    pub fn contains(&self, id: &CharId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Whether the character exists and has been deleted.
    pub fn is_deleted(&self, id: &CharId) -> bool {
        self.nodes.get(id).is_some_and(|n| n.deleted)
    }

    /// The character named by `id`, unless it is unknown or deleted.
    pub fn visible_char(&self, id: &CharId) -> Option<char> {
        self.nodes.get(id).filter(|n| !n.deleted).map(|n| n.ch)
    }

    /// Every character id in document order, tombstones included.
    pub fn ids_in_order(&self) -> Vec<CharId> {
        self.index.order()
    }

    /// Visible characters with their ids, in document order.
    pub fn visible(&self) -> Vec<(CharId, char)> {
        self.index
            .order()
            .into_iter()
            .filter_map(|id| {
                let node = self.nodes.get(&id)?;
                (!node.deleted).then_some((id, node.ch))
            })
            .collect()
    }

    /// Origin for an insert at visible `offset`: the visible character just
    /// before it, or `None` for the head of the block.
    pub fn origin_at(&self, offset: usize) -> Option<CharId> {
        if offset == 0 {
            return None;
        }
        self.visible()
            .into_iter()
            .nth(offset - 1)
            .map(|(id, _)| id)
    }

    /// First and last visible character of the span `[offset, offset + len)`.
    pub fn visible_span(&self, offset: usize, len: usize) -> Option<(CharId, CharId)> {
        if len == 0 {
            return None;
        }
        let visible = self.visible();
        let first = visible.get(offset)?.0.clone();
        let last_index = (offset + len - 1).min(visible.len() - 1);
        let last = visible[last_index].0.clone();
        Some((first, last))
    }

    /// Integrate the run of characters inserted by `op` after `origin`.
    pub fn integrate_run(&mut self, op: &OpId, origin: Option<CharId>, text: &str) {
        let mut origin = origin;
        for (index, ch) in text.chars().enumerate() {
            let id = CharId::new(op.clone(), index as u32);
            if !self.nodes.contains_key(&id) {
                self.nodes.insert(
                    id.clone(),
                    CharNode {
                        ch,
                        origin: origin.clone(),
                        deleted: false,
                    },
                );
                self.index.insert(id.clone(), origin.as_ref());
            }
            origin = Some(id);
        }
        self.enforce_deleted_ranges();
    }

    /// Tombstone everything between `first` and `last`, inclusive.
    pub fn delete_range(&mut self, first: CharId, last: CharId) {
        if self.deleted_ranges.insert(DeletedRange { first, last }) {
            self.enforce_deleted_ranges();
        }
    }

    /// Fold another replica's copy of this sequence into this one.
    pub fn merge(&mut self, other: &TextSequence) {
        // Parents come before children in document order
        for id in other.index.order() {
            let Some(node) = other.nodes.get(&id) else {
                continue;
            };
            match self.nodes.get_mut(&id) {
                Some(existing) => existing.deleted |= node.deleted,
                None => {
                    self.index.insert(id.clone(), node.origin.as_ref());
                    self.nodes.insert(id, node.clone());
                }
            }
        }
        self.deleted_ranges
            .extend(other.deleted_ranges.iter().cloned());
        self.enforce_deleted_ranges();
    }

    fn enforce_deleted_ranges(&mut self) {
        if self.deleted_ranges.is_empty() {
            return;
        }
        let order = self.index.order();
        let positions: HashMap<&CharId, usize> =
            order.iter().enumerate().map(|(pos, id)| (id, pos)).collect();

        for range in &self.deleted_ranges {
            let (Some(&a), Some(&b)) = (positions.get(&range.first), positions.get(&range.last))
            else {
                continue;
            };
            let (from, to) = if a <= b { (a, b) } else { (b, a) };
            for id in &order[from..=to] {
                if let Some(node) = self.nodes.get_mut(id) {
                    node.deleted = true;
                }
            }
        }
    }
}

impl fmt::Display for TextSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text: String = self.visible().into_iter().map(|(_, ch)| ch).collect();
        f.write_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(replica: &str, clock: u64) -> OpId {
        OpId::new(replica, clock)
    }

    #[test]
    fn test_insert_run_and_read() {
        let mut text = TextSequence::new();
        text.integrate_run(&op("a", 1), None, "Hello");
        assert_eq!(text.to_string(), "Hello");
        assert_eq!(text.len(), 5);

        let origin = text.origin_at(5);
        text.integrate_run(&op("a", 2), origin, " World");
        assert_eq!(text.to_string(), "Hello World");
    }

    #[test]
    fn test_insert_in_middle() {
        let mut text = TextSequence::new();
        text.integrate_run(&op("a", 1), None, "ac");
        let origin = text.origin_at(1);
        text.integrate_run(&op("a", 2), origin, "b");
        assert_eq!(text.to_string(), "abc");
    }

    #[test]
    fn test_concurrent_head_inserts_order_by_id() {
        let mut text = TextSequence::new();
        text.integrate_run(&op("A", 2), None, "Hello");
        text.integrate_run(&op("B", 2), None, "Hi ");
        assert_eq!(text.to_string(), "Hi Hello");

        let mut other = TextSequence::new();
        other.integrate_run(&op("B", 2), None, "Hi ");
        other.integrate_run(&op("A", 2), None, "Hello");
        assert_eq!(other, text);
    }

    #[test]
    fn test_delete_keeps_tombstones() {
        let mut text = TextSequence::new();
        text.integrate_run(&op("a", 1), None, "Hello");
        let (first, last) = text.visible_span(1, 3).unwrap();
        text.delete_range(first, last);

        assert_eq!(text.to_string(), "Ho");
        assert_eq!(text.tombstone_count(), 3);
        assert!(text.is_deleted(&CharId::new(op("a", 1), 2)));
    }

    #[test]
    fn test_delete_wins_over_insert_inside_range() {
        let mut text = TextSequence::new();
        text.integrate_run(&op("a", 1), None, "abcdef");

        // Delete "bcde" and, concurrently, insert "X" after "c"
        let (first, last) = text.visible_span(1, 4).unwrap();
        let origin = text.origin_at(3);
        text.delete_range(first.clone(), last.clone());
        text.integrate_run(&op("b", 2), origin.clone(), "X");
        assert_eq!(text.to_string(), "af");

        let mut reversed = TextSequence::new();
        reversed.integrate_run(&op("a", 1), None, "abcdef");
        reversed.integrate_run(&op("b", 2), origin, "X");
        reversed.delete_range(first, last);
        assert_eq!(reversed, text);
        assert!(text.contains(&CharId::new(op("b", 2), 0)));
    }

    #[test]
    fn test_visible_span_clamps_length() {
        let mut text = TextSequence::new();
        text.integrate_run(&op("a", 1), None, "abc");
        let (first, last) = text.visible_span(1, 10).unwrap();
        assert_eq!(first, CharId::new(op("a", 1), 1));
        assert_eq!(last, CharId::new(op("a", 1), 2));
        assert!(text.visible_span(3, 1).is_none());
    }

    #[test]
    fn test_merge_is_order_independent() {
        let mut base = TextSequence::new();
        base.integrate_run(&op("a", 1), None, "base");

        let mut left = base.clone();
        let origin = left.origin_at(4);
        left.integrate_run(&op("a", 2), origin, "!");

        let mut right = base.clone();
        let (first, last) = right.visible_span(0, 1).unwrap();
        right.delete_range(first, last);

        let mut lr = left.clone();
        lr.merge(&right);
        let mut rl = right.clone();
        rl.merge(&left);

        assert_eq!(lr, rl);
        assert_eq!(lr.to_string(), "ase!");
    }
}
