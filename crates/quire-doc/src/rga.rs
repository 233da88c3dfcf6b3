//! Replicated Growable Array ordering.
//!
//! Both the block list and every block's characters are RGA sequences: each
//! element is inserted after an origin element (or at the head), and siblings
//! that share an origin are kept in descending id order. The document order
//! is the depth-first pre-order walk of that tree. Because the sibling order
//! only depends on ids, every replica builds the same tree regardless of the
//! order in which it integrated the elements.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RgaIndex<Id: Ord> {
    /// Elements inserted at the head, descending.
    roots: Vec<Id>,
    /// origin -> elements inserted right after it, descending.
    children: BTreeMap<Id, Vec<Id>>,
}

impl<Id: Ord + Clone> RgaIndex<Id> {
    pub(crate) fn new() -> Self {
        Self {
            roots: Vec::new(),
            children: BTreeMap::new(),
        }
    }

    /// Place `id` after `origin`. Re-inserting a known id is a no-op.
    pub(crate) fn insert(&mut self, id: Id, origin: Option<&Id>) {
        let siblings = match origin {
            None => &mut self.roots,
            Some(origin) => self.children.entry(origin.clone()).or_default(),
        };
        if siblings.contains(&id) {
            return;
        }
        // Greater ids go first
        let pos = siblings
            .iter()
            .position(|s| s < &id)
            .unwrap_or(siblings.len());
        siblings.insert(pos, id);
    }

    /// All elements in document order, tombstones included.
    pub(crate) fn order(&self) -> Vec<Id> {
        let mut out = Vec::new();
        let mut stack: Vec<&Id> = self.roots.iter().rev().collect();
        while let Some(id) = stack.pop() {
            out.push(id.clone());
            if let Some(children) = self.children.get(id) {
                stack.extend(children.iter().rev());
            }
        }
        out
    }
}
