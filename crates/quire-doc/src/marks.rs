//! Inline formatting for a block's text.
//!
//! A format operation stores a span anchored on character ids rather than
//! offsets, so it keeps covering the same characters while text moves around
//! it. For every visible character and every mark slot, the covering span
//! with the greatest operation id decides whether the mark is on or off.
//! Characters inserted concurrently inside a span pick up its formatting.

use crate::text::{CharId, TextSequence};
use quire_core::OpId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// The type/style of a formatting mark.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarkType {
    Bold,
    Italic,
    Underline,
    Strikethrough,
    Code,
    Link { url: String },
    Highlight { color: String },
}

impl MarkType {
    /// Marks in the same slot override each other; different links share
    /// the link slot.
    pub fn slot(&self) -> u8 {
        match self {
            MarkType::Bold => 0,
            MarkType::Italic => 1,
            MarkType::Underline => 2,
            MarkType::Strikethrough => 3,
            MarkType::Code => 4,
            MarkType::Link { .. } => 5,
            MarkType::Highlight { .. } => 6,
        }
    }
}

/// A formatting span, inclusive on both ends.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatSpan {
    pub start: CharId,
    pub end: CharId,
    pub mark: MarkType,
    pub enabled: bool,
}

/// A maximal run of visible characters sharing the same marks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRun {
    pub text: String,
    pub marks: Vec<MarkType>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Formatting {
    spans: BTreeMap<OpId, FormatSpan>,
}

impl Formatting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: OpId, span: FormatSpan) {
        self.spans.entry(id).or_insert(span);
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn merge(&mut self, other: &Formatting) {
        for (id, span) in &other.spans {
            self.add(id.clone(), span.clone());
        }
    }

    /// Resolve the visible text of `text` into formatted runs.
    pub fn runs(&self, text: &TextSequence) -> Vec<TextRun> {
        let order = text.ids_in_order();
        let positions: HashMap<&CharId, usize> =
            order.iter().enumerate().map(|(pos, id)| (id, pos)).collect();

        // Spans as position ranges, ascending by op id so later ones override
        let ranges: Vec<(usize, usize, &FormatSpan)> = self
            .spans
            .values()
            .filter_map(|span| {
                let a = *positions.get(&span.start)?;
                let b = *positions.get(&span.end)?;
                Some((a.min(b), a.max(b), span))
            })
            .collect();

        let mut runs: Vec<TextRun> = Vec::new();
        for (pos, id) in order.iter().enumerate() {
            let Some(ch) = text.visible_char(id) else {
                continue;
            };

            let mut slots: BTreeMap<u8, (bool, &MarkType)> = BTreeMap::new();
            for (from, to, span) in &ranges {
                if (*from..=*to).contains(&pos) {
                    slots.insert(span.mark.slot(), (span.enabled, &span.mark));
                }
            }
            let marks: Vec<MarkType> = slots
                .into_values()
                .filter(|(enabled, _)| *enabled)
                .map(|(_, mark)| mark.clone())
                .collect();

            match runs.last_mut() {
                Some(run) if run.marks == marks => run.text.push(ch),
                _ => runs.push(TextRun {
                    text: ch.to_string(),
                    marks,
                }),
            }
        }
        runs
    }
}
