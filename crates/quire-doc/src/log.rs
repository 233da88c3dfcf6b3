//! Log of applied updates, used to serve catch-up sync.

use crate::op::Update;
use quire_core::StateVector;

/// Every update this replica has integrated, in application order.
///
/// Application order respects causality, so any suffix filtered by a state
/// vector can be replayed on another replica as is. State that arrived as a
/// snapshot (or was compacted away) is not in the log; `baseline` records
/// how much of it there is.
#[derive(Clone, Debug, Default)]
pub struct UpdateLog {
    updates: Vec<Update>,
    baseline: StateVector,
}

impl UpdateLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A log for state loaded from a snapshot covering `baseline`.
    pub fn with_baseline(baseline: StateVector) -> Self {
        Self {
            updates: Vec::new(),
            baseline,
        }
    }

    pub fn push(&mut self, update: Update) {
        self.updates.push(update);
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Update> {
        self.updates.iter()
    }

    pub fn baseline(&self) -> &StateVector {
        &self.baseline
    }

    /// Whether the log alone can bring a replica at `remote` up to date.
    pub fn covers(&self, remote: &StateVector) -> bool {
        remote.dominates(&self.baseline)
    }

    /// Updates `remote` has not seen, in log order.
    pub fn updates_since(&self, remote: &StateVector) -> Vec<Update> {
        self.updates
            .iter()
            .filter(|u| !remote.contains(&u.id))
            .cloned()
            .collect()
    }

    pub fn note_baseline(&mut self, covered: &StateVector) {
        self.baseline.merge(covered);
    }

    /// Drop updates covered by `stable` and fold it into the baseline.
    /// Returns how many updates were dropped.
    pub fn compact(&mut self, stable: &StateVector) -> usize {
        let before = self.updates.len();
        self.updates.retain(|u| !stable.contains(&u.id));
        self.baseline.merge(stable);
        before - self.updates.len()
    }
}
