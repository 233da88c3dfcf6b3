//! State vectors for catch-up sync.
//!
//! A state vector records, per replica, the highest clock this replica has
//! observed from it. Updates from one replica are integrated in the order
//! that replica produced them, so `sv[r] >= c` means every update of `r` up
//! to clock `c` is already applied. Comparing two vectors tells a peer
//! exactly which updates the other side is missing.

use crate::clock::{Clock, OpId};
use crate::lattice::Lattice;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector {
    entries: BTreeMap<String, Clock>,
}

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (String, Clock)>) -> Self {
        let mut sv = Self::new();
        for (replica, clock) in entries {
            sv.observe(&replica, clock);
        }
        sv
    }

    /// Highest clock observed from `replica` (0 if none).
    pub fn get(&self, replica: &str) -> Clock {
        self.entries.get(replica).copied().unwrap_or(0)
    }

    /// Raise the entry for `replica` to `clock` if it is higher.
    pub fn observe(&mut self, replica: &str, clock: Clock) {
        if clock == 0 {
            return;
        }
        match self.entries.get_mut(replica) {
            Some(current) => *current = (*current).max(clock),
            None => {
                self.entries.insert(replica.to_string(), clock);
            }
        }
    }

    /// Whether the update named by `id` is covered by this vector.
    pub fn contains(&self, id: &OpId) -> bool {
        self.get(&id.replica) >= id.clock
    }

    /// True if for every replica, self[r] >= other[r].
    pub fn dominates(&self, other: &StateVector) -> bool {
        other
            .entries
            .iter()
            .all(|(replica, &clock)| self.get(replica) >= clock)
    }

    /// Component-wise max.
    pub fn merge(&mut self, other: &StateVector) {
        for (replica, &clock) in &other.entries {
            self.observe(replica, clock);
        }
    }

    /// Replicas for which `self` has seen more than `other`, as
    /// `(replica, other's clock, self's clock)`.
    pub fn missing_from(&self, other: &StateVector) -> Vec<(String, Clock, Clock)> {
        self.entries
            .iter()
            .filter_map(|(replica, &clock)| {
                let theirs = other.get(replica);
                (clock > theirs).then(|| (replica.clone(), theirs, clock))
            })
            .collect()
    }

    /// Largest clock value of any replica.
    pub fn max_clock(&self) -> Clock {
        self.entries.values().copied().max().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Clock)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Lattice for StateVector {
    fn bottom() -> Self {
        Self::new()
    }

    fn join(&self, other: &Self) -> Self {
        let mut joined = self.clone();
        joined.merge(other);
        joined
    }
}
