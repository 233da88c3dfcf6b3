//! Replica identity and logical time.
//!
//! Every update in a document is named by an [`OpId`]: the replica that
//! produced it plus that replica's Lamport clock at the time. Operation ids
//! are totally ordered by `(clock, replica)`, which is the tie-break used
//! wherever two concurrent updates compete for the same slot.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Identifier of a replica (one engine instance of one document).
pub type ReplicaId = String;

/// A Lamport clock value.
pub type Clock = u64;

/// Unique identifier of an update.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub replica: ReplicaId,
    pub clock: Clock,
}

impl OpId {
    pub fn new(replica: impl Into<ReplicaId>, clock: Clock) -> Self {
        Self {
            replica: replica.into(),
            clock,
        }
    }

    /// The id that sorts below every real update.
    pub fn zero() -> Self {
        Self {
            replica: ReplicaId::new(),
            clock: 0,
        }
    }
}

impl Ord for OpId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.clock
            .cmp(&other.clock)
            .then_with(|| self.replica.cmp(&other.replica))
    }
}

impl PartialOrd for OpId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.clock, self.replica)
    }
}

/// Lamport clock for a single replica.
///
/// `tick` yields the clock for a new local update; `observe` folds in the
/// clock of every remote update that gets integrated, so the next local
/// update is ordered after everything this replica has seen.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LamportClock {
    value: Clock,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self) -> Clock {
        self.value
    }

    /// Advance and return the clock for a new local event.
    pub fn tick(&mut self) -> Clock {
        self.value += 1;
        self.value
    }

    /// Record a clock value seen on a remote event.
    pub fn observe(&mut self, seen: Clock) {
        self.value = self.value.max(seen);
    }
}
