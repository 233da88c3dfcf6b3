//! What a peer is missing, given its state vector.

use quire_core::StateVector;
use quire_doc::{Update, UpdateLog};

/// Catch-up payload for one peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Diff {
    /// Missing updates in causal order. Empty when the peer is up to date.
    Updates(Vec<Update>),
    /// The log cannot reconstruct what the peer lacks; send the full state.
    FullState,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        matches!(self, Diff::Updates(updates) if updates.is_empty())
    }
}

/// Compute what a replica at `remote` needs from a replica holding `log`
/// and `local`.
pub fn diff(log: &UpdateLog, local: &StateVector, remote: &StateVector) -> Diff {
    if remote.dominates(local) {
        return Diff::Updates(Vec::new());
    }
    if remote.is_empty() || !log.covers(remote) {
        return Diff::FullState;
    }
    Diff::Updates(log.updates_since(remote))
}
