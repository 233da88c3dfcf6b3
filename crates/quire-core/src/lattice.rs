//! Join-semilattice trait used for full-state merges.
//!
//! A join-semilattice (S, ⊔) satisfies:
//! - Commutativity: a ⊔ b = b ⊔ a
//! - Associativity: (a ⊔ b) ⊔ c = a ⊔ (b ⊔ c)
//! - Idempotence:  a ⊔ a = a
//!
//! Quire replicates by exchanging updates; the lattice is what a replica
//! falls back to when it has to absorb a peer's whole state at once.

use std::cmp::Ordering;

pub trait Lattice: Clone + PartialEq {
    /// The bottom element (identity for join)
    fn bottom() -> Self;

    /// Least upper bound of `self` and `other`.
    fn join(&self, other: &Self) -> Self;

    /// Partial order derived from join: a ≤ b iff a ⊔ b = b
    fn partial_cmp_lattice(&self, other: &Self) -> Option<Ordering> {
        let joined = self.join(other);
        match (&joined == self, &joined == other) {
            (true, true) => Some(Ordering::Equal),
            (false, true) => Some(Ordering::Less),
            (true, false) => Some(Ordering::Greater),
            (false, false) => None,
        }
    }

    fn leq(&self, other: &Self) -> bool {
        matches!(
            self.partial_cmp_lattice(other),
            Some(Ordering::Less) | Some(Ordering::Equal)
        )
    }

    /// self = self ⊔ other
    fn join_assign(&mut self, other: &Self) {
        *self = self.join(other);
    }
}
