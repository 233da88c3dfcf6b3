//! Quire core primitives
//!
//! The building blocks every other Quire crate is written against:
//! - [`clock`]: replica ids, operation ids and the Lamport clock
//! - [`state_vector`]: per-replica high-water marks used for catch-up sync
//! - [`lattice`]: the join-semilattice trait behind full-state merges
//! - [`lwwreg`]: a last-writer-wins register stamped with operation ids

pub mod clock;
pub mod lattice;
pub mod lwwreg;
pub mod state_vector;

pub use clock::{Clock, LamportClock, OpId, ReplicaId};
pub use lattice::Lattice;
pub use lwwreg::LwwRegister;
pub use state_vector::StateVector;
