//! Last-Write-Wins register stamped with operation ids
//!
//! The register keeps the value written by the greatest [`OpId`]. Because
//! operation ids are totally ordered by `(clock, replica)` there is never a
//! tie to break: two distinct writes always have distinct stamps.

use crate::clock::OpId;
use crate::lattice::Lattice;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwRegister<T> {
    value: T,
    stamp: OpId,
}

impl<T: Clone + PartialEq> LwwRegister<T> {
    pub fn new(value: T, stamp: OpId) -> Self {
        Self { value, stamp }
    }

    /// Write `value` if `stamp` is newer than the current one.
    /// Returns whether the write took effect.
    pub fn set(&mut self, value: T, stamp: OpId) -> bool {
        if stamp > self.stamp {
            self.value = value;
            self.stamp = stamp;
            true
        } else {
            false
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn stamp(&self) -> &OpId {
        &self.stamp
    }
}

impl<T: Clone + PartialEq + Default> Lattice for LwwRegister<T> {
    fn bottom() -> Self {
        Self {
            value: T::default(),
            stamp: OpId::zero(),
        }
    }

    fn join(&self, other: &Self) -> Self {
        if other.stamp > self.stamp {
            other.clone()
        } else {
            self.clone()
        }
    }
}
