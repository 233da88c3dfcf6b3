//! Full document state and state vectors on the wire.

use crate::envelope::{open, seal, TAG_SNAPSHOT, TAG_STATE_VECTOR};
use crate::error::Result;
use quire_core::StateVector;
use quire_doc::DocumentState;

pub fn encode_snapshot(state: &DocumentState) -> Result<Vec<u8>> {
    seal(TAG_SNAPSHOT, state)
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<DocumentState> {
    open(TAG_SNAPSHOT, bytes)
}

pub fn encode_state_vector(sv: &StateVector) -> Result<Vec<u8>> {
    seal(TAG_STATE_VECTOR, sv)
}

pub fn decode_state_vector(bytes: &[u8]) -> Result<StateVector> {
    open(TAG_STATE_VECTOR, bytes)
}
