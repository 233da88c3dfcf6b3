//! # quire-codec
//!
//! Binary encoding for everything Quire replicas exchange.
//!
//! - [`encode`] / [`decode`]: one update per versioned, checksummed frame
//! - [`encode_snapshot`] / [`decode_snapshot`]: full document state
//! - [`seal`] / [`open`]: tagged envelope for protocol messages
//! - [`diff`]: catch-up payload for a peer's state vector
//!
//! Decoding never returns partial results. Any defect in the input is a
//! [`CodecError`], after which the caller falls back to a full-state resync.

pub mod diff;
pub mod envelope;
pub mod error;
mod frame;
pub mod snapshot;
pub mod update;

pub use diff::{diff, Diff};
pub use envelope::{open, seal, TAG_MESSAGE, TAG_SNAPSHOT, TAG_STATE_VECTOR};
pub use error::{CodecError, Result};
pub use frame::{CHECKSUM_LEN, MAX_PAYLOAD};
pub use snapshot::{decode_snapshot, decode_state_vector, encode_snapshot, encode_state_vector};
pub use update::{decode, decode_all, encode, encode_all, FORMAT_VERSION};
