//! Wire encoding of a single update.
//!
//! ```text
//! [version: u8]
//! [document id: u16 length + utf-8]
//! [op type: u8]
//! [replica id: u16 length + utf-8]
//! [clock: u64 BE]
//! [payload: u32 length + bincode(prev, change)]
//! [checksum: first 8 bytes of SHA-256 over everything above]
//! ```

use crate::error::{CodecError, Result};
use crate::frame::{from_payload, to_payload, verified_body, FrameReader, FrameWriter};
use quire_core::{Clock, OpId};
use quire_doc::{Change, OpKind, Update};

/// The only format version this build reads and writes.
pub const FORMAT_VERSION: u8 = 1;

/// Encode an update. Equal updates always produce equal bytes.
pub fn encode(update: &Update) -> Result<Vec<u8>> {
    let mut writer = FrameWriter::new();
    writer.put_u8(FORMAT_VERSION);
    writer.put_str16("document id", &update.document_id)?;
    writer.put_u8(update.kind().tag());
    writer.put_str16("replica id", &update.id.replica)?;
    writer.put_u64(update.id.clock);
    let payload = to_payload(&(update.prev, &update.change))?;
    writer.put_bytes32("payload", &payload)?;
    Ok(writer.finish())
}

/// Decode one update, rejecting anything that is not exactly one valid
/// frame of the supported version.
pub fn decode(bytes: &[u8]) -> Result<Update> {
    check_version(bytes)?;
    let body = verified_body(bytes)?;

    let mut reader = FrameReader::new(body);
    reader.u8()?;
    let document_id = reader.str16("document id")?.to_string();
    let tag = reader.u8()?;
    let header_kind = OpKind::from_tag(tag).ok_or(CodecError::UnknownOpType(tag))?;
    let replica = reader.str16("replica id")?.to_string();
    let clock = reader.u64()?;
    let (prev, change): (Clock, Change) = from_payload(reader.bytes32()?)?;
    reader.finish()?;

    if change.kind() != header_kind {
        return Err(CodecError::KindMismatch {
            header: tag,
            payload: change.kind().tag(),
        });
    }

    Ok(Update {
        document_id,
        id: OpId::new(replica, clock),
        prev,
        change,
    })
}

pub(crate) fn check_version(bytes: &[u8]) -> Result<()> {
    match bytes.first() {
        None => Err(CodecError::Truncated {
            needed: 1,
            remaining: 0,
        }),
        Some(&FORMAT_VERSION) => Ok(()),
        Some(&found) => Err(CodecError::UnsupportedVersion {
            found,
            supported: FORMAT_VERSION,
        }),
    }
}

/// Encode a batch, failing on the first update that cannot be encoded.
pub fn encode_all<'a>(updates: impl IntoIterator<Item = &'a Update>) -> Result<Vec<Vec<u8>>> {
    updates.into_iter().map(encode).collect()
}

/// Decode a batch as a unit: one bad frame fails the whole batch.
pub fn decode_all<B: AsRef<[u8]>>(frames: &[B]) -> Result<Vec<Update>> {
    frames.iter().map(|f| decode(f.as_ref())).collect()
}
