//! Checksummed envelope for anything serde can encode.
//!
//! `[version: u8][tag: u8][payload: u32 length + bincode][checksum: 8]`.
//! The tag keeps one kind of envelope from being opened as another.

use crate::error::{CodecError, Result};
use crate::frame::{from_payload, to_payload, verified_body, FrameReader, FrameWriter};
use crate::update::{check_version, FORMAT_VERSION};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub const TAG_SNAPSHOT: u8 = b'S';
pub const TAG_STATE_VECTOR: u8 = b'V';
pub const TAG_MESSAGE: u8 = b'M';

pub fn seal<T: Serialize + ?Sized>(tag: u8, value: &T) -> Result<Vec<u8>> {
    let mut writer = FrameWriter::new();
    writer.put_u8(FORMAT_VERSION);
    writer.put_u8(tag);
    writer.put_bytes32("payload", &to_payload(value)?)?;
    Ok(writer.finish())
}

pub fn open<T: DeserializeOwned>(tag: u8, bytes: &[u8]) -> Result<T> {
    check_version(bytes)?;
    let body = verified_body(bytes)?;

    let mut reader = FrameReader::new(body);
    reader.u8()?;
    let found = reader.u8()?;
    if found != tag {
        return Err(CodecError::UnexpectedTag {
            expected: tag,
            found,
        });
    }
    let value = from_payload(reader.bytes32()?)?;
    reader.finish()?;
    Ok(value)
}
