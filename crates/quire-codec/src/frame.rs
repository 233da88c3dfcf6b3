//! Length-prefixed field reader and writer, plus the trailing checksum.

use crate::error::{CodecError, Result};
use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Bytes of SHA-256 kept as the frame checksum.
pub const CHECKSUM_LEN: usize = 8;

/// Upper bound for a single bincode payload.
pub const MAX_PAYLOAD: u64 = 64 * 1024 * 1024;

/// Fixed-width, little-endian bincode with a size limit. Payloads must be
/// consumed exactly.
fn payload_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_PAYLOAD)
        .reject_trailing_bytes()
}

pub(crate) fn to_payload<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(payload_options().serialize(value)?)
}

pub(crate) fn from_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(payload_options().deserialize(bytes)?)
}

pub(crate) fn checksum(bytes: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = Sha256::digest(bytes);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&digest[..CHECKSUM_LEN]);
    out
}

/// Split `bytes` into body and checksum and verify it.
pub(crate) fn verified_body(bytes: &[u8]) -> Result<&[u8]> {
    if bytes.len() < CHECKSUM_LEN {
        return Err(CodecError::Truncated {
            needed: CHECKSUM_LEN,
            remaining: bytes.len(),
        });
    }
    let (body, sum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
    if checksum(body).as_slice() != sum {
        return Err(CodecError::ChecksumMismatch);
    }
    Ok(body)
}

#[derive(Default)]
pub(crate) struct FrameWriter {
    buf: Vec<u8>,
}

impl FrameWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// A utf-8 string behind a big-endian u16 length.
    pub fn put_str16(&mut self, field: &'static str, value: &str) -> Result<()> {
        let len = u16::try_from(value.len()).map_err(|_| CodecError::FieldTooLong {
            field,
            len: value.len(),
        })?;
        self.buf.extend_from_slice(&len.to_be_bytes());
        self.buf.extend_from_slice(value.as_bytes());
        Ok(())
    }

    /// Raw bytes behind a big-endian u32 length.
    pub fn put_bytes32(&mut self, field: &'static str, value: &[u8]) -> Result<()> {
        let len = u32::try_from(value.len()).map_err(|_| CodecError::FieldTooLong {
            field,
            len: value.len(),
        })?;
        self.buf.extend_from_slice(&len.to_be_bytes());
        self.buf.extend_from_slice(value);
        Ok(())
    }

    /// Append the checksum of everything written so far.
    pub fn finish(mut self) -> Vec<u8> {
        let sum = checksum(&self.buf);
        self.buf.extend_from_slice(&sum);
        self.buf
    }
}

pub(crate) struct FrameReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let mut raw = [0u8; 2];
        raw.copy_from_slice(self.take(2)?);
        Ok(u16::from_be_bytes(raw))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(raw))
    }

    pub fn u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(raw))
    }

    pub fn str16(&mut self, field: &'static str) -> Result<&'a str> {
        let len = self.u16()? as usize;
        std::str::from_utf8(self.take(len)?).map_err(|_| CodecError::InvalidUtf8(field))
    }

    pub fn bytes32(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    /// Fail unless every byte was consumed.
    pub fn finish(self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }
}
