//! Unsigned varint (base-128, little-endian, continuation-bit) codec and
//! length-prefixed byte strings, the only place this crate touches raw
//! bytes off the wire. Mirrors `libp2p.utils`'s free-function codec.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::conn::SecuredConnection;
use crate::error::{Error, ParseError, Result};
use bytes::{Bytes, BytesMut};

/// A varint is at most 9 bytes for values up to `u64::MAX`.
const MAX_VARINT_BYTES: usize = 9;

/// Encode `value` as a canonical unsigned LEB128 varint.
///
/// Takes `u128` rather than `u64` so callers that first combine two
/// narrower fields via shift/or (e.g. a frame header's `channel_id << 3 |
/// flag`) can do that combination in a domain wide enough to never wrap,
/// then hand the exact result here instead of pre-truncating it to `u64`.
pub fn encode_uvarint(mut value: u128) -> BytesMut {
    let mut buf = BytesMut::with_capacity(MAX_VARINT_BYTES);
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.extend_from_slice(&[byte]);
        if value == 0 {
            break;
        }
    }
    buf
}

/// Prepend the varint-encoded length of `data` to `data` itself.
pub fn encode_varint_prefixed(data: &[u8]) -> BytesMut {
    let mut buf = encode_uvarint(data.len() as u128);
    buf.extend_from_slice(data);
    buf
}

/// Read a single varint from `conn`, one byte at a time, stopping at the
/// first byte whose continuation bit (0x80) is clear.
///
/// Fails with [`ParseError::VarintTooLong`] if more than 9 bytes are
/// consumed without terminating, or propagates the transport error if the
/// connection ends mid-integer.
pub async fn decode_uvarint_from(conn: &(impl SecuredConnection + ?Sized)) -> Result<u64> {
    let mut value: u64 = 0;
    for i in 0..MAX_VARINT_BYTES {
        let byte = conn.read_byte().await?;
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(Error::Parse(ParseError::VarintTooLong))
}

/// Read a varint length `n`, then read exactly `n` bytes.
pub async fn read_varint_prefixed(conn: &(impl SecuredConnection + ?Sized)) -> Result<Bytes> {
    let len = decode_uvarint_from(conn).await?;
    conn.read_exact(len as usize).await
}
