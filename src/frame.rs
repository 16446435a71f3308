//! Wire frame: `Header Length Payload`, and the 3-bit `Flag` tag (spec §3, §6).
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::conn::SecuredConnection;
use crate::error::{Error, ParseError, Result};
use crate::stream_id::StreamId;
use crate::varint::{decode_uvarint_from, encode_uvarint, encode_varint_prefixed, read_varint_prefixed};
use bytes::{Bytes, BytesMut};

/// The 3-bit tag carried in every frame's header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    /// Open a stream with the enclosed UTF-8 name as payload.
    NewStream,
    /// Data sent by the non-initiator side.
    MessageReceiver,
    /// Data sent by the initiator side.
    MessageInitiator,
    /// Non-initiator half-closes its write side.
    CloseReceiver,
    /// Initiator half-closes its write side.
    CloseInitiator,
    /// Non-initiator aborts the stream.
    ResetReceiver,
    /// Initiator aborts the stream.
    ResetInitiator,
    /// Anything outside 0..=6. Carries the raw value for diagnostics.
    Unknown(u8),
}

impl Flag {
    const fn value(self) -> u8 {
        match self {
            Self::NewStream => 0,
            Self::MessageReceiver => 1,
            Self::MessageInitiator => 2,
            Self::CloseReceiver => 3,
            Self::CloseInitiator => 4,
            Self::ResetReceiver => 5,
            Self::ResetInitiator => 6,
            Self::Unknown(v) => v,
        }
    }

    const fn from_value(v: u8) -> Self {
        match v {
            0 => Self::NewStream,
            1 => Self::MessageReceiver,
            2 => Self::MessageInitiator,
            3 => Self::CloseReceiver,
            4 => Self::CloseInitiator,
            5 => Self::ResetReceiver,
            6 => Self::ResetInitiator,
            other => Self::Unknown(other),
        }
    }

    /// Message flag for the given sender role.
    #[must_use]
    pub const fn message_for(initiator: bool) -> Self {
        if initiator {
            Self::MessageInitiator
        } else {
            Self::MessageReceiver
        }
    }

    /// Close flag for the given sender role.
    #[must_use]
    pub const fn close_for(initiator: bool) -> Self {
        if initiator {
            Self::CloseInitiator
        } else {
            Self::CloseReceiver
        }
    }

    /// Reset flag for the given sender role.
    #[must_use]
    pub const fn reset_for(initiator: bool) -> Self {
        if initiator {
            Self::ResetInitiator
        } else {
            Self::ResetReceiver
        }
    }

    /// The sender-role bit encoded in this flag, per spec §3: "the local
    /// `initiator` flag is the inverse of the sender's role", i.e. the low
    /// bit of the flag (after `NewStream`) directly gives the *sender's*
    /// `is_initiator`. Meaningless for `NewStream` and `Unknown`.
    const fn sender_is_initiator(self) -> bool {
        self.value() & 1 == 1
    }
}

/// One decoded frame: the logical stream it targets, the flag, and the
/// payload bytes (arbitrary for Message, name for NewStream, empty for
/// Close/Reset but any length is tolerated).
#[derive(Debug, Clone)]
pub struct Frame {
    /// Channel id carried in the header (not yet paired with local role).
    pub channel_id: u64,
    /// The flag.
    pub flag: Flag,
    /// Payload bytes, exactly as received/to be sent.
    pub payload: Bytes,
}

impl Frame {
    /// Construct a frame to be emitted for `stream_id` carrying `flag`.
    #[must_use]
    pub fn new(channel_id: u64, flag: Flag, payload: Bytes) -> Self {
        Self {
            channel_id,
            flag,
            payload,
        }
    }

    /// The local `StreamId` this frame targets, per spec §3's flag-bit rule.
    ///
    /// For `NewStream` the local side is always the non-initiator (the
    /// peer opened it), which is also what `flag & 1 == 0` would yield.
    #[must_use]
    pub fn local_stream_id(&self) -> StreamId {
        let initiator = match self.flag {
            Flag::NewStream => false,
            other => other.sender_is_initiator(),
        };
        StreamId::new(self.channel_id, initiator)
    }

    /// Encode this frame as `varint(channel_id<<3|flag) || varint(len) || payload`.
    #[must_use]
    pub fn encode(&self) -> BytesMut {
        // Combine in `u128`, not `u64`: `channel_id` is itself a full `u64`
        // (spec.md §6 requires supporting at least 62-bit ids), so shifting
        // it left by 3 in 64-bit arithmetic silently wraps for any
        // `channel_id >= 2^61` instead of failing loudly. A header that
        // doesn't fit back into the wire's 9-byte varint cap still fails,
        // but explicitly, at decode time, rather than silently addressing
        // the wrong stream.
        let header = (u128::from(self.channel_id) << 3) | u128::from(self.flag.value());
        let mut buf = encode_uvarint(header);
        buf.unsplit(encode_varint_prefixed(&self.payload));
        buf
    }

    /// Read one frame off `conn`: header varint, length varint, then exactly
    /// that many payload bytes.
    pub async fn read_from(conn: &(impl SecuredConnection + ?Sized)) -> Result<Self> {
        let header = decode_uvarint_from(conn).await?;
        let flag = Flag::from_value((header & 0x7) as u8);
        let channel_id = header >> 3;
        let payload = read_varint_prefixed(conn).await?;
        Ok(Self {
            channel_id,
            flag,
            payload,
        })
    }
}

/// Parse a complete, already-buffered `header || length || payload` sequence.
/// Used only by tests and the fuzz target; production code always reads
/// frame-by-frame off a [`SecuredConnection`] via [`Frame::read_from`].
pub fn decode(mut bytes: &[u8]) -> Result<(Frame, usize)> {
    let start_len = bytes.len();
    let header = read_uvarint_from_slice(&mut bytes)?;
    let len = read_uvarint_from_slice(&mut bytes)? as usize;
    if bytes.len() < len {
        return Err(Error::Parse(ParseError::IncompleteRead {
            expected: len - bytes.len(),
        }));
    }
    let payload = Bytes::copy_from_slice(&bytes[..len]);
    let consumed = start_len - (bytes.len() - len);
    let flag = Flag::from_value((header & 0x7) as u8);
    let channel_id = header >> 3;
    Ok((
        Frame {
            channel_id,
            flag,
            payload,
        },
        consumed,
    ))
}

fn read_uvarint_from_slice(bytes: &mut &[u8]) -> Result<u64> {
    let mut value: u64 = 0;
    for i in 0..9 {
        let Some((&byte, rest)) = bytes.split_first() else {
            return Err(Error::Parse(ParseError::IncompleteRead { expected: 1 }));
        };
        *bytes = rest;
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(Error::Parse(ParseError::VarintTooLong))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        // `(1u64 << 60) - 1` is the largest channel_id whose header
        // (`channel_id << 3 | flag`) still fits the wire's 9-byte varint
        // cap (max representable value `2^63 - 1`); anything larger cannot
        // round-trip through this wire format at all regardless of how the
        // header arithmetic is done, so it isn't a valid round-trip case
        // (see `oversized_channel_id_fails_loudly_instead_of_wrapping`).
        for &(cid, flag, payload) in &[
            (0u64, Flag::NewStream, &b"0"[..]),
            (0u64, Flag::MessageInitiator, &b"hello"[..]),
            (1u64, Flag::CloseReceiver, &b""[..]),
            ((1u64 << 60) - 1, Flag::ResetInitiator, &b""[..]),
        ] {
            let frame = Frame::new(cid, flag, Bytes::copy_from_slice(payload));
            let encoded = frame.encode();
            let (decoded, consumed) = decode(&encoded).unwrap();
            assert_eq!(consumed, encoded.len());
            assert_eq!(decoded.channel_id, cid);
            assert_eq!(decoded.flag.value(), flag.value());
            assert_eq!(&decoded.payload[..], payload);
        }
    }

    #[test]
    fn oversized_channel_id_fails_loudly_instead_of_wrapping() {
        // Before combining `channel_id << 3 | flag` in `u128`, this exact
        // value overflowed `u64` and silently wrapped to a header of just
        // `flag` (channel_id truncated to 0). Now the header is computed
        // without wrapping, so encoding this oversized id produces a
        // header that genuinely doesn't fit a 9-byte varint, and decoding
        // it fails explicitly rather than quietly addressing channel 0.
        let frame = Frame::new(1u64 << 61, Flag::ResetInitiator, Bytes::new());
        let encoded = frame.encode();
        let err = decode(&encoded).unwrap_err();
        assert!(matches!(err, Error::Parse(ParseError::VarintTooLong)));
    }

    #[test]
    fn s1_new_stream_zero() {
        let frame = Frame::new(0, Flag::NewStream, Bytes::from_static(b"0"));
        let encoded = frame.encode();
        assert_eq!(&encoded[..], &[0x00, 0x01, 0x30]);
    }

    #[test]
    fn s2_message_hello() {
        let frame = Frame::new(0, Flag::MessageInitiator, Bytes::from_static(b"hello"));
        let encoded = frame.encode();
        assert_eq!(&encoded[..], &[0x02, 0x05, 0x68, 0x65, 0x6c, 0x6c, 0x6f]);
    }

    #[test]
    fn s4_close_initiator() {
        let frame = Frame::new(0, Flag::CloseInitiator, Bytes::new());
        let encoded = frame.encode();
        assert_eq!(&encoded[..], &[0x04, 0x00]);
    }

    #[test]
    fn s6_unknown_flag_targeting_existing_stream() {
        // header = varint((5<<3)|7) = 0x2f
        let header = (5u64 << 3) | 7;
        assert_eq!(header, 0x2f);
        let frame = Frame::new(5, Flag::from_value(7), Bytes::new());
        assert!(matches!(frame.flag, Flag::Unknown(7)));
    }

    #[test]
    fn local_stream_id_for_new_stream_is_non_initiator() {
        let frame = Frame::new(3, Flag::NewStream, Bytes::from_static(b"3"));
        let id = frame.local_stream_id();
        assert_eq!(id.channel_id, 3);
        assert!(!id.initiator);
    }

    #[test]
    fn local_stream_id_for_message_follows_sender_bit() {
        let from_initiator = Frame::new(0, Flag::MessageInitiator, Bytes::new());
        assert!(from_initiator.local_stream_id().initiator);
        let from_receiver = Frame::new(0, Flag::MessageReceiver, Bytes::new());
        assert!(!from_receiver.local_stream_id().initiator);
    }

    #[test]
    fn incomplete_payload_is_rejected() {
        // header=0x02 (Message, channel 0), length=5, but only 2 bytes follow.
        let bytes = [0x02, 0x05, b'h', b'i'];
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(
            err,
            Error::Parse(ParseError::IncompleteRead { .. })
        ));
    }
}
