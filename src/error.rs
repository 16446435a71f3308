//! Error types surfaced by the core.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use thiserror::Error;

/// A malformed or truncated frame on the wire.
#[derive(Debug, Error)]
pub enum ParseError {
    /// A varint did not terminate within 9 bytes.
    #[error("varint is longer than 9 bytes")]
    VarintTooLong,
    /// The secured connection ended before a varint or payload was fully read.
    #[error("incomplete read: expected {expected} more byte(s)")]
    IncompleteRead {
        /// How many more bytes were needed.
        expected: usize,
    },
}

/// Errors surfaced by [`crate::Multiplexor`] and [`crate::MuxStream`].
#[derive(Debug, Error)]
pub enum Error {
    /// The connection is shutting down, closed, or encountered a fatal
    /// transport/parse error. Surfaced from `open_stream`, `accept_stream`,
    /// and from stream operations whose completion depends on the
    /// multiplexor's background tasks.
    #[error("multiplexor unavailable")]
    MultiplexerUnavailable,
    /// The local side of the stream is already closed.
    #[error("stream closed")]
    StreamClosed,
    /// The stream was reset by either side.
    #[error("stream reset")]
    StreamReset,
    /// A frame failed to parse.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// The underlying secured connection returned an error.
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
