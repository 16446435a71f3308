//! Core of an `/mplex/6.7.0`-compatible stream multiplexer: frame codec,
//! per-stream half-close/reset state, connection-level demultiplexing, and
//! orderly shutdown over an already-secured, ordered, bidirectional
//! transport.
//!
//! Transport construction, handshakes, peer identity, and any application
//! protocol layered on top of streams are out of scope; implement
//! [`SecuredConnection`] over whatever transport you already have and hand
//! it to [`Multiplexor::new`].
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
#![warn(missing_docs, missing_debug_implementations)]
#![forbid(unsafe_code)]

mod conn;
mod dupe;
mod error;
pub mod frame;
mod multiplexor;
mod stream;
mod stream_id;
#[cfg(any(test, feature = "testing"))]
pub mod test_support;
mod varint;

/// The protocol identifier this crate's wire format implements, as
/// negotiated by a multistream-select-style handshake above this crate.
pub const MPLEX_PROTOCOL_ID: &str = "/mplex/6.7.0";

pub use conn::SecuredConnection;
pub use dupe::Dupe;
pub use error::{Error, ParseError, Result};
pub use multiplexor::{Config, Multiplexor};
pub use stream::MuxStream;
pub use stream_id::StreamId;
