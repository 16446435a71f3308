//! The secured-connection contract this core consumes (spec §6).
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// A reliable, ordered, bidirectional byte transport that has already been
/// authenticated and secured by a layer above this crate.
///
/// The core never constructs one of these; it only consumes the contract.
/// Implementations are expected to be cheap to clone (an `Arc` wrapper
/// around the real socket) since the multiplexor hands out a handle to
/// both its read-loop task and its writer task.
#[async_trait]
pub trait SecuredConnection: Send + Sync + 'static {
    /// Write `bytes` to the connection, preserving order relative to other
    /// calls to `write` made by the same caller.
    async fn write(&self, bytes: &[u8]) -> Result<()>;

    /// Read exactly one byte. Used by the varint decoder.
    async fn read_byte(&self) -> Result<u8>;

    /// Read exactly `n` bytes, or fail with an incomplete-read error.
    async fn read_exact(&self, n: usize) -> Result<Bytes>;

    /// Idempotently close the connection. After this returns, further
    /// reads and writes fail.
    async fn close(&self) -> Result<()>;

    /// Whether this endpoint is the one that initiated the underlying
    /// connection (not to be confused with a stream's own `initiator`).
    fn is_initiator(&self) -> bool;

    /// The remote peer's address, if the transport exposes one.
    fn remote_address(&self) -> Option<String>;
}
