//! In-memory [`SecuredConnection`] test double, standing in for the
//! teacher's test `WebSocket` fixtures. Only compiled for tests.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::conn::SecuredConnection;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{Mutex, Notify};

/// One end of an in-memory duplex pair implementing [`SecuredConnection`].
///
/// `initiator` is set independently on each end so tests can exercise both
/// roles of the same logical connection.
///
/// A real socket's `close`/`shutdown(Both)` unblocks a thread already
/// blocked in a read on that socket; `tokio::io::duplex`'s two split halves
/// don't (shutting down the write half only affects the peer's read side).
/// `closed_notify` closes that gap so this double honors the same
/// full-duplex-close contract `SecuredConnection::close` documents.
#[derive(Debug)]
pub struct DuplexConn {
    read_half: Mutex<tokio::io::ReadHalf<DuplexStream>>,
    write_half: Mutex<tokio::io::WriteHalf<DuplexStream>>,
    initiator: bool,
    closed: AtomicBool,
    closed_notify: Notify,
}

impl DuplexConn {
    /// Build a connected pair: `a` is the initiator, `b` is not.
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Self::wrap(a, true), Self::wrap(b, false))
    }

    /// Build a connected pair where the raw, unwrapped other half of the
    /// duplex stream is handed back directly instead of being wrapped in a
    /// second [`DuplexConn`]. Lets a test act as a fabricated, possibly
    /// protocol-violating peer by reading/writing raw bytes.
    pub fn pair_with_raw_peer() -> (Self, DuplexStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Self::wrap(a, true), b)
    }

    fn wrap(stream: DuplexStream, initiator: bool) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            read_half: Mutex::new(read),
            write_half: Mutex::new(write),
            initiator,
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        }
    }
}

fn closed_error() -> Error {
    Error::Transport(Box::new(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "connection closed",
    )))
}

#[async_trait]
impl SecuredConnection for DuplexConn {
    async fn write(&self, bytes: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }
        let mut half = self.write_half.lock().await;
        half.write_all(bytes)
            .await
            .map_err(|e| Error::Transport(Box::new(e)))?;
        half.flush().await.map_err(|e| Error::Transport(Box::new(e)))
    }

    async fn read_byte(&self) -> Result<u8> {
        // Create the waiter before checking the flag: `Notify` guarantees a
        // `notify_waiters()` that happens anytime after this point is seen
        // by the future below, even though it isn't polled yet.
        let notified = self.closed_notify.notified();
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }
        let mut buf = [0u8; 1];
        tokio::select! {
            biased;
            () = notified => Err(closed_error()),
            res = async {
                let mut half = self.read_half.lock().await;
                half.read_exact(&mut buf).await
            } => res.map(|_| buf[0]).map_err(|e| Error::Transport(Box::new(e))),
        }
    }

    async fn read_exact(&self, n: usize) -> Result<Bytes> {
        let notified = self.closed_notify.notified();
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }
        let mut buf = BytesMut::zeroed(n);
        tokio::select! {
            biased;
            () = notified => Err(closed_error()),
            res = async {
                let mut half = self.read_half.lock().await;
                half.read_exact(&mut buf).await
            } => res.map(|_| buf.freeze()).map_err(|e| Error::Transport(Box::new(e))),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.closed_notify.notify_waiters();
        let mut half = self.write_half.lock().await;
        half.shutdown().await.ok();
        Ok(())
    }

    fn is_initiator(&self) -> bool {
        self.initiator
    }

    fn remote_address(&self) -> Option<String> {
        None
    }
}
