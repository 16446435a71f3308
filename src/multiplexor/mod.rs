//! The public `Multiplexor` handle and its construction-time `Config`.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

mod inner;

use crate::conn::SecuredConnection;
use crate::error::Result;
use crate::stream::MuxStream;
use inner::MultiplexorInner;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Construction-time knobs for a [`Multiplexor`]. No CLI/env wiring (spec
/// §6); build one with [`Config::default`] and the builder methods below,
/// then pass it to [`Multiplexor::new`].
#[derive(Debug, Clone, Default)]
pub struct Config {
    inbox_capacity: Option<usize>,
}

impl Config {
    /// A new default config: unbounded per-stream inboxes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a bounded inbox of `capacity` messages per stream instead of the
    /// default unbounded one. A peer that fills a stream's inbox has only
    /// that stream reset, never the whole connection (spec §5).
    #[must_use]
    pub fn bounded_inbox(mut self, capacity: usize) -> Self {
        self.inbox_capacity = Some(capacity);
        self
    }
}

/// A stream multiplexor over one already-secured, ordered, bidirectional
/// transport.
///
/// `Multiplexor::new` only builds the connection-level state; call
/// [`Multiplexor::start`] once to spawn its background tasks, then
/// `open_stream`/`accept_stream` freely. Cloning is cheap: it shares the
/// same underlying connection state (this is the one place the crate
/// exposes that handle, rather than internal `Dupe` call sites).
#[derive(Debug, Clone)]
pub struct Multiplexor(Arc<MultiplexorInner>);

impl Multiplexor {
    /// Build a multiplexor over `conn`. Does not start any I/O; call
    /// [`Multiplexor::start`] to spawn the read loop and writer task.
    #[must_use]
    pub fn new(conn: Arc<dyn SecuredConnection>, config: Config) -> Self {
        Self(MultiplexorInner::new(conn, config))
    }

    /// Spawn the background tasks (read loop, writer task, dropped-stream
    /// reaper). Must be called exactly once; the returned handle resolves
    /// once the connection has fully torn down (after [`Multiplexor::close`]
    /// or a fatal transport/protocol error).
    pub fn start(&self) -> JoinHandle<()> {
        self.0.spawn()
    }

    /// Open a new outbound stream, racing nothing: the `NewStream` frame is
    /// queued on the writer path and this returns immediately.
    pub fn open_stream(&self) -> Result<MuxStream> {
        self.0.open_stream()
    }

    /// Wait for the next inbound stream the peer opened. Resolves with
    /// [`crate::Error::MultiplexerUnavailable`] once the connection has
    /// shut down and the accept queue is drained and closed (spec §4.5, P7).
    pub async fn accept_stream(&self) -> Result<MuxStream> {
        self.0.accept_stream().await
    }

    /// Close the connection. Idempotent: only the first caller closes the
    /// transport, but every caller waits for teardown (stream table
    /// drained, accept queue closed) to finish before returning (P7).
    pub async fn close(&self) {
        self.0.close().await;
    }

    /// Whether `cleanup` has already run (distinct from merely requested
    /// via `close`, which may still be mid-teardown).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    /// Whether the local endpoint is the one that initiated the underlying
    /// connection (spec §3's distinction from a stream's own `initiator`).
    #[must_use]
    pub fn is_initiator(&self) -> bool {
        self.0.is_initiator()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::DuplexConn;
    use bytes::Bytes;

    fn spawn_pair() -> (Multiplexor, Multiplexor) {
        let (a, b) = DuplexConn::pair();
        let a = Multiplexor::new(Arc::new(a), Config::new());
        let b = Multiplexor::new(Arc::new(b), Config::new());
        a.start();
        b.start();
        (a, b)
    }

    #[tokio::test]
    async fn open_and_accept_round_trip() {
        let (a, b) = spawn_pair();
        let outbound = a.open_stream().unwrap();
        let inbound = b.accept_stream().await.unwrap();
        assert_eq!(inbound.name(), outbound.name());

        outbound.write(Bytes::from_static(b"hello")).unwrap();
        let got = inbound.read(None).await.unwrap();
        assert_eq!(&got[..], b"hello");
    }

    #[tokio::test]
    async fn close_unblocks_pending_accept_with_multiplexer_unavailable() {
        let (a, b) = spawn_pair();
        let accept = tokio::spawn(async move { b.accept_stream().await });
        a.close().await;
        let err = accept.await.unwrap().unwrap_err();
        assert!(matches!(err, crate::Error::MultiplexerUnavailable));
    }

    #[tokio::test]
    async fn remote_close_then_local_close_completes_stream() {
        let (a, b) = spawn_pair();
        let outbound = a.open_stream().unwrap();
        let inbound = b.accept_stream().await.unwrap();

        outbound.close().unwrap();
        let eof = inbound.read(None).await.unwrap();
        assert!(eof.is_empty());
        inbound.close().unwrap();
    }

    #[tokio::test]
    async fn reset_is_observed_on_the_peer() {
        let (a, b) = spawn_pair();
        let outbound = a.open_stream().unwrap();
        let inbound = b.accept_stream().await.unwrap();

        outbound.reset().unwrap();
        let err = inbound.read(None).await.unwrap_err();
        assert!(matches!(err, crate::Error::StreamReset));
    }

    #[tokio::test]
    async fn bounded_inbox_resets_stream_on_overflow() {
        let (a, b) = DuplexConn::pair();
        let a = Multiplexor::new(Arc::new(a), Config::new().bounded_inbox(1));
        let b = Multiplexor::new(Arc::new(b), Config::new().bounded_inbox(1));
        a.start();
        b.start();

        let outbound = a.open_stream().unwrap();
        let inbound = b.accept_stream().await.unwrap();

        outbound.write(Bytes::from_static(b"first")).unwrap();
        outbound.write(Bytes::from_static(b"second")).unwrap();

        // Give the peer's read loop time to apply both frames before the
        // receiver ever reads, so the second one overflows the capacity-1
        // inbox and resets the stream from the receiving side's own table.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let err = inbound.read(None).await.unwrap_err();
        assert!(matches!(err, crate::Error::StreamReset));
    }

    /// Regression test: `open_stream()` used to check `shutting_down`
    /// outside the lock its insert runs under, so a `close()` whose
    /// `cleanup` drained the table entirely between that check and the
    /// insert could strand the freshly-opened stream's table entry —
    /// `cleanup` runs only once, so nothing would ever reset it and its
    /// `read()` would hang forever instead of observing the teardown
    /// (spec invariant 7, P7). Needs real thread parallelism to have a
    /// chance of hitting the race at all.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn open_stream_racing_close_never_strands_the_stream() {
        for _ in 0..200 {
            let (a, b) = DuplexConn::pair();
            let a = Multiplexor::new(Arc::new(a), Config::new());
            let b = Multiplexor::new(Arc::new(b), Config::new());
            a.start();
            b.start();

            let closer = {
                let a = a.clone();
                tokio::spawn(async move { a.close().await })
            };
            let opened = a.open_stream();
            closer.await.unwrap();

            if let Ok(stream) = opened {
                // If a racing `open_stream` still returned a stream, it
                // must observe the teardown promptly rather than hang.
                let read = tokio::time::timeout(std::time::Duration::from_secs(2), stream.read(None)).await;
                assert!(read.is_ok(), "stream.read() hung after a racing close()");
            }
            drop(b);
        }
    }
}
