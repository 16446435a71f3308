//! Per-stream read buffer, half-close/reset state, and the user-facing
//! `read`/`write`/`close`/`reset` API (spec §3, §4.2).
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::dupe::Dupe;
use crate::error::{Error, Result};
use crate::frame::Flag;
use crate::stream_id::StreamId;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::trace;

/// A command a [`MuxStream`] sends to the multiplexor's writer path. The
/// stream never touches the transport directly (spec invariant 8).
#[derive(Debug)]
pub(crate) enum OutboundCommand {
    /// Emit a frame with this flag and payload for this stream.
    Frame(Flag, Bytes),
}

/// The three booleans of spec §4.2's state table, always mutated together.
#[derive(Debug, Default, Clone, Copy)]
struct CloseState {
    local_closed: bool,
    remote_closed: bool,
    reset: bool,
}

/// The sending half of a stream's inbox: unbounded by default, or bounded
/// when `Config::bounded_inbox` is set.
#[derive(Debug)]
pub(crate) enum InboxTx {
    Unbounded(mpsc::UnboundedSender<Bytes>),
    Bounded(mpsc::Sender<Bytes>),
}

impl InboxTx {
    /// Push a payload onto the inbox. Returns `true` if the bounded inbox
    /// was full and the stream should be reset (spec §5's bounded
    /// alternative); a dropped receiver is harmless and never reported as
    /// an overflow, since the dropped-stream path already handles that.
    fn push(&self, payload: Bytes) -> bool {
        match self {
            Self::Unbounded(tx) => {
                tx.send(payload).ok();
                false
            }
            Self::Bounded(tx) => matches!(tx.try_send(payload), Err(mpsc::error::TrySendError::Full(_))),
        }
    }
}

/// The receiving half of a stream's inbox, mirroring [`InboxTx`].
#[derive(Debug)]
pub(crate) enum InboxRx {
    Unbounded(mpsc::UnboundedReceiver<Bytes>),
    Bounded(mpsc::Receiver<Bytes>),
}

impl InboxRx {
    async fn recv(&mut self) -> Option<Bytes> {
        match self {
            Self::Unbounded(rx) => rx.recv().await,
            Self::Bounded(rx) => rx.recv().await,
        }
    }
}

/// A single logical, independently-half-closable, bidirectional stream.
///
/// `MuxStream` holds no reference back to the owning multiplexor: it only
/// holds channel endpoints, following the teacher's resolution of the
/// stream/multiplexor cyclic reference (spec §9).
#[derive(Debug)]
pub struct MuxStream {
    pub(crate) id: StreamId,
    name: String,
    inbox: AsyncMutex<InboxRx>,
    read_leftover: Mutex<Option<Bytes>>,
    close_state: Arc<Mutex<CloseState>>,
    outbound: mpsc::UnboundedSender<(StreamId, OutboundCommand)>,
    /// Notifies the multiplexor when this handle is dropped without an
    /// explicit `close()`/`reset()`, so the table entry isn't leaked.
    dropped_tx: mpsc::UnboundedSender<StreamId>,
    remote_address: Option<String>,
}

impl MuxStream {
    pub(crate) fn new(
        id: StreamId,
        name: String,
        inbox: InboxRx,
        outbound: mpsc::UnboundedSender<(StreamId, OutboundCommand)>,
        dropped_tx: mpsc::UnboundedSender<StreamId>,
        remote_address: Option<String>,
    ) -> Self {
        Self {
            id,
            name,
            inbox: AsyncMutex::new(inbox),
            read_leftover: Mutex::new(None),
            close_state: Arc::new(Mutex::new(CloseState::default())),
            outbound,
            dropped_tx,
            remote_address,
        }
    }

    /// This stream's id.
    #[must_use]
    pub const fn id(&self) -> StreamId {
        self.id
    }

    /// The name the initiator chose when opening this stream.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The remote peer's address, delegated to the secured transport.
    #[must_use]
    pub fn get_remote_address(&self) -> Option<&str> {
        self.remote_address.as_deref()
    }

    pub(crate) fn close_state_handle(&self) -> Arc<Mutex<CloseState>> {
        self.close_state.dupe()
    }

    /// Read up to `max_len` bytes. If `max_len` is `None`, return whatever
    /// is next available in one call.
    ///
    /// Satisfies from `read_leftover` first; otherwise waits on the inbox.
    /// Returns `Ok(empty)` at end-of-stream, or [`Error::StreamReset`] if
    /// the stream was reset.
    pub async fn read(&self, max_len: Option<usize>) -> Result<Bytes> {
        loop {
            let mut leftover = self.read_leftover.lock();
            if let Some(buf) = leftover.take() {
                if buf.is_empty() {
                    return Ok(buf);
                }
                let take = max_len.map_or(buf.len(), |n| n.min(buf.len()));
                let mut buf = buf;
                let out = buf.split_to(take);
                if !buf.is_empty() {
                    *leftover = Some(buf);
                }
                return Ok(out);
            }
            drop(leftover);

            // Nothing buffered: wait for the next message or end-of-stream.
            // `recv` is cancel-safe, so a cancelled `read` loses no bytes.
            let next = self.inbox.lock().await.recv().await;
            match next {
                Some(bytes) => {
                    *self.read_leftover.lock() = Some(bytes);
                    // loop back around to serve from leftover
                }
                None => {
                    let state = *self.close_state.lock();
                    return if state.reset {
                        Err(Error::StreamReset)
                    } else {
                        Ok(Bytes::new())
                    };
                }
            }
        }
    }

    /// Write `bytes` as a single Message frame. Fails if the local side is
    /// closed or the stream was reset. The wire protocol never fragments:
    /// the whole buffer becomes one frame.
    pub fn write(&self, bytes: Bytes) -> Result<usize> {
        let state = *self.close_state.lock();
        if state.reset {
            return Err(Error::StreamReset);
        }
        if state.local_closed {
            return Err(Error::StreamClosed);
        }
        let len = bytes.len();
        let flag = Flag::message_for(self.id.initiator);
        self.send_frame(flag, bytes)?;
        Ok(len)
    }

    /// Half-close the local write side. Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut state = self.close_state.lock();
        if state.local_closed {
            return Ok(());
        }
        state.local_closed = true;
        let both_closed = state.remote_closed;
        drop(state);

        let flag = Flag::close_for(self.id.initiator);
        self.send_frame(flag, Bytes::new())?;
        if both_closed {
            self.dropped_tx.send(self.id).ok();
        }
        Ok(())
    }

    /// Abort the stream immediately, both directions. Idempotent.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.close_state.lock();
        if state.local_closed && state.remote_closed {
            return Ok(());
        }
        state.local_closed = true;
        state.remote_closed = true;
        state.reset = true;
        drop(state);

        let flag = Flag::reset_for(self.id.initiator);
        // Best effort: if the writer path is already gone the connection
        // is tearing down anyway and the reset is implicit.
        self.send_frame(flag, Bytes::new()).ok();
        self.dropped_tx.send(self.id).ok();
        Ok(())
    }

    fn send_frame(&self, flag: Flag, payload: Bytes) -> Result<()> {
        self.outbound
            .send((self.id, OutboundCommand::Frame(flag, payload)))
            .map_err(|_| Error::MultiplexerUnavailable)
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        let state = *self.close_state.lock();
        if !(state.local_closed && state.remote_closed) {
            trace!(id = %self.id, "MuxStream dropped without close()/reset(), notifying multiplexor");
            self.dropped_tx.send(self.id).ok();
        }
    }
}

/// Multiplexor-side view into a stream's close/reset state and inbox,
/// used by the read loop to apply inbound frames without routing through
/// the stream's own (unavailable, since the stream is owned by the user)
/// public API.
pub(crate) struct RemoteHandle {
    close_state: Arc<Mutex<CloseState>>,
    inbox_tx: Mutex<Option<InboxTx>>,
}

impl RemoteHandle {
    pub(crate) fn new(close_state: Arc<Mutex<CloseState>>, inbox_tx: InboxTx) -> Self {
        Self {
            close_state,
            inbox_tx: Mutex::new(Some(inbox_tx)),
        }
    }

    /// Push a Message frame's payload onto the stream's inbox. Returns
    /// `true` if the bounded inbox was full, meaning the caller must reset
    /// this stream (spec §5's bounded alternative); a no-op (including a
    /// closed inbox, since the user dropped their `MuxStream`) is `false`.
    pub(crate) fn push(&self, payload: Bytes) -> bool {
        self.inbox_tx
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.push(payload))
    }

    /// Close the inbox sender so the next (or a pending) `read()` observes
    /// end-of-stream once already-buffered messages are drained.
    fn close_inbox(&self) {
        self.inbox_tx.lock().take();
    }

    /// Apply an inbound Close frame (spec §4.4). Returns `true` if the
    /// stream is now fully closed and should be removed from the tables.
    pub(crate) fn apply_close(&self) -> bool {
        self.close_inbox();
        let mut state = self.close_state.lock();
        if state.remote_closed {
            // Buggy peer: tolerate, matching the reference.
            return false;
        }
        state.remote_closed = true;
        state.local_closed
    }

    /// Apply an inbound Reset frame (spec §4.4). Always removes the stream.
    pub(crate) fn apply_reset(&self) {
        self.close_inbox();
        let mut state = self.close_state.lock();
        if !state.remote_closed {
            state.reset = true;
            state.remote_closed = true;
        }
        state.local_closed = true;
    }

    /// Force this stream into the reset state without sending a frame,
    /// e.g. because the connection itself is tearing down (spec §4.5) or
    /// an unknown flag targeted it after the frame-level reset already ran.
    pub(crate) fn force_reset(&self) {
        self.close_inbox();
        let mut state = self.close_state.lock();
        state.remote_closed = true;
        state.reset = true;
        state.local_closed = true;
    }

    /// Whether the remote has already half-closed (used to decide whether
    /// an inbound data frame should be dropped, spec §4.4).
    pub(crate) fn is_remote_closed(&self) -> bool {
        self.close_state.lock().remote_closed
    }

    /// Whether this stream has already reached a terminal state (fully
    /// closed or reset) from the multiplexor's point of view.
    pub(crate) fn is_terminal(&self) -> bool {
        let state = self.close_state.lock();
        state.reset || (state.local_closed && state.remote_closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_stream() -> (
        MuxStream,
        mpsc::UnboundedReceiver<(StreamId, OutboundCommand)>,
        mpsc::UnboundedSender<Bytes>,
        mpsc::UnboundedReceiver<StreamId>,
    ) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (dropped_tx, dropped_rx) = mpsc::unbounded_channel();
        let stream = MuxStream::new(
            StreamId::new(0, true),
            "0".to_string(),
            InboxRx::Unbounded(inbox_rx),
            outbound_tx,
            dropped_tx,
            None,
        );
        (stream, outbound_rx, inbox_tx, dropped_rx)
    }

    #[tokio::test]
    async fn write_emits_message_frame_for_initiator() {
        let (stream, mut outbound_rx, _inbox_tx, _dropped_rx) = make_stream();
        stream.write(Bytes::from_static(b"hello")).unwrap();
        let (id, OutboundCommand::Frame(flag, payload)) = outbound_rx.recv().await.unwrap();
        assert_eq!(id, StreamId::new(0, true));
        assert!(matches!(flag, Flag::MessageInitiator));
        assert_eq!(&payload[..], b"hello");
    }

    #[tokio::test]
    async fn read_honors_message_boundaries() {
        // S3: two writes "ab", "cd"; read(3) twice returns them separately.
        let (stream, _outbound_rx, inbox_tx, _dropped_rx) = make_stream();
        inbox_tx.send(Bytes::from_static(b"ab")).unwrap();
        inbox_tx.send(Bytes::from_static(b"cd")).unwrap();
        assert_eq!(&stream.read(Some(3)).await.unwrap()[..], b"ab");
        assert_eq!(&stream.read(Some(3)).await.unwrap()[..], b"cd");
    }

    #[tokio::test]
    async fn read_leaves_partial_message_as_leftover() {
        let (stream, _outbound_rx, inbox_tx, _dropped_rx) = make_stream();
        inbox_tx.send(Bytes::from_static(b"hello")).unwrap();
        assert_eq!(&stream.read(Some(2)).await.unwrap()[..], b"he");
        assert_eq!(&stream.read(Some(10)).await.unwrap()[..], b"llo");
    }

    #[tokio::test]
    async fn read_after_inbox_closed_is_eof_unless_reset() {
        let (stream, _outbound_rx, inbox_tx, _dropped_rx) = make_stream();
        drop(inbox_tx);
        let got = stream.read(None).await.unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn read_after_reset_reports_reset() {
        let (stream, _outbound_rx, inbox_tx, _dropped_rx) = make_stream();
        stream.reset().unwrap();
        drop(inbox_tx);
        let err = stream.read(None).await.unwrap_err();
        assert!(matches!(err, Error::StreamReset));
    }

    #[tokio::test]
    async fn write_after_close_fails() {
        let (stream, mut outbound_rx, _inbox_tx, _dropped_rx) = make_stream();
        stream.close().unwrap();
        outbound_rx.recv().await.unwrap(); // drain the Close frame
        let err = stream.write(Bytes::from_static(b"x")).unwrap_err();
        assert!(matches!(err, Error::StreamClosed));
    }

    #[tokio::test]
    async fn close_and_reset_are_idempotent() {
        let (stream, mut outbound_rx, _inbox_tx, _dropped_rx) = make_stream();
        stream.close().unwrap();
        stream.close().unwrap();
        // Only one Close frame should have been emitted.
        outbound_rx.recv().await.unwrap();
        assert!(outbound_rx.try_recv().is_err());

        stream.reset().unwrap();
        stream.reset().unwrap();
    }

    #[test]
    fn bounded_inbox_reports_overflow_on_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let inbox_tx = InboxTx::Bounded(tx);
        assert!(!inbox_tx.push(Bytes::from_static(b"a")));
        assert!(inbox_tx.push(Bytes::from_static(b"b")));
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"a"));
    }

    #[test]
    fn bounded_inbox_overflow_is_not_reported_once_receiver_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let inbox_tx = InboxTx::Bounded(tx);
        assert!(!inbox_tx.push(Bytes::from_static(b"a")));
    }

    #[tokio::test]
    async fn drop_without_close_notifies_multiplexor() {
        let (stream, _outbound_rx, _inbox_tx, mut dropped_rx) = make_stream();
        let id = stream.id();
        drop(stream);
        assert_eq!(dropped_rx.recv().await, Some(id));
    }
}
