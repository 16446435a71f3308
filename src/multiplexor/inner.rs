//! Connection-level state: stream table, writer path, read loop, shutdown.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::conn::SecuredConnection;
use crate::dupe::Dupe;
use crate::error::{Error, Result};
use crate::frame::{Flag, Frame};
use crate::stream::{InboxRx, InboxTx, MuxStream, OutboundCommand, RemoteHandle};
use crate::stream_id::StreamId;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace, warn};

use super::Config;

/// Connection-level multiplexor state, shared between the read loop, the
/// writer task, and every handle returned to the user.
pub(crate) struct MultiplexorInner {
    pub(crate) conn: Arc<dyn SecuredConnection>,
    pub(crate) config: Config,
    /// `channel_id` -> table entry. Invariant 5 (spec §3) is trivially
    /// upheld here because the inbox sender lives inside `RemoteHandle`
    /// rather than in a parallel map.
    pub(crate) streams: RwLock<HashMap<StreamId, Arc<RemoteHandle>>>,
    pub(crate) next_channel_id: AtomicU64,
    pub(crate) outbound_tx: mpsc::UnboundedSender<(StreamId, OutboundCommand)>,
    outbound_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<(StreamId, OutboundCommand)>>>,
    pub(crate) dropped_tx: mpsc::UnboundedSender<StreamId>,
    dropped_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<StreamId>>>,
    /// `None` once `cleanup` has run, which closes the accept queue for
    /// any blocked or future `accept_stream` callers (spec §4.5 step 3).
    accept_tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<MuxStream>>>,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MuxStream>>,
    shutting_down_flag: std::sync::atomic::AtomicBool,
    closed: Notify,
    closed_flag: std::sync::atomic::AtomicBool,
}

impl std::fmt::Debug for MultiplexorInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexorInner")
            .field("is_initiator", &self.is_initiator())
            .field("is_closed", &self.is_closed())
            .field("open_streams", &self.streams.read().len())
            .finish_non_exhaustive()
    }
}

impl MultiplexorInner {
    pub(crate) fn new(conn: Arc<dyn SecuredConnection>, config: Config) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (dropped_tx, dropped_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            conn,
            config,
            streams: RwLock::new(HashMap::new()),
            next_channel_id: AtomicU64::new(0),
            outbound_tx,
            outbound_rx: tokio::sync::Mutex::new(Some(outbound_rx)),
            dropped_tx,
            dropped_rx: tokio::sync::Mutex::new(Some(dropped_rx)),
            accept_tx: parking_lot::Mutex::new(Some(accept_tx)),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            shutting_down_flag: std::sync::atomic::AtomicBool::new(false),
            closed: Notify::new(),
            closed_flag: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub(crate) fn is_initiator(&self) -> bool {
        self.conn.is_initiator()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed_flag.load(Ordering::Acquire)
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down_flag.load(Ordering::Acquire)
    }

    /// Spawn the read loop and writer task. Consumes the outbound/dropped
    /// receiver halves, so this may only be called once per multiplexor.
    pub(crate) fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let inner = self.dupe();
        tokio::spawn(async move { inner.run().await })
    }

    #[tracing::instrument(skip_all, level = "trace")]
    async fn run(self: Arc<Self>) {
        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .await
            .take()
            .expect("Multiplexor started twice (this is a bug)");
        let mut dropped_rx = self
            .dropped_rx
            .lock()
            .await
            .take()
            .expect("Multiplexor started twice (this is a bug)");

        let writer = {
            let inner = self.dupe();
            tokio::spawn(async move { inner.writer_task(&mut outbound_rx).await })
        };
        let dropped = {
            let inner = self.dupe();
            tokio::spawn(async move { inner.dropped_streams_task(&mut dropped_rx).await })
        };

        // The read loop is the third and primary subtask; when it ends
        // (transport EOF/error, duplicate NewStream, or shutdown), we tear
        // everything down regardless of how the other two are doing.
        self.read_loop().await;

        writer.abort();
        dropped.abort();
        self.cleanup().await;
    }

    /// Single writer path: all local operations reach the transport only
    /// through this task, preserving frame atomicity (spec §4.3, P8).
    #[tracing::instrument(skip_all, level = "trace")]
    async fn writer_task(
        self: Arc<Self>,
        outbound_rx: &mut mpsc::UnboundedReceiver<(StreamId, OutboundCommand)>,
    ) {
        while let Some((id, command)) = outbound_rx.recv().await {
            let OutboundCommand::Frame(flag, payload) = command;
            if let Err(e) = self.write_frame(id.channel_id, flag, payload).await {
                debug!("writer task: failed to write frame for {id}: {e}");
                break;
            }
        }
    }

    async fn write_frame(&self, channel_id: u64, flag: Flag, payload: Bytes) -> Result<()> {
        let frame = Frame::new(channel_id, flag, payload);
        let encoded = frame.encode();
        self.conn.write(&encoded).await
    }

    /// Processes notifications that a local `MuxStream` handle reached a
    /// terminal state (explicit `close()`/`reset()`, or was simply dropped).
    /// Mirrors the teacher's `process_dropped_ports_task`.
    #[tracing::instrument(skip_all, level = "trace")]
    async fn dropped_streams_task(self: Arc<Self>, dropped_rx: &mut mpsc::UnboundedReceiver<StreamId>) {
        while let Some(id) = dropped_rx.recv().await {
            let handle = self.streams.read().get(&id).map(Dupe::dupe);
            let Some(handle) = handle else {
                continue;
            };
            if !handle.is_terminal() {
                // The user dropped the `MuxStream` without closing it: we
                // must tell the peer, or the stream leaks on both ends.
                trace!("stream {id} dropped without close()/reset(), resetting");
                handle.force_reset();
                self.write_frame(id.channel_id, Flag::reset_for(id.initiator), Bytes::new())
                    .await
                    .ok();
            }
            self.streams.write().remove(&id);
        }
    }

    pub(crate) fn open_stream(self: &Arc<Self>) -> Result<MuxStream> {
        if self.is_shutting_down() || self.is_closed() {
            return Err(Error::MultiplexerUnavailable);
        }
        let channel_id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);
        let id = StreamId::new(channel_id, true);
        let name = channel_id.to_string();
        let (stream, handle) = self.create_stream_pair(id, name.clone());
        {
            let mut streams = self.streams.write();
            // Re-check under the same lock `cleanup` drains the table
            // under: the check above is only a fast path and isn't
            // ordered against `cleanup` in any way, so without this
            // re-check a `cleanup` that runs entirely between the two
            // could finish draining an empty table before this insert
            // lands, leaking an entry `cleanup` never sees again (spec
            // invariant 7, P7). Serializing the check with the insert on
            // `streams`'s own lock closes the gap: whichever of this
            // insert or `cleanup`'s drain takes the lock first is the one
            // that's authoritative, and the loser either bails here or
            // picks up this entry in its drain.
            if self.is_shutting_down() || self.is_closed() {
                return Err(Error::MultiplexerUnavailable);
            }
            streams.insert(id, Arc::new(handle));
        }
        self.outbound_tx
            .send((id, OutboundCommand::Frame(Flag::NewStream, Bytes::from(name.into_bytes()))))
            .map_err(|_| Error::MultiplexerUnavailable)?;
        Ok(stream)
    }

    fn create_stream_pair(&self, id: StreamId, name: String) -> (MuxStream, RemoteHandle) {
        let (inbox_tx, inbox_rx) = match self.config.inbox_capacity {
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity);
                (InboxTx::Bounded(tx), InboxRx::Bounded(rx))
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (InboxTx::Unbounded(tx), InboxRx::Unbounded(rx))
            }
        };
        let stream = MuxStream::new(
            id,
            name,
            inbox_rx,
            self.outbound_tx.dupe(),
            self.dropped_tx.dupe(),
            self.conn.remote_address(),
        );
        let handle = RemoteHandle::new(stream.close_state_handle(), inbox_tx);
        (stream, handle)
    }

    pub(crate) async fn accept_stream(&self) -> Result<MuxStream> {
        self.accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::MultiplexerUnavailable)
    }

    #[tracing::instrument(skip_all, level = "debug")]
    pub(crate) async fn close(self: &Arc<Self>) {
        if !self.shutting_down_flag.swap(true, Ordering::AcqRel) {
            // First caller: actually close the transport. Its next read
            // fails, driving the read loop into `cleanup`.
            self.conn.close().await.ok();
        }
        self.await_closed().await;
    }

    /// Wait for `cleanup` to run, without missing the notification if it
    /// already ran (or runs concurrently) before we start waiting.
    async fn await_closed(&self) {
        if self.closed_flag.load(Ordering::Acquire) {
            return;
        }
        let notified = self.closed.notified();
        if self.closed_flag.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }

    /// Read one frame at a time off the transport and dispatch it; exits
    /// on transport error/EOF, a fatal protocol violation, or shutdown.
    #[tracing::instrument(skip_all, level = "trace")]
    async fn read_loop(self: &Arc<Self>) {
        loop {
            let frame = Frame::read_from(&*self.conn).await;
            match frame {
                Ok(frame) => {
                    if let Err(e) = self.dispatch_frame(frame).await {
                        debug!("read loop: fatal error, tearing down connection: {e}");
                        break;
                    }
                }
                Err(e) => {
                    debug!("read loop: transport error/EOF, tearing down connection: {e}");
                    break;
                }
            }
        }
    }

    #[tracing::instrument(skip_all, fields(channel_id = frame.channel_id), level = "debug")]
    async fn dispatch_frame(self: &Arc<Self>, frame: Frame) -> Result<()> {
        let sid = frame.local_stream_id();
        match frame.flag {
            Flag::NewStream => self.handle_new_stream(sid, frame.payload).await,
            Flag::MessageInitiator | Flag::MessageReceiver => {
                self.handle_message(sid, frame.payload).await;
                Ok(())
            }
            Flag::CloseInitiator | Flag::CloseReceiver => {
                self.handle_close(sid).await;
                Ok(())
            }
            Flag::ResetInitiator | Flag::ResetReceiver => {
                self.handle_reset(sid).await;
                Ok(())
            }
            Flag::Unknown(v) => {
                self.handle_unknown(sid, v).await;
                Ok(())
            }
        }
    }

    async fn handle_new_stream(self: &Arc<Self>, sid: StreamId, payload: Bytes) -> Result<()> {
        if self.streams.read().contains_key(&sid) {
            // Fatal: kills the connection (spec §4.4, S7).
            return Err(Error::MultiplexerUnavailable);
        }
        let name = String::from_utf8_lossy(&payload).into_owned();
        let (stream, handle) = self.create_stream_pair(sid, name);
        self.streams.write().insert(sid, Arc::new(handle));
        let sent = self
            .accept_tx
            .lock()
            .as_ref()
            .map(|tx| tx.send(stream).is_ok());
        if sent != Some(true) {
            return Err(Error::MultiplexerUnavailable);
        }
        Ok(())
    }

    async fn handle_message(&self, sid: StreamId, payload: Bytes) {
        let handle = self.streams.read().get(&sid).map(Dupe::dupe);
        let Some(handle) = handle else {
            trace!("message for unknown stream {sid}, dropping");
            return;
        };
        if handle.is_remote_closed() {
            warn!("message for remote-closed stream {sid}, dropping");
            return;
        }
        if handle.push(payload) {
            // Bounded inbox overflow (spec §5's bounded alternative): reset
            // just this stream, not the whole connection.
            warn!("inbox full for stream {sid}, resetting just that stream");
            self.streams.write().remove(&sid);
            handle.force_reset();
            self.write_frame(sid.channel_id, Flag::reset_for(sid.initiator), Bytes::new())
                .await
                .ok();
        }
    }

    async fn handle_close(&self, sid: StreamId) {
        let handle = self.streams.read().get(&sid).map(Dupe::dupe);
        let Some(handle) = handle else {
            trace!("close for unknown stream {sid}, ignoring");
            return;
        };
        if handle.apply_close() {
            self.streams.write().remove(&sid);
        }
    }

    async fn handle_reset(&self, sid: StreamId) {
        let handle = self.streams.write().remove(&sid);
        let Some(handle) = handle else {
            trace!("reset for unknown stream {sid}, ignoring");
            return;
        };
        handle.apply_reset();
    }

    async fn handle_unknown(&self, sid: StreamId, flag: u8) {
        let handle = self.streams.write().remove(&sid);
        let Some(handle) = handle else {
            trace!("unknown flag {flag} for unknown stream {sid}, ignoring");
            return;
        };
        warn!("unknown flag {flag} for stream {sid}, resetting just that stream");
        handle.force_reset();
        self.write_frame(sid.channel_id, Flag::reset_for(sid.initiator), Bytes::new())
            .await
            .ok();
    }

    /// Drives every remaining stream into the reset state, drains the
    /// accept queue, closes the transport, and marks the connection closed
    /// (spec §4.5, invariant 7). Runs whether the read loop exited via an
    /// explicit `close()` (which already closed the transport) or a fatal
    /// parse/protocol error (which didn't) — `conn.close()` is idempotent,
    /// so it's unconditional here rather than conditioned on which path led
    /// to teardown.
    #[tracing::instrument(skip_all, level = "debug")]
    async fn cleanup(&self) {
        self.shutting_down_flag.store(true, Ordering::Release);
        let remaining: Vec<_> = self.streams.write().drain().collect();
        for (id, handle) in remaining {
            trace!("cleanup: forcing stream {id} to reset");
            handle.force_reset();
        }
        self.conn.close().await.ok();
        // Dropping the sender closes the accept queue for any blocked or
        // future `accept_stream` callers.
        self.accept_tx.lock().take();
        self.closed_flag.store(true, Ordering::Release);
        self.closed.notify_waiters();
    }
}
