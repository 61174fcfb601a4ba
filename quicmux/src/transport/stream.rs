//! Bidirectional streams multiplexed over a [`Transport`](super::Transport).
//!
//! A [`StreamHandle`] refers to its transport weakly and locates its QUIC
//! stream halves through the transport's stream arena by key. Dropping the
//! last clone of a handle releases the stream like [`StreamHandle::close`]
//! without waiting, and a handle outliving its transport reports
//! [`ReadOutcome::TransportStopped`] instead of keeping the connection alive.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use quinn::VarInt;
use tokio::sync::watch;

use super::{Closure, Shared, TransportError, TransportId, signalled};

/// First byte a locally opened stream carries, so the peer observes the
/// stream before any payload is written.
pub(crate) const STREAM_OPEN_MARKER: u8 = 0x01;

/// Chunk size used by [`StreamHandle::read_to_end`].
const READ_CHUNK: usize = 4096;

/// Reset code for a send direction whose last write was cut short.
pub(crate) const ABORTED_WRITE_CODE: u32 = 1;

/// Data for a single [`StreamHandle::write`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamWriteParameters {
    /// Bytes to send.
    pub data: Vec<u8>,
    /// Close the local send direction after `data`.
    pub fin: bool,
}

impl StreamWriteParameters {
    /// Write `data` and keep the send direction open.
    #[must_use]
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            fin: false,
        }
    }

    /// Also close the send direction after the data.
    #[must_use]
    pub const fn finish(mut self) -> Self {
        self.fin = true;
        self
    }
}

/// Result of a successful [`StreamHandle::read_into`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were written to the front of the buffer.
    Data(usize),
    /// The peer closed its send direction; no more data will arrive.
    EndOfStream,
    /// The peer reset its send direction with the given code.
    Reset(u64),
    /// The owning transport was stopped locally.
    TransportStopped,
}

/// Key of a stream within its transport: the raw QUIC stream id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey(u64);

impl From<quinn::StreamId> for StreamKey {
    fn from(id: quinn::StreamId) -> Self {
        Self(VarInt::from(id).into_inner())
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

struct RecvHalf {
    stream: quinn::RecvStream,
    /// Inbound streams still carry the open marker.
    marker_pending: bool,
}

#[derive(Clone, Copy)]
enum Direction {
    Send,
    Recv,
    Both,
}

/// Both halves of one QUIC stream plus their close bookkeeping.
pub(crate) struct StreamSlot {
    send: tokio::sync::Mutex<quinn::SendStream>,
    recv: tokio::sync::Mutex<RecvHalf>,
    send_closed: AtomicBool,
    recv_closed: AtomicBool,
    /// A write was interrupted after it may have sent part of its data.
    /// Such a send direction is reset, never finished.
    torn: AtomicBool,
    /// Set by a local `close`/`reset` to interrupt pending operations.
    closing: watch::Sender<bool>,
}

impl StreamSlot {
    pub(crate) fn new(send: quinn::SendStream, recv: quinn::RecvStream, marker_pending: bool) -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            send: tokio::sync::Mutex::new(send),
            recv: tokio::sync::Mutex::new(RecvHalf {
                stream: recv,
                marker_pending,
            }),
            send_closed: AtomicBool::new(false),
            recv_closed: AtomicBool::new(false),
            torn: AtomicBool::new(false),
            closing,
        }
    }

    /// Whether a write on this stream was cut short.
    pub(crate) fn is_torn(&self) -> bool {
        self.torn.load(Ordering::SeqCst)
    }

    /// Finish the send direction and wait until the peer has acknowledged
    /// all of it, or the stream or connection is gone. A torn send
    /// direction is reset instead.
    pub(crate) async fn flush(&self) {
        let mut send = self.send.lock().await;
        if !self.send_closed.swap(true, Ordering::SeqCst) {
            if self.is_torn() {
                let _ = send.reset(VarInt::from_u32(ABORTED_WRITE_CODE));
                return;
            }
            let _ = send.finish();
        }
        let _ = send.stopped().await;
    }

    /// End the send direction for `close`: finish it, or reset it if torn.
    fn end_send(&self, send: &mut quinn::SendStream) {
        if self.send_closed.load(Ordering::SeqCst) {
            return;
        }
        if self.is_torn() {
            let _ = send.reset(VarInt::from_u32(ABORTED_WRITE_CODE));
        } else {
            let _ = send.finish();
        }
    }
}

impl Drop for StreamSlot {
    fn drop(&mut self) {
        // quinn finishes a dropped send stream, which must not happen to a
        // partially written payload.
        if *self.torn.get_mut() && !*self.send_closed.get_mut() {
            let _ = self.send.get_mut().reset(VarInt::from_u32(ABORTED_WRITE_CODE));
        }
    }
}

/// Streams of one transport with at least one direction still open.
#[derive(Default)]
pub(crate) struct StreamArena {
    slots: Mutex<HashMap<StreamKey, Arc<StreamSlot>>>,
}

impl StreamArena {
    pub(crate) fn insert(&self, key: StreamKey, slot: Arc<StreamSlot>) {
        self.slots.lock().insert(key, slot);
    }

    fn get(&self, key: StreamKey) -> Option<Arc<StreamSlot>> {
        self.slots.lock().get(&key).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Remove every slot, for shutdown.
    pub(crate) fn drain(&self) -> Vec<Arc<StreamSlot>> {
        self.slots.lock().drain().map(|(_, slot)| slot).collect()
    }

    fn remove(&self, key: StreamKey) -> Option<Arc<StreamSlot>> {
        self.slots.lock().remove(&key)
    }

    /// Mark `direction` closed and drop the slot once both directions are.
    fn release(&self, key: StreamKey, slot: &StreamSlot, direction: Direction) {
        if matches!(direction, Direction::Send | Direction::Both) {
            slot.send_closed.store(true, Ordering::SeqCst);
        }
        if matches!(direction, Direction::Recv | Direction::Both) {
            slot.recv_closed.store(true, Ordering::SeqCst);
        }
        if slot.send_closed.load(Ordering::SeqCst)
            && slot.recv_closed.load(Ordering::SeqCst)
            && self.slots.lock().remove(&key).is_some()
        {
            tracing::trace!(stream = %key, "stream released");
        }
    }
}

// ---------------------------------------------------------------------------
// Interrupts
// ---------------------------------------------------------------------------

enum Interrupt {
    TransportStopped,
    StreamClosed,
}

impl Interrupt {
    fn into_read(self) -> Result<ReadOutcome, TransportError> {
        match self {
            Self::TransportStopped => Ok(ReadOutcome::TransportStopped),
            Self::StreamClosed => Err(TransportError::StreamClosed),
        }
    }

    const fn into_error(self) -> TransportError {
        match self {
            Self::TransportStopped => TransportError::TransportStopped,
            Self::StreamClosed => TransportError::StreamClosed,
        }
    }
}

struct Signals {
    stop: watch::Receiver<bool>,
    closing: watch::Receiver<bool>,
}

impl Signals {
    fn new(shared: &Shared, slot: &StreamSlot) -> Self {
        Self {
            stop: shared.stop_signal(),
            closing: slot.closing.subscribe(),
        }
    }

    async fn interrupted(&mut self) -> Interrupt {
        tokio::select! {
            () = signalled(&mut self.stop) => Interrupt::TransportStopped,
            () = signalled(&mut self.closing) => Interrupt::StreamClosed,
        }
    }
}

// ---------------------------------------------------------------------------
// StreamHandle
// ---------------------------------------------------------------------------

/// Release the send direction of stream `key` once the peer stops reading
/// it, so a stream that is never written again can still leave the arena.
pub(crate) async fn release_on_peer_stop<F>(stopped: F, key: StreamKey, shared: Weak<Shared>)
where
    F: Future<Output = Result<Option<VarInt>, quinn::StoppedError>>,
{
    let Ok(Some(code)) = stopped.await else {
        return;
    };
    let Some(shared) = shared.upgrade() else {
        return;
    };
    if let Some(slot) = shared.streams.get(key) {
        tracing::debug!(transport = %shared.id, stream = %key, code = %code, "peer stopped reading");
        shared.streams.release(key, &slot, Direction::Send);
    }
}

/// Handle to one bidirectional stream.
///
/// Cheap to clone; all clones refer to the same stream. Reads and writes
/// take `&self` and may run concurrently on different clones, but
/// concurrent reads (or concurrent writes) are serialized. Dropping the
/// last clone releases the stream: data already written is still
/// delivered and unread inbound data is discarded.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    inner: Arc<HandleInner>,
}

#[derive(Debug)]
struct HandleInner {
    key: StreamKey,
    transport: TransportId,
    locally_opened: bool,
    shared: Weak<Shared>,
    /// How the receive direction ended, replayed on later reads even after
    /// the stream has left the arena.
    recv_end: Mutex<Option<ReadOutcome>>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if shared.is_stopping() {
            return;
        }
        // Dropping the quinn halves finishes the send direction and stops
        // the receive direction.
        if shared.streams.remove(self.key).is_some() {
            tracing::trace!(transport = %self.transport, stream = %self.key, "stream handle dropped");
        }
    }
}

impl StreamHandle {
    pub(crate) fn new(
        key: StreamKey,
        transport: TransportId,
        locally_opened: bool,
        shared: Weak<Shared>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                key,
                transport,
                locally_opened,
                shared,
                recv_end: Mutex::new(None),
            }),
        }
    }

    /// Key of this stream within its transport.
    #[must_use]
    pub fn id(&self) -> StreamKey {
        self.inner.key
    }

    /// Transport the stream belongs to.
    #[must_use]
    pub fn transport_id(&self) -> TransportId {
        self.inner.transport
    }

    /// Whether this side opened the stream.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.inner.locally_opened
    }

    /// The owning transport, unless it is gone or stopping.
    fn live_shared(&self) -> Option<Arc<Shared>> {
        self.inner.shared.upgrade().filter(|shared| !shared.is_stopping())
    }

    /// Returns `Ok(None)` when the transport is gone or stopping.
    fn resolve(&self) -> Result<Option<(Arc<Shared>, Arc<StreamSlot>)>, TransportError> {
        let Some(shared) = self.live_shared() else {
            return Ok(None);
        };
        let slot = shared
            .streams
            .get(self.inner.key)
            .ok_or(TransportError::StreamClosed)?;
        Ok(Some((shared, slot)))
    }

    fn recv_end(&self) -> Option<ReadOutcome> {
        *self.inner.recv_end.lock()
    }

    /// Read available bytes into `buf`.
    ///
    /// Waits until at least one byte is available, the peer ends or resets
    /// its send direction, or the transport stops. Never returns more than
    /// `buf.len()` bytes; the remainder stays queued for the next read. An
    /// empty `buf` returns `Data(0)` immediately. Once the receive direction
    /// has ended, every later read repeats how it ended.
    ///
    /// # Errors
    ///
    /// - [`TransportError::StreamClosed`] if the stream was closed locally.
    /// - [`TransportError::ConnectionLost`] if the connection failed.
    /// - [`TransportError::Protocol`] if the peer sent a malformed stream.
    pub async fn read_into(&self, buf: &mut [u8]) -> Result<ReadOutcome, TransportError> {
        let Some(shared) = self.live_shared() else {
            return Ok(ReadOutcome::TransportStopped);
        };
        if let Some(end) = self.recv_end() {
            return Ok(end);
        }
        let slot = shared
            .streams
            .get(self.inner.key)
            .ok_or(TransportError::StreamClosed)?;
        if buf.is_empty() {
            return Ok(ReadOutcome::Data(0));
        }

        let mut signals = Signals::new(&shared, &slot);
        let mut recv = tokio::select! {
            guard = slot.recv.lock() => guard,
            interrupt = signals.interrupted() => return interrupt.into_read(),
        };
        if let Some(end) = self.recv_end() {
            return Ok(end);
        }
        if slot.recv_closed.load(Ordering::SeqCst) {
            return Err(TransportError::StreamClosed);
        }

        if recv.marker_pending {
            let mut marker = [0u8; 1];
            let result = tokio::select! {
                result = recv.stream.read_exact(&mut marker) => result,
                interrupt = signals.interrupted() => return interrupt.into_read(),
            };
            match result {
                Ok(()) if marker[0] == STREAM_OPEN_MARKER => recv.marker_pending = false,
                Ok(()) => {
                    return Err(TransportError::Protocol(format!(
                        "unexpected stream open marker {:#04x}",
                        marker[0]
                    )));
                }
                Err(quinn::ReadExactError::FinishedEarly(_)) => {
                    return Ok(self.end_recv(&shared, &slot, ReadOutcome::EndOfStream));
                }
                Err(quinn::ReadExactError::ReadError(e)) => {
                    return self.read_failed(&shared, &slot, e);
                }
            }
        }

        let result = tokio::select! {
            result = recv.stream.read(buf) => result,
            interrupt = signals.interrupted() => return interrupt.into_read(),
        };
        match result {
            Ok(Some(n)) => Ok(ReadOutcome::Data(n)),
            Ok(None) => Ok(self.end_recv(&shared, &slot, ReadOutcome::EndOfStream)),
            Err(e) => self.read_failed(&shared, &slot, e),
        }
    }

    /// Read until the peer ends the stream, accepting at most `limit` bytes.
    ///
    /// # Errors
    ///
    /// - [`TransportError::StreamReset`] if the peer reset the stream.
    /// - [`TransportError::TransportStopped`] if the transport stopped.
    /// - [`TransportError::PayloadTooLarge`] if more than `limit` bytes arrive.
    /// - Any error from [`read_into`](Self::read_into).
    pub async fn read_to_end(&self, limit: usize) -> Result<Vec<u8>, TransportError> {
        let mut data = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match self.read_into(&mut chunk).await? {
                ReadOutcome::Data(n) => {
                    if data.len() + n > limit {
                        return Err(TransportError::PayloadTooLarge { limit });
                    }
                    data.extend_from_slice(&chunk[..n]);
                }
                ReadOutcome::EndOfStream => return Ok(data),
                ReadOutcome::Reset(code) => return Err(TransportError::StreamReset(code)),
                ReadOutcome::TransportStopped => return Err(TransportError::TransportStopped),
            }
        }
    }

    /// Write `params.data`, then close the send direction if `params.fin`.
    ///
    /// Returns once the data is queued for transmission; delivery is
    /// reliable and in order. Waits while the peer's flow-control window is
    /// exhausted. A write interrupted by [`close`](Self::close) or a
    /// transport stop may have sent part of its data; the send direction is
    /// then reset, so the peer reads [`ReadOutcome::Reset`] instead of a
    /// truncated payload.
    ///
    /// # Errors
    ///
    /// - [`TransportError::StreamClosed`] if the send direction was closed
    ///   locally or the peer stopped reading.
    /// - [`TransportError::TransportStopped`] if the transport stopped.
    /// - [`TransportError::ConnectionLost`] if the connection failed.
    pub async fn write(&self, params: StreamWriteParameters) -> Result<(), TransportError> {
        let Some((shared, slot)) = self.resolve()? else {
            return Err(TransportError::TransportStopped);
        };
        if slot.send_closed.load(Ordering::SeqCst) {
            return Err(TransportError::StreamClosed);
        }

        let mut signals = Signals::new(&shared, &slot);
        let mut send = tokio::select! {
            guard = slot.send.lock() => guard,
            interrupt = signals.interrupted() => return Err(interrupt.into_error()),
        };
        if slot.send_closed.load(Ordering::SeqCst) {
            return Err(TransportError::StreamClosed);
        }

        let result = tokio::select! {
            result = send.write_all(&params.data) => result,
            interrupt = signals.interrupted() => {
                // Marked while the send lock is still held, so `flush` and
                // `close` see it before touching the send direction.
                if !params.data.is_empty() {
                    slot.torn.store(true, Ordering::SeqCst);
                }
                return Err(interrupt.into_error());
            }
        };
        if let Err(e) = result {
            return Err(self.write_failed(&shared, &slot, e));
        }

        if params.fin {
            let _ = send.finish();
            shared.streams.release(self.inner.key, &slot, Direction::Send);
        }
        Ok(())
    }

    /// Close the local send direction. The peer reads
    /// [`ReadOutcome::EndOfStream`] after the data already written.
    ///
    /// # Errors
    ///
    /// - [`TransportError::TransportStopped`] if the transport stopped.
    /// - [`TransportError::StreamClosed`] if the stream was already released.
    pub async fn close_write(&self) -> Result<(), TransportError> {
        let Some((shared, slot)) = self.resolve()? else {
            return Err(TransportError::TransportStopped);
        };
        let mut send = slot.send.lock().await;
        if !slot.send_closed.load(Ordering::SeqCst) {
            slot.end_send(&mut send);
            shared.streams.release(self.inner.key, &slot, Direction::Send);
        }
        Ok(())
    }

    /// Close both directions of the stream.
    ///
    /// Data already written is still delivered; unread inbound data is
    /// discarded and the peer is asked to stop sending. Pending operations
    /// on other clones of this handle fail with
    /// [`TransportError::StreamClosed`]. Closing an already closed stream
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::TransportStopped`] if the transport stopped.
    pub async fn close(&self) -> Result<(), TransportError> {
        let (shared, slot) = match self.resolve() {
            Ok(Some(resolved)) => resolved,
            Ok(None) => return Err(TransportError::TransportStopped),
            Err(_) => return Ok(()),
        };
        slot.closing.send_replace(true);
        {
            let mut send = slot.send.lock().await;
            slot.end_send(&mut send);
        }
        {
            let mut recv = slot.recv.lock().await;
            if !slot.recv_closed.load(Ordering::SeqCst) {
                let _ = recv.stream.stop(VarInt::from_u32(0));
            }
        }
        shared.streams.release(self.inner.key, &slot, Direction::Both);
        tracing::debug!(transport = %self.inner.transport, stream = %self.inner.key, "stream closed");
        Ok(())
    }

    /// Abort both directions with an application error `code`.
    ///
    /// Unlike [`close`](Self::close), unacknowledged data is discarded; the
    /// peer reads [`ReadOutcome::Reset`] with `code`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::TransportStopped`] if the transport stopped,
    /// or [`TransportError::StreamClosed`] if the stream was already released.
    pub async fn reset(&self, code: u32) -> Result<(), TransportError> {
        let Some((shared, slot)) = self.resolve()? else {
            return Err(TransportError::TransportStopped);
        };
        let code = VarInt::from_u32(code);
        slot.closing.send_replace(true);
        {
            let mut send = slot.send.lock().await;
            if !slot.send_closed.load(Ordering::SeqCst) {
                let _ = send.reset(code);
            }
        }
        {
            let mut recv = slot.recv.lock().await;
            if !slot.recv_closed.load(Ordering::SeqCst) {
                let _ = recv.stream.stop(code);
            }
        }
        shared.streams.release(self.inner.key, &slot, Direction::Both);
        tracing::debug!(transport = %self.inner.transport, stream = %self.inner.key, code = %code, "stream reset");
        Ok(())
    }

    fn end_recv(&self, shared: &Shared, slot: &StreamSlot, outcome: ReadOutcome) -> ReadOutcome {
        *self.inner.recv_end.lock() = Some(outcome);
        shared.streams.release(self.inner.key, slot, Direction::Recv);
        outcome
    }

    fn read_failed(
        &self,
        shared: &Shared,
        slot: &StreamSlot,
        err: quinn::ReadError,
    ) -> Result<ReadOutcome, TransportError> {
        match err {
            quinn::ReadError::Reset(code) => {
                tracing::debug!(transport = %self.inner.transport, stream = %self.inner.key, code = %code, "peer reset stream");
                Ok(self.end_recv(shared, slot, ReadOutcome::Reset(code.into_inner())))
            }
            quinn::ReadError::ConnectionLost(e) => match shared.connection_closed(&e) {
                Closure::Local => Ok(ReadOutcome::TransportStopped),
                Closure::PeerStopped => Ok(self.end_recv(shared, slot, ReadOutcome::EndOfStream)),
                Closure::Lost(reason) => Err(TransportError::ConnectionLost(reason)),
            },
            quinn::ReadError::ClosedStream => Err(TransportError::StreamClosed),
            other => Err(TransportError::Protocol(other.to_string())),
        }
    }

    fn write_failed(&self, shared: &Shared, slot: &StreamSlot, err: quinn::WriteError) -> TransportError {
        match err {
            quinn::WriteError::Stopped(code) => {
                tracing::debug!(transport = %self.inner.transport, stream = %self.inner.key, code = %code, "peer stopped reading");
                shared.streams.release(self.inner.key, slot, Direction::Send);
                TransportError::StreamClosed
            }
            quinn::WriteError::ClosedStream => {
                shared.streams.release(self.inner.key, slot, Direction::Send);
                TransportError::StreamClosed
            }
            quinn::WriteError::ConnectionLost(e) => match shared.connection_closed(&e) {
                Closure::Local => TransportError::TransportStopped,
                Closure::PeerStopped => {
                    TransportError::ConnectionLost("peer stopped the transport".into())
                }
                Closure::Lost(reason) => TransportError::ConnectionLost(reason),
            },
            other => TransportError::Protocol(other.to_string()),
        }
    }
}
