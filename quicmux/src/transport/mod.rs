//! Multiplexed QUIC transport.
//!
//! A [`Transport`] owns exactly one QUIC connection, either dialed with
//! [`Transport::connect`] or accepted through a [`listener::Listener`], and
//! multiplexes [`StreamHandle`]s over it. Both roles expose the same API.
//!
//! Inbound streams flow through a bounded queue: one task accepts streams
//! from the connection, another drains the queue and hands each stream to the
//! callback registered with [`Transport::on_bidirectional_stream`]. The
//! callback therefore runs once per stream, in the order the peer opened
//! them, and never concurrently with itself.

pub mod listener;
mod state;
pub mod stream;
pub mod tls;

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use std::{fmt, mem};

use futures_util::FutureExt;
use parking_lot::Mutex;
use quinn::VarInt;
use rustls::pki_types::CertificateDer;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::{Config, TransportTuning};
use crate::identity;

pub use state::ConnectionState;
pub use stream::{ReadOutcome, StreamHandle, StreamKey, StreamWriteParameters};

use state::StateCell;
use stream::{STREAM_OPEN_MARKER, StreamArena, StreamSlot, release_on_peer_stop};

/// Application close code sent by a clean [`Transport::stop`].
const CLEAN_CLOSE_CODE: u32 = 0;

/// Close code used instead of [`CLEAN_CLOSE_CODE`] when `stop` could not
/// deliver everything written, so the peer never mistakes the loss for a
/// clean end of stream.
const ABORTED_CLOSE_CODE: u32 = 1;

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Dialing failed: unreachable address, handshake failure or timeout.
    #[error("dial {address} failed: {reason}")]
    Dial {
        /// Address that was dialed.
        address: String,
        /// Human-readable cause.
        reason: String,
    },

    /// The address could not be parsed or resolved.
    #[error("invalid address {0}")]
    InvalidAddress(String),

    /// The certificate, key or tuning values were rejected.
    #[error("invalid transport configuration: {0}")]
    InvalidConfig(String),

    /// The listening socket could not be bound.
    #[error("listen on {address} failed: {reason}")]
    Listen {
        /// Address that was bound.
        address: String,
        /// Human-readable cause.
        reason: String,
    },

    /// The listener was closed.
    #[error("listener closed")]
    ListenerClosed,

    /// The handshake with an inbound peer failed.
    #[error("inbound handshake failed: {0}")]
    Handshake(String),

    /// The connection is not in the `Established` state.
    #[error("transport is not established")]
    NotEstablished,

    /// The peer's concurrent stream limit is exhausted.
    #[error("peer stream limit reached")]
    StreamLimit,

    /// The stream direction used was already closed, locally or by the peer.
    #[error("stream closed")]
    StreamClosed,

    /// The peer reset the stream.
    #[error("stream reset by peer (code {0})")]
    StreamReset(u64),

    /// The owning transport was stopped.
    #[error("transport stopped")]
    TransportStopped,

    /// The connection failed or was closed by the peer with an error.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// A stream delivered more bytes than the caller allowed.
    #[error("stream payload exceeds {limit} bytes")]
    PayloadTooLarge {
        /// Maximum accepted size.
        limit: usize,
    },

    /// `stop` could not flush open streams before its deadline.
    #[error("graceful shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),

    /// `stop` interrupted writes in progress; their streams were reset.
    #[error("{0} stream(s) reset during shutdown with unsent data")]
    StreamsAborted(usize),

    /// The peer violated the stream protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque identifier of a [`Transport`], unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportId(u64);

impl TransportId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Which side initiated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Created by [`Transport::connect`].
    Dialer,
    /// Created by [`listener::Listener::accept`].
    Acceptor,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dialer => write!(f, "dialer"),
            Self::Acceptor => write!(f, "acceptor"),
        }
    }
}

/// Parameters for [`Transport::stop`].
///
/// The default value is a clean shutdown with no application close reason.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStopInfo {
    /// Application close code; `None` sends the clean-close code.
    pub error_code: Option<u32>,
    /// Close reason sent to the peer.
    pub reason: Option<String>,
}

type StreamCallback = Arc<dyn Fn(StreamHandle) + Send + Sync>;

/// How a connection ended, as seen from this side.
pub(crate) enum Closure {
    /// Closed by this transport.
    Local,
    /// The peer stopped its transport cleanly.
    PeerStopped,
    /// Anything else.
    Lost(String),
}

/// State shared between a transport, its background tasks and its streams.
///
/// Streams only ever hold a [`std::sync::Weak`] reference to it.
pub(crate) struct Shared {
    id: TransportId,
    connection: quinn::Connection,
    state: StateCell,
    streams: StreamArena,
    stop_tx: watch::Sender<bool>,
}

impl Shared {
    fn is_stopping(&self) -> bool {
        *self.stop_tx.borrow()
    }

    fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Record a connection-level error and classify it.
    fn connection_closed(&self, err: &quinn::ConnectionError) -> Closure {
        match err {
            quinn::ConnectionError::LocallyClosed => Closure::Local,
            quinn::ConnectionError::ApplicationClosed(close)
                if close.error_code == VarInt::from_u32(CLEAN_CLOSE_CODE) =>
            {
                if self.state.advance(ConnectionState::Stopped) {
                    tracing::info!(transport = %self.id, "peer stopped the transport");
                }
                Closure::PeerStopped
            }
            other => {
                if self.state.advance(ConnectionState::Failed) {
                    tracing::warn!(transport = %self.id, err = %other, "QUIC connection lost");
                }
                Closure::Lost(other.to_string())
            }
        }
    }

    fn register(
        self: &Arc<Self>,
        send: quinn::SendStream,
        recv: quinn::RecvStream,
        locally_opened: bool,
    ) -> StreamHandle {
        let key = StreamKey::from(send.id());
        tokio::spawn(release_on_peer_stop(send.stopped(), key, Arc::downgrade(self)));
        self.streams
            .insert(key, Arc::new(StreamSlot::new(send, recv, !locally_opened)));
        StreamHandle::new(key, self.id, locally_opened, Arc::downgrade(self))
    }
}

/// An encrypted, multiplexed connection to one peer.
pub struct Transport {
    shared: Arc<Shared>,
    role: Role,
    /// Client endpoint owned by a dialer; acceptors share the listener's.
    endpoint: Option<quinn::Endpoint>,
    callback: watch::Sender<Option<StreamCallback>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stop_started: AtomicBool,
    shutdown_timeout: Duration,
}

impl Transport {
    /// Dial `address` (`"<host>:<port>"`) and complete the handshake.
    ///
    /// Presents `config`'s certificate and key to the peer and returns an
    /// `Established` transport.
    ///
    /// # Errors
    ///
    /// - [`TransportError::InvalidAddress`] if `address` does not resolve.
    /// - [`TransportError::InvalidConfig`] if the certificate or key is malformed.
    /// - [`TransportError::Dial`] if the peer is unreachable, the handshake
    ///   fails, or it does not finish within the handshake timeout.
    pub async fn connect(address: &str, config: &Config) -> Result<Self, TransportError> {
        let state = StateCell::new();
        let client_config = tls::client_config(config)?;
        let remote = resolve_address(address).await?[0];

        let bind_addr = if remote.is_ipv6() {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        };
        let mut endpoint =
            quinn::Endpoint::client(bind_addr).map_err(|e| dial_error(address, e))?;
        endpoint.set_default_client_config(client_config);

        let server_name = config
            .tuning
            .server_name
            .clone()
            .unwrap_or_else(|| host_part(address).to_string());

        state.advance(ConnectionState::Establishing);
        let connecting = endpoint.connect(remote, &server_name).map_err(|e| {
            tracing::warn!(err = %e, addr = %remote, "QUIC connect initiation failed");
            state.advance(ConnectionState::Failed);
            dial_error(address, e)
        })?;

        let timeout = config.tuning.handshake_timeout;
        let connection = match tokio::time::timeout(timeout, connecting).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                tracing::warn!(err = %e, addr = %remote, "QUIC handshake failed");
                state.advance(ConnectionState::Failed);
                return Err(dial_error(address, e));
            }
            Err(_) => {
                tracing::warn!(addr = %remote, timeout_ms = timeout.as_millis(), "QUIC connect timed out");
                state.advance(ConnectionState::Failed);
                return Err(TransportError::Dial {
                    address: address.to_string(),
                    reason: format!("handshake timed out after {timeout:?}"),
                });
            }
        };

        tracing::info!(addr = %remote, "QUIC connection established");
        Ok(Self::establish(
            connection,
            Role::Dialer,
            Some(endpoint),
            state,
            &config.tuning,
        ))
    }

    /// Wrap an established connection and start the inbound stream tasks.
    pub(crate) fn establish(
        connection: quinn::Connection,
        role: Role,
        endpoint: Option<quinn::Endpoint>,
        state: StateCell,
        tuning: &TransportTuning,
    ) -> Self {
        state.advance(ConnectionState::Established);
        let (stop_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            id: TransportId::next(),
            connection,
            state,
            streams: StreamArena::default(),
            stop_tx,
        });

        let (callback, callbacks) = watch::channel(None);
        let (queue_tx, queue_rx) = mpsc::channel(tuning.inbound_queue_capacity.max(1));
        let accept = tokio::spawn(accept_inbound(Arc::clone(&shared), queue_tx));
        let dispatch = tokio::spawn(dispatch_inbound(queue_rx, callbacks));

        tracing::debug!(transport = %shared.id, role = %role, "transport established");

        Self {
            shared,
            role,
            endpoint,
            callback,
            tasks: Mutex::new(vec![accept, dispatch]),
            stop_started: AtomicBool::new(false),
            shutdown_timeout: tuning.shutdown_timeout,
        }
    }

    /// Register the callback that receives streams opened by the peer.
    ///
    /// Replaces any previously registered callback. Streams that arrived
    /// before the first registration are queued and delivered to it. The
    /// callback runs on the transport's dispatch task, so it should hand
    /// long-running work (such as reading the stream) to its own task.
    pub fn on_bidirectional_stream<F>(&self, callback: F)
    where
        F: Fn(StreamHandle) + Send + Sync + 'static,
    {
        let callback: StreamCallback = Arc::new(callback);
        self.callback.send_replace(Some(callback));
    }

    /// Open a new locally initiated bidirectional stream.
    ///
    /// Does not wait for the peer to raise its stream limit.
    ///
    /// # Errors
    ///
    /// - [`TransportError::NotEstablished`] if the connection is not `Established`.
    /// - [`TransportError::StreamLimit`] if the peer's concurrent stream limit
    ///   is exhausted.
    pub async fn create_bidirectional_stream(&self) -> Result<StreamHandle, TransportError> {
        if self.shared.state.get() != ConnectionState::Established || self.shared.is_stopping() {
            return Err(TransportError::NotEstablished);
        }
        if let Some(reason) = self.shared.connection.close_reason() {
            self.shared.connection_closed(&reason);
            return Err(TransportError::NotEstablished);
        }

        let (mut send, recv) = match self.shared.connection.open_bi().now_or_never() {
            None => return Err(TransportError::StreamLimit),
            Some(Ok(pair)) => pair,
            Some(Err(e)) => {
                self.shared.connection_closed(&e);
                return Err(TransportError::NotEstablished);
            }
        };

        // The marker makes the stream visible to the peer before any payload.
        send.write_all(&[STREAM_OPEN_MARKER])
            .await
            .map_err(|e| match e {
                quinn::WriteError::ConnectionLost(e) => {
                    self.shared.connection_closed(&e);
                    TransportError::NotEstablished
                }
                _ => TransportError::StreamClosed,
            })?;

        let handle = self.shared.register(send, recv, true);
        tracing::debug!(transport = %self.shared.id, stream = %handle.id(), "opened bidirectional stream");
        Ok(handle)
    }

    /// Gracefully shut the transport down.
    ///
    /// Stops accepting streams, interrupts pending reads and writes (they
    /// observe [`ReadOutcome::TransportStopped`] /
    /// [`TransportError::TransportStopped`]), finishes every open send
    /// direction, waits for the peer to acknowledge the data, and closes the
    /// connection. Calling `stop` again is a no-op.
    ///
    /// A send direction whose write was cut short is reset rather than
    /// finished. When data is lost this way, or the flush misses its
    /// deadline, a clean close code is replaced by an abort code so the
    /// peer sees a failed connection instead of an ordinary end of stream.
    ///
    /// # Errors
    ///
    /// - [`TransportError::StreamsAborted`] if interrupted writes forced
    ///   streams to be reset.
    /// - [`TransportError::ShutdownTimeout`] if the streams could not be
    ///   flushed within the shutdown timeout.
    ///
    /// The connection is closed and all resources are released regardless.
    pub async fn stop(&self, info: TransportStopInfo) -> Result<(), TransportError> {
        if self.stop_started.swap(true, Ordering::SeqCst) {
            tracing::debug!(transport = %self.shared.id, "stop already requested");
            return Ok(());
        }

        let shared = &self.shared;
        shared.state.advance(ConnectionState::Stopping);
        tracing::info!(transport = %shared.id, role = %self.role, "stopping transport");

        let tasks = mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }
        shared.stop_tx.send_replace(true);

        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        let slots = shared.streams.drain();
        let flushed = tokio::time::timeout_at(
            deadline,
            futures_util::future::join_all(slots.iter().map(|slot| slot.flush())),
        )
        .await
        .is_ok();
        let aborted = slots.iter().filter(|slot| slot.is_torn()).count();
        drop(slots);

        let code = match info.error_code.unwrap_or(CLEAN_CLOSE_CODE) {
            CLEAN_CLOSE_CODE if aborted > 0 || !flushed => ABORTED_CLOSE_CODE,
            code => code,
        };
        let reason = info.reason.unwrap_or_default();
        shared.connection.close(VarInt::from_u32(code), reason.as_bytes());

        if let Some(endpoint) = &self.endpoint {
            if tokio::time::timeout_at(deadline, endpoint.wait_idle())
                .await
                .is_err()
            {
                tracing::debug!(transport = %shared.id, "endpoint did not drain before deadline");
            }
        }
        shared.state.advance(ConnectionState::Stopped);

        if aborted > 0 {
            tracing::warn!(transport = %shared.id, streams = aborted, "streams reset with unsent data");
            Err(TransportError::StreamsAborted(aborted))
        } else if flushed {
            tracing::info!(transport = %shared.id, "transport stopped");
            Ok(())
        } else {
            tracing::warn!(
                transport = %shared.id,
                timeout_ms = self.shutdown_timeout.as_millis(),
                "streams not flushed before shutdown deadline"
            );
            Err(TransportError::ShutdownTimeout(self.shutdown_timeout))
        }
    }

    /// Wait until the connection is closed by either side or fails, and
    /// return the resulting state.
    ///
    /// The transport's resources are still held afterwards; call
    /// [`stop`](Self::stop) to release them.
    pub async fn closed(&self) -> ConnectionState {
        let err = self.shared.connection.closed().await;
        self.shared.connection_closed(&err);
        self.shared.state.get()
    }

    /// Identifier of this transport.
    #[must_use]
    pub fn id(&self) -> TransportId {
        self.shared.id
    }

    /// Whether this side dialed or accepted the connection.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    /// Socket address of the peer.
    #[must_use]
    pub fn remote_address(&self) -> SocketAddr {
        self.shared.connection.remote_address()
    }

    /// Number of streams with at least one direction still open.
    #[must_use]
    pub fn open_stream_count(&self) -> usize {
        self.shared.streams.len()
    }

    /// Certificate the peer presented during the handshake.
    #[must_use]
    pub fn peer_certificate(&self) -> Option<CertificateDer<'static>> {
        let identity = self.shared.connection.peer_identity()?;
        let certs = *identity.downcast::<Vec<CertificateDer<'static>>>().ok()?;
        certs.into_iter().next()
    }

    /// Fingerprint of the peer's certificate, see [`identity::fingerprint`].
    #[must_use]
    pub fn peer_fingerprint(&self) -> Option<String> {
        self.peer_certificate()
            .map(|cert| identity::fingerprint(&cert))
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.shared.id)
            .field("role", &self.role)
            .field("state", &self.shared.state.get())
            .finish_non_exhaustive()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if self.stop_started.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        self.shared.stop_tx.send_replace(true);
        self.shared
            .connection
            .close(VarInt::from_u32(CLEAN_CLOSE_CODE), b"dropped");
        self.shared.state.advance(ConnectionState::Stopped);
        tracing::debug!(transport = %self.shared.id, "transport dropped without stop");
    }
}

// ---------------------------------------------------------------------------
// Inbound stream tasks
// ---------------------------------------------------------------------------

async fn accept_inbound(shared: Arc<Shared>, queue: mpsc::Sender<StreamHandle>) {
    loop {
        match shared.connection.accept_bi().await {
            Ok((send, recv)) => {
                let handle = shared.register(send, recv, false);
                tracing::debug!(transport = %shared.id, stream = %handle.id(), "accepted bidirectional stream");
                if queue.send(handle).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                if let Closure::Lost(reason) = shared.connection_closed(&e) {
                    tracing::debug!(transport = %shared.id, reason = %reason, "inbound stream accept ended");
                }
                break;
            }
        }
    }
}

async fn dispatch_inbound(
    mut queue: mpsc::Receiver<StreamHandle>,
    mut callbacks: watch::Receiver<Option<StreamCallback>>,
) {
    while let Some(stream) = queue.recv().await {
        // Clone out of the watch guard so the callback may re-register.
        let callback = match callbacks.wait_for(Option::is_some).await {
            Ok(current) => current.clone(),
            Err(_) => return,
        };
        if let Some(callback) = callback {
            callback(stream);
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Completes once the flag behind `rx` is set. Never completes if the sender
/// is dropped first.
pub(crate) async fn signalled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|set| *set).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Resolve `"<host>:<port>"`, IPv4 results first.
pub(crate) async fn resolve_address(address: &str) -> Result<Vec<SocketAddr>, TransportError> {
    let mut addrs: Vec<SocketAddr> = tokio::net::lookup_host(address)
        .await
        .map_err(|e| TransportError::InvalidAddress(format!("{address}: {e}")))?
        .collect();
    if addrs.is_empty() {
        return Err(TransportError::InvalidAddress(format!(
            "{address}: no addresses found"
        )));
    }
    addrs.sort_by_key(SocketAddr::is_ipv6);
    Ok(addrs)
}

fn host_part(address: &str) -> &str {
    let host = address
        .rsplit_once(':')
        .map_or(address, |(host, _port)| host)
        .trim_start_matches('[')
        .trim_end_matches(']');
    if host.is_empty() { "localhost" } else { host }
}

fn dial_error(address: &str, err: impl fmt::Display) -> TransportError {
    TransportError::Dial {
        address: address.to_string(),
        reason: err.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
