//! Echo server and one-shot client.
//!
//! The server writes every inbound stream's bytes back to the sender and
//! then finishes its send direction. The client opens one stream, sends a
//! message, collects the echo and stops the transport.

use std::future::Future;

use quicmux::{
    Config, Listener, StreamHandle, StreamWriteParameters, Transport, TransportError,
    TransportStopInfo,
};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::PeerError;

/// Largest payload the echo server and client accept on one stream.
pub const MAX_ECHO_BYTES: usize = 1024 * 1024;

/// Application error code used to reset a stream the server cannot echo.
const ECHO_FAILED_CODE: u32 = 1;

/// Accept transports from `listener` and echo their streams until
/// `shutdown` completes. Every session is stopped before returning.
pub async fn serve<F>(listener: Listener, shutdown: F)
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok(transport) => {
                    sessions.spawn(run_session(transport, stop_rx.clone()));
                }
                Err(TransportError::ListenerClosed) => break,
                Err(e) => tracing::warn!(err = %e, "rejected inbound connection"),
            },
        }
    }

    listener.close();
    stop_tx.send_replace(true);
    while sessions.join_next().await.is_some() {}
    tracing::info!("echo server stopped");
}

async fn run_session(transport: Transport, mut stop: watch::Receiver<bool>) {
    let remote = transport.remote_address();
    tracing::info!(
        addr = %remote,
        peer = transport.peer_fingerprint().as_deref().unwrap_or("unknown"),
        "echo session started"
    );

    transport.on_bidirectional_stream(|stream| {
        tokio::spawn(echo_stream(stream));
    });

    tokio::select! {
        state = transport.closed() => {
            tracing::info!(addr = %remote, state = %state, "echo session ended by peer");
        }
        _ = stop.changed() => {}
    }

    if let Err(e) = transport.stop(TransportStopInfo::default()).await {
        tracing::warn!(err = %e, addr = %remote, "echo session did not stop cleanly");
    }
}

async fn echo_stream(stream: StreamHandle) {
    match echo_once(&stream).await {
        Ok(len) => tracing::debug!(stream = %stream.id(), bytes = len, "echoed stream"),
        Err(TransportError::TransportStopped) => {}
        Err(e) => {
            tracing::warn!(stream = %stream.id(), err = %e, "echo failed");
            let _ = stream.reset(ECHO_FAILED_CODE).await;
        }
    }
}

async fn echo_once(stream: &StreamHandle) -> Result<usize, TransportError> {
    let data = stream.read_to_end(MAX_ECHO_BYTES).await?;
    let len = data.len();
    stream
        .write(StreamWriteParameters::new(data).finish())
        .await?;
    Ok(len)
}

/// Dial `address`, send `message` on a new stream and return the echo.
///
/// The transport is stopped before returning, even when the exchange fails.
///
/// # Errors
///
/// Returns [`PeerError::Transport`] if dialing, the exchange or the stop fails.
pub async fn run_client(
    address: &str,
    config: &Config,
    message: &[u8],
) -> Result<Vec<u8>, PeerError> {
    let transport = Transport::connect(address, config).await?;
    tracing::info!(
        addr = %transport.remote_address(),
        peer = transport.peer_fingerprint().as_deref().unwrap_or("unknown"),
        "connected"
    );

    let echoed = exchange(&transport, message).await;
    transport.stop(TransportStopInfo::default()).await?;
    Ok(echoed?)
}

async fn exchange(transport: &Transport, message: &[u8]) -> Result<Vec<u8>, TransportError> {
    let stream = transport.create_bidirectional_stream().await?;
    stream
        .write(StreamWriteParameters::new(message).finish())
        .await?;
    stream.read_to_end(MAX_ECHO_BYTES).await
}
