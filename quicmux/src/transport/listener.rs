//! Accepting side of the transport.
//!
//! A [`Listener`] binds a UDP socket and turns each inbound handshake into
//! an `Acceptor` [`Transport`]. [`accept_one`] covers the common case of a
//! server that talks to a single peer.

use std::net::SocketAddr;

use tokio::sync::watch;

use super::state::{ConnectionState, StateCell};
use super::{Role, Transport, TransportError, resolve_address, signalled, tls};
use crate::config::{Config, TransportTuning};

/// A bound QUIC endpoint accepting inbound transports.
pub struct Listener {
    endpoint: quinn::Endpoint,
    tuning: TransportTuning,
    closed: watch::Sender<bool>,
}

impl Listener {
    /// Bind to `address` (`"<host>:<port>"`, port `0` for an ephemeral port).
    ///
    /// Resolved addresses are tried in order, IPv4 first, until one binds.
    ///
    /// # Errors
    ///
    /// - [`TransportError::InvalidAddress`] if `address` does not resolve.
    /// - [`TransportError::InvalidConfig`] if the certificate or key is malformed.
    /// - [`TransportError::Listen`] if no resolved address could be bound.
    pub async fn bind(address: &str, config: &Config) -> Result<Self, TransportError> {
        let server_config = tls::server_config(config)?;
        let mut last_error = None;

        for addr in resolve_address(address).await? {
            match quinn::Endpoint::server(server_config.clone(), addr) {
                Ok(endpoint) => {
                    let local = endpoint.local_addr().unwrap_or(addr);
                    tracing::info!(addr = %local, "QUIC listener bound");
                    let (closed, _) = watch::channel(false);
                    return Ok(Self {
                        endpoint,
                        tuning: config.tuning.clone(),
                        closed,
                    });
                }
                Err(e) => {
                    tracing::debug!(err = %e, addr = %addr, "QUIC bind attempt failed");
                    last_error = Some(e);
                }
            }
        }

        let reason = last_error.map_or_else(|| "no usable address".to_string(), |e| e.to_string());
        tracing::warn!(addr = %address, reason = %reason, "QUIC listener bind failed");
        Err(TransportError::Listen {
            address: address.to_string(),
            reason,
        })
    }

    /// Address the listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Wait for the next inbound connection and complete its handshake.
    ///
    /// # Errors
    ///
    /// - [`TransportError::ListenerClosed`] if [`close`](Self::close) was called.
    /// - [`TransportError::Handshake`] if the handshake failed or timed out.
    ///   The listener stays usable.
    pub async fn accept(&self) -> Result<Transport, TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TransportError::ListenerClosed);
        }

        let incoming = tokio::select! {
            incoming = self.endpoint.accept() => incoming.ok_or(TransportError::ListenerClosed)?,
            () = signalled(&mut closed) => return Err(TransportError::ListenerClosed),
        };
        let remote = incoming.remote_address();

        let state = StateCell::new();
        state.advance(ConnectionState::Establishing);
        let connecting = incoming.accept().map_err(|e| {
            tracing::warn!(err = %e, addr = %remote, "QUIC accept refused");
            state.advance(ConnectionState::Failed);
            TransportError::Handshake(e.to_string())
        })?;

        let timeout = self.tuning.handshake_timeout;
        let connection = match tokio::time::timeout(timeout, connecting).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                tracing::warn!(err = %e, addr = %remote, "QUIC accept handshake failed");
                state.advance(ConnectionState::Failed);
                return Err(TransportError::Handshake(e.to_string()));
            }
            Err(_) => {
                tracing::warn!(addr = %remote, timeout_ms = timeout.as_millis(), "QUIC accept handshake timed out");
                state.advance(ConnectionState::Failed);
                return Err(TransportError::Handshake(format!(
                    "timed out after {timeout:?}"
                )));
            }
        };

        tracing::info!(addr = %remote, "accepted QUIC connection");
        Ok(Transport::establish(
            connection,
            Role::Acceptor,
            None,
            state,
            &self.tuning,
        ))
    }

    /// Stop accepting connections. Pending and later [`accept`](Self::accept)
    /// calls return [`TransportError::ListenerClosed`]; transports already
    /// accepted keep running.
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            self.endpoint.set_server_config(None);
            tracing::info!("QUIC listener closed");
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.endpoint.local_addr().ok())
            .finish_non_exhaustive()
    }
}

/// Bind `address`, wait for one peer, and return its transport together
/// with the listener (which keeps the socket alive).
///
/// # Errors
///
/// Any error from [`Listener::bind`] or [`Listener::accept`].
pub async fn accept_one(
    address: &str,
    config: &Config,
) -> Result<(Transport, Listener), TransportError> {
    let listener = Listener::bind(address, config).await?;
    let transport = listener.accept().await?;
    Ok((transport, listener))
}
