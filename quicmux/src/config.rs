//! Transport configuration.
//!
//! A [`Config`] bundles the local TLS identity with [`TransportTuning`]
//! knobs. It is handed to [`Transport::connect`](crate::transport::Transport::connect)
//! or [`Listener::bind`](crate::transport::listener::Listener::bind) by
//! reference; the transport copies what it needs into the QUIC and TLS
//! configuration and never mutates it.

use std::fmt;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::identity::{self, IdentityError, Origin};

/// Tuning options applied to the QUIC connection and to the transport core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportTuning {
    /// Upper bound on the QUIC/TLS handshake, for both dial and accept.
    pub handshake_timeout: Duration,
    /// Deadline for `stop` to flush open streams before closing.
    pub shutdown_timeout: Duration,
    /// Keep-alive ping interval, `None` to disable.
    pub keep_alive_interval: Option<Duration>,
    /// Idle timeout after which a silent connection is dropped.
    pub idle_timeout: Duration,
    /// Bidirectional streams the peer may have open concurrently.
    pub max_concurrent_bidi_streams: u32,
    /// Capacity of the inbound stream queue feeding the callback.
    pub inbound_queue_capacity: usize,
    /// TLS server name sent when dialing. Defaults to the host part of the address.
    pub server_name: Option<String>,
    /// Lowercase hex SHA-256 fingerprint the remote certificate must match.
    pub pinned_peer_fingerprint: Option<String>,
}

impl Default for TransportTuning {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
            keep_alive_interval: Some(Duration::from_secs(15)),
            idle_timeout: Duration::from_secs(30),
            max_concurrent_bidi_streams: 100,
            inbound_queue_capacity: 64,
            server_name: None,
            pinned_peer_fingerprint: None,
        }
    }
}

/// Identity and tuning for one side of a transport.
pub struct Config {
    /// DER-encoded X.509 certificate presented to the peer.
    pub certificate: CertificateDer<'static>,
    /// Private key matching `certificate`.
    pub private_key: PrivateKeyDer<'static>,
    /// Transport tuning options.
    pub tuning: TransportTuning,
}

impl Config {
    /// Build a configuration with default tuning.
    #[must_use]
    pub fn new(certificate: CertificateDer<'static>, private_key: PrivateKeyDer<'static>) -> Self {
        Self {
            certificate,
            private_key,
            tuning: TransportTuning::default(),
        }
    }

    /// Build a configuration around a freshly generated self-signed identity.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError`] if the identity cannot be generated.
    pub fn self_signed(origin: &Origin) -> Result<Self, IdentityError> {
        let (certificate, private_key) = identity::generate_self_signed_with_origin(origin)?;
        Ok(Self::new(certificate, private_key))
    }

    /// Replace the tuning options.
    #[must_use]
    pub fn with_tuning(mut self, tuning: TransportTuning) -> Self {
        self.tuning = tuning;
        self
    }

    /// Fingerprint of the local certificate, for out-of-band exchange.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        identity::fingerprint(&self.certificate)
    }
}

impl Clone for Config {
    fn clone(&self) -> Self {
        Self {
            certificate: self.certificate.clone(),
            private_key: self.private_key.clone_key(),
            tuning: self.tuning.clone(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("fingerprint", &self.fingerprint())
            .field("tuning", &self.tuning)
            .finish_non_exhaustive()
    }
}
