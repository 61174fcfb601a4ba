//! QUIC/TLS configuration for both transport roles.
//!
//! Both sides present their self-signed certificate (mutual TLS 1.3). The
//! presented certificate is never chained to a trust root: the verifier only
//! checks handshake signatures against the certificate's own key and,
//! when configured, that the certificate matches a pinned fingerprint.

use std::sync::Arc;

use quinn::VarInt;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};

use super::TransportError;
use crate::config::{Config, TransportTuning};
use crate::identity;

/// ALPN protocol identifier negotiated by both roles.
pub const ALPN_PROTOCOL: &[u8] = b"quicmux";

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Build the [`quinn::ServerConfig`] used by the accepting role.
///
/// # Errors
///
/// Returns [`TransportError::InvalidConfig`] if the certificate or key is
/// malformed or the tuning values are out of range.
pub fn server_config(config: &Config) -> Result<quinn::ServerConfig, TransportError> {
    let verifier = Arc::new(PeerVerifier::new(
        config.tuning.pinned_peer_fingerprint.as_deref(),
    ));

    let mut server_crypto = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(invalid_config)?
        .with_client_cert_verifier(verifier)
        .with_single_cert(
            vec![config.certificate.clone()],
            config.private_key.clone_key(),
        )
        .map_err(invalid_config)?;
    server_crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let quic_crypto =
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto).map_err(invalid_config)?;
    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_crypto));
    server_config.transport_config(Arc::new(transport_config(&config.tuning)?));

    Ok(server_config)
}

/// Build the [`quinn::ClientConfig`] used by the dialing role.
///
/// # Errors
///
/// Returns [`TransportError::InvalidConfig`] if the certificate or key is
/// malformed or the tuning values are out of range.
pub fn client_config(config: &Config) -> Result<quinn::ClientConfig, TransportError> {
    let verifier = Arc::new(PeerVerifier::new(
        config.tuning.pinned_peer_fingerprint.as_deref(),
    ));

    let mut client_crypto = rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(invalid_config)?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(
            vec![config.certificate.clone()],
            config.private_key.clone_key(),
        )
        .map_err(invalid_config)?;
    client_crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let quic_crypto =
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto).map_err(invalid_config)?;
    let mut client_config = quinn::ClientConfig::new(Arc::new(quic_crypto));
    client_config.transport_config(Arc::new(transport_config(&config.tuning)?));

    Ok(client_config)
}

fn transport_config(tuning: &TransportTuning) -> Result<quinn::TransportConfig, TransportError> {
    let idle_timeout = quinn::IdleTimeout::try_from(tuning.idle_timeout)
        .map_err(|e| TransportError::InvalidConfig(format!("idle timeout: {e}")))?;

    let mut transport = quinn::TransportConfig::default();
    transport.max_concurrent_bidi_streams(VarInt::from_u32(tuning.max_concurrent_bidi_streams));
    transport.max_concurrent_uni_streams(VarInt::from_u32(0));
    transport.keep_alive_interval(tuning.keep_alive_interval);
    transport.max_idle_timeout(Some(idle_timeout));
    Ok(transport)
}

fn invalid_config(err: impl std::fmt::Display) -> TransportError {
    TransportError::InvalidConfig(err.to_string())
}

/// Certificate verifier for self-signed peers, used on both sides.
///
/// Accepts any certificate unless a fingerprint is pinned, but always
/// verifies handshake signatures so the peer proves possession of the
/// certificate's key.
#[derive(Debug)]
pub(crate) struct PeerVerifier {
    pinned: Option<String>,
    provider: Arc<CryptoProvider>,
}

impl PeerVerifier {
    pub(crate) fn new(pinned: Option<&str>) -> Self {
        Self {
            pinned: pinned.map(str::to_ascii_lowercase),
            provider: crypto_provider(),
        }
    }

    fn check_pin(&self, cert: &CertificateDer<'_>) -> Result<(), rustls::Error> {
        match &self.pinned {
            Some(expected) if identity::fingerprint(cert) != *expected => {
                tracing::warn!(expected = %expected, "peer certificate fingerprint mismatch");
                Err(rustls::Error::General(
                    "peer certificate fingerprint mismatch".into(),
                ))
            }
            _ => Ok(()),
        }
    }

    fn tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

impl ServerCertVerifier for PeerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.check_pin(end_entity)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes()
    }
}

impl ClientCertVerifier for PeerVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.check_pin(end_entity)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes()
    }
}
