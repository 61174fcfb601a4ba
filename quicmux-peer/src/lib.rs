//! `quicmux-peer` library.
//!
//! Exposes the echo server and client used by the `quicmux-peer` binary
//! for use in tests and embedding.

pub mod config;
pub mod echo;

use quicmux::TransportError;
use quicmux::identity::IdentityError;

/// Errors surfaced by the peer binary.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    /// The local identity could not be generated.
    #[error("identity generation failed: {0}")]
    Identity(#[from] IdentityError),

    /// A transport operation failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}
