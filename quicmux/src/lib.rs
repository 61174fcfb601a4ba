//! `quicmux` — multiplexed bidirectional QUIC streams between two peers.
//!
//! Each side identifies itself with a self-signed certificate
//! ([`identity`]), bundles it with tuning options in a [`config::Config`],
//! and either dials ([`transport::Transport::connect`]) or accepts
//! ([`transport::listener::Listener`]) a single encrypted connection over
//! which any number of [`transport::StreamHandle`]s are multiplexed.

pub mod config;
pub mod identity;
pub mod transport;

pub use config::{Config, TransportTuning};
pub use transport::listener::{Listener, accept_one};
pub use transport::{
    ConnectionState, ReadOutcome, Role, StreamHandle, StreamWriteParameters, Transport,
    TransportError, TransportStopInfo,
};
