//! Connection lifecycle state.

use std::fmt;

use parking_lot::Mutex;

/// Lifecycle of a [`Transport`](super::Transport) connection.
///
/// Progresses `Created → Establishing → Established → Stopping → Stopped`.
/// Any state before `Stopped` may move to `Failed`. Transitions never go
/// backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Nothing has been sent yet.
    Created,
    /// The QUIC/TLS handshake is in progress.
    Establishing,
    /// The handshake completed; streams may be created.
    Established,
    /// `stop` is flushing streams and closing the connection.
    Stopping,
    /// The connection is closed.
    Stopped,
    /// The handshake or the connection failed.
    Failed,
}

impl ConnectionState {
    const fn rank(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Establishing => 1,
            Self::Established => 2,
            Self::Stopping => 3,
            Self::Stopped | Self::Failed => 4,
        }
    }

    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Establishing => "establishing",
            Self::Established => "established",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Shared, monotonic holder for a [`ConnectionState`].
#[derive(Debug)]
pub(crate) struct StateCell(Mutex<ConnectionState>);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(Mutex::new(ConnectionState::Created))
    }

    pub(crate) fn get(&self) -> ConnectionState {
        *self.0.lock()
    }

    /// Move to `next` if that is a forward transition. Returns whether the
    /// state changed.
    pub(crate) fn advance(&self, next: ConnectionState) -> bool {
        let mut current = self.0.lock();
        let allowed = !current.is_terminal()
            && (next == ConnectionState::Failed || next.rank() > current.rank());
        if allowed {
            tracing::trace!(from = %*current, to = %next, "connection state transition");
            *current = next;
        }
        allowed
    }
}
