//! Connection lifecycle
//!
//! The [`ConnectionManager`] owns the wire channel, the authentication
//! bootstrap and the reconnection policy. Channels are opened through a
//! [`Connector`], so the state machine can run over a real WebSocket or an
//! in-process test double alike.

mod close;
mod manager;
mod transport;

pub use close::{CloseDisposition, close_codes};
pub use manager::{ConnectionManager, ReconnectSnapshot};
pub use transport::{
    CHANNEL_BUFFER, Channel, Connector, OutboundWire, WebSocketConnector, WireEvent,
};

use std::fmt;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionStatus {
    /// No channel open
    #[default]
    Disconnected,
    /// A channel open attempt is in flight
    Connecting,
    /// Channel open, identity accepted, tools advertised
    Connected,
    /// A remote agent is attached to this session
    Bridged,
}

impl ConnectionStatus {
    /// Canonical lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Bridged => "bridged",
        }
    }

    /// Whether a channel is open and frames can be sent
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Connected | Self::Bridged)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
