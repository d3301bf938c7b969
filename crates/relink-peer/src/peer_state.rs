/// Peer connection state machine.
///
/// Declaration order is the lifecycle order; the host relies on ordinal
/// comparisons to classify states the way the protocol does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum PeerState {
    /// Slot is free; no connection.
    #[default]
    Disconnected,

    /// Client: CONNECT queued, waiting for VERIFY_CONNECT.
    Connecting,

    /// Server: CONNECT received, VERIFY_CONNECT queued, waiting for its ack.
    AcknowledgingConnect,

    /// Server: handshake finished outside a service call; CONNECT event
    /// surfaces at the next dispatch.
    ConnectionPending,

    /// Client: handshake finished outside a service call; CONNECT event
    /// surfaces at the next dispatch.
    ConnectionSucceeded,

    /// Connection is live.
    Connected,

    /// Draining queued sends before disconnecting.
    DisconnectLater,

    /// DISCONNECT queued, waiting for its ack.
    Disconnecting,

    /// DISCONNECT received; only its ack remains to be sent.
    AcknowledgingDisconnect,

    /// Scheduled to surface a DISCONNECT event at next dispatch, then reset.
    Zombie,
}

impl PeerState {
    /// True for the two states that count as an established connection.
    pub fn is_connected(&self) -> bool {
        matches!(self, PeerState::Connected | PeerState::DisconnectLater)
    }
}
