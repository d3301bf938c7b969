//! Events surfaced by the service loop.

use relink_protocol::packet::Packet;

use crate::host::PeerId;

/// An event produced by [`crate::Host::service`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A connection completed its handshake.
    Connect {
        /// The peer that connected.
        peer: PeerId,
        /// User data from the remote's CONNECT command.
        data: u32,
    },
    /// A connection closed, timed out, or was rejected.
    Disconnect {
        /// The peer that disconnected; its slot is free again.
        peer: PeerId,
        /// User data from the remote's DISCONNECT command, 0 on timeout.
        data: u32,
    },
    /// A packet arrived on a channel.
    Receive {
        /// The peer that sent the packet.
        peer: PeerId,
        /// Channel the packet arrived on.
        channel_id: u8,
        /// The delivered packet.
        packet: Packet,
    },
}

impl Event {
    /// The peer this event concerns.
    pub fn peer(&self) -> PeerId {
        match self {
            Event::Connect { peer, .. } | Event::Disconnect { peer, .. } | Event::Receive { peer, .. } => {
                *peer
            }
        }
    }
}
