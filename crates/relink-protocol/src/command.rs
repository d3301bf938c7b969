//! Protocol command types.
//!
//! Everything crossing the wire is a command: payload sends, acknowledgements,
//! pings, handshake and disconnect records, bandwidth and throttle updates.
//! Commands are aggregated into datagrams up to the peer's MTU.

use relink_core::shared::SharedBytes;

/// Low 4 bits of the command byte select the command number.
pub const COMMAND_MASK: u8 = 0x0F;
/// Command flag: the receiver must acknowledge this command.
pub const COMMAND_FLAG_ACKNOWLEDGE: u8 = 1 << 7;
/// Command flag: the command is outside all sequencing.
pub const COMMAND_FLAG_UNSEQUENCED: u8 = 1 << 6;

/// Size of the per-command header on the wire.
pub const COMMAND_HEADER_SIZE: usize = 4;

/// Command numbers as they appear in the low bits of the command byte.
pub mod number {
    /// Acknowledges a received reliable command.
    pub const ACKNOWLEDGE: u8 = 1;
    /// Opens a connection.
    pub const CONNECT: u8 = 2;
    /// Accepts a connection, echoing negotiated parameters.
    pub const VERIFY_CONNECT: u8 = 3;
    /// Closes a connection.
    pub const DISCONNECT: u8 = 4;
    /// Keep-alive.
    pub const PING: u8 = 5;
    /// Reliable payload.
    pub const SEND_RELIABLE: u8 = 6;
    /// Unreliable sequenced payload.
    pub const SEND_UNRELIABLE: u8 = 7;
    /// Fragment of a reliable payload.
    pub const SEND_FRAGMENT: u8 = 8;
    /// Unsequenced payload.
    pub const SEND_UNSEQUENCED: u8 = 9;
    /// Advertises new bandwidth limits.
    pub const BANDWIDTH_LIMIT: u8 = 10;
    /// Reconfigures the peer's packet throttle.
    pub const THROTTLE_CONFIGURE: u8 = 11;
    /// Fragment of an unreliable payload.
    pub const SEND_UNRELIABLE_FRAGMENT: u8 = 12;
    /// One past the largest valid command number.
    pub const COUNT: u8 = 13;
}

/// Returns the fixed wire size of a command (header plus record, excluding
/// any payload), or 0 for an invalid command number.
pub fn command_size(command_number: u8) -> usize {
    match command_number & COMMAND_MASK {
        number::ACKNOWLEDGE => COMMAND_HEADER_SIZE + 4,
        number::CONNECT => COMMAND_HEADER_SIZE + 44,
        number::VERIFY_CONNECT => COMMAND_HEADER_SIZE + 40,
        number::DISCONNECT => COMMAND_HEADER_SIZE + 4,
        number::PING => COMMAND_HEADER_SIZE,
        number::SEND_RELIABLE => COMMAND_HEADER_SIZE + 2,
        number::SEND_UNRELIABLE => COMMAND_HEADER_SIZE + 4,
        number::SEND_FRAGMENT => COMMAND_HEADER_SIZE + 20,
        number::SEND_UNSEQUENCED => COMMAND_HEADER_SIZE + 4,
        number::BANDWIDTH_LIMIT => COMMAND_HEADER_SIZE + 8,
        number::THROTTLE_CONFIGURE => COMMAND_HEADER_SIZE + 12,
        number::SEND_UNRELIABLE_FRAGMENT => COMMAND_HEADER_SIZE + 20,
        _ => 0,
    }
}

/// Per-command header: flag bits, channel, and reliable sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    /// `COMMAND_FLAG_ACKNOWLEDGE` and/or `COMMAND_FLAG_UNSEQUENCED`.
    pub flags: u8,
    /// Channel the command belongs to; 0xFF for peer-wide control commands.
    pub channel_id: u8,
    /// Reliable sequence number assigned at enqueue time.
    pub reliable_sequence_number: u16,
}

impl CommandHeader {
    /// Header for a peer-wide control command carrying the given flags.
    pub fn control(flags: u8) -> Self {
        Self { flags, channel_id: 0xFF, reliable_sequence_number: 0 }
    }

    /// Header for a channel-bound command carrying the given flags.
    pub fn channel(channel_id: u8, flags: u8) -> Self {
        Self { flags, channel_id, reliable_sequence_number: 0 }
    }

    /// True if the command demands acknowledgement.
    pub fn is_acknowledged(&self) -> bool {
        self.flags & COMMAND_FLAG_ACKNOWLEDGE != 0
    }

    /// True if the command is outside all sequencing.
    pub fn is_unsequenced(&self) -> bool {
        self.flags & COMMAND_FLAG_UNSEQUENCED != 0
    }
}

/// Connection parameters exchanged by CONNECT and VERIFY_CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectParams {
    /// Sender's peer id for this connection (the receiver's outgoing id).
    pub outgoing_peer_id: u16,
    /// Sender's incoming session id; 0xFF asks the receiver to pick.
    pub incoming_session_id: u8,
    /// Sender's outgoing session id; 0xFF asks the receiver to pick.
    pub outgoing_session_id: u8,
    /// Sender's MTU in bytes.
    pub mtu: u32,
    /// Sender's reliable window size in bytes.
    pub window_size: u32,
    /// Number of channels the sender wants.
    pub channel_count: u32,
    /// Sender's incoming bandwidth in bytes/sec (0 = unlimited).
    pub incoming_bandwidth: u32,
    /// Sender's outgoing bandwidth in bytes/sec (0 = unlimited).
    pub outgoing_bandwidth: u32,
    /// Packet throttle measurement interval in milliseconds.
    pub packet_throttle_interval: u32,
    /// Packet throttle acceleration.
    pub packet_throttle_acceleration: u32,
    /// Packet throttle deceleration.
    pub packet_throttle_deceleration: u32,
    /// Random connection identifier chosen by the initiator.
    pub connect_id: u32,
}

/// The record portion of a protocol command.
///
/// Payload-bearing variants reference their bytes through `SharedBytes`;
/// the on-wire `data_length` field is derived from the payload view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    /// Acknowledges the reliable command named by the header snapshot.
    Acknowledge {
        /// Reliable sequence number being acknowledged.
        received_reliable_sequence_number: u16,
        /// Low 16 bits of the acked datagram's sent time.
        received_sent_time: u16,
    },
    /// Opens a connection.
    Connect {
        /// Negotiation parameters.
        params: ConnectParams,
        /// User data surfaced in the receiver's CONNECT event.
        data: u32,
    },
    /// Accepts a connection.
    VerifyConnect {
        /// Agreed negotiation parameters.
        params: ConnectParams,
    },
    /// Closes a connection.
    Disconnect {
        /// User data surfaced in the receiver's DISCONNECT event.
        data: u32,
    },
    /// Keep-alive probe.
    Ping,
    /// Reliable payload.
    SendReliable {
        /// Payload bytes.
        data: SharedBytes,
    },
    /// Unreliable payload, ordered within its reliable baseline.
    SendUnreliable {
        /// Unreliable sequence number within the current reliable baseline.
        unreliable_sequence_number: u16,
        /// Payload bytes.
        data: SharedBytes,
    },
    /// One fragment of a reliable payload.
    SendFragment {
        /// Reliable sequence number of the first fragment of the run.
        start_sequence_number: u16,
        /// Total number of fragments in the run.
        fragment_count: u32,
        /// This fragment's index within the run.
        fragment_number: u32,
        /// Length of the complete reassembled payload.
        total_length: u32,
        /// Byte offset of this fragment within the payload.
        fragment_offset: u32,
        /// This fragment's bytes.
        data: SharedBytes,
    },
    /// Unsequenced payload guarded by the replay window.
    SendUnsequenced {
        /// Replay window group of this send.
        unsequenced_group: u16,
        /// Payload bytes.
        data: SharedBytes,
    },
    /// Advertises new bandwidth limits.
    BandwidthLimit {
        /// Sender's incoming bandwidth in bytes/sec (0 = unlimited).
        incoming_bandwidth: u32,
        /// Sender's outgoing bandwidth in bytes/sec (0 = unlimited).
        outgoing_bandwidth: u32,
    },
    /// Reconfigures the receiver's packet throttle.
    ThrottleConfigure {
        /// Measurement interval in milliseconds.
        packet_throttle_interval: u32,
        /// Acceleration applied on improving RTT.
        packet_throttle_acceleration: u32,
        /// Deceleration applied on degrading RTT.
        packet_throttle_deceleration: u32,
    },
    /// One fragment of an unreliable payload; same layout as SendFragment.
    SendUnreliableFragment {
        /// Unreliable sequence number of the first fragment of the run.
        start_sequence_number: u16,
        /// Total number of fragments in the run.
        fragment_count: u32,
        /// This fragment's index within the run.
        fragment_number: u32,
        /// Length of the complete reassembled payload.
        total_length: u32,
        /// Byte offset of this fragment within the payload.
        fragment_offset: u32,
        /// This fragment's bytes.
        data: SharedBytes,
    },
}

impl CommandKind {
    /// Returns the wire command number.
    pub fn number(&self) -> u8 {
        match self {
            CommandKind::Acknowledge { .. } => number::ACKNOWLEDGE,
            CommandKind::Connect { .. } => number::CONNECT,
            CommandKind::VerifyConnect { .. } => number::VERIFY_CONNECT,
            CommandKind::Disconnect { .. } => number::DISCONNECT,
            CommandKind::Ping => number::PING,
            CommandKind::SendReliable { .. } => number::SEND_RELIABLE,
            CommandKind::SendUnreliable { .. } => number::SEND_UNRELIABLE,
            CommandKind::SendFragment { .. } => number::SEND_FRAGMENT,
            CommandKind::SendUnsequenced { .. } => number::SEND_UNSEQUENCED,
            CommandKind::BandwidthLimit { .. } => number::BANDWIDTH_LIMIT,
            CommandKind::ThrottleConfigure { .. } => number::THROTTLE_CONFIGURE,
            CommandKind::SendUnreliableFragment { .. } => number::SEND_UNRELIABLE_FRAGMENT,
        }
    }

    /// Returns the payload bytes if this is a payload-bearing command.
    pub fn payload(&self) -> Option<&SharedBytes> {
        match self {
            CommandKind::SendReliable { data }
            | CommandKind::SendUnreliable { data, .. }
            | CommandKind::SendFragment { data, .. }
            | CommandKind::SendUnsequenced { data, .. }
            | CommandKind::SendUnreliableFragment { data, .. } => Some(data),
            _ => None,
        }
    }
}

/// A complete protocol command: header plus record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolCommand {
    /// Flags, channel, and reliable sequence number.
    pub header: CommandHeader,
    /// Record portion.
    pub kind: CommandKind,
}

impl ProtocolCommand {
    /// Creates a command from a header and record.
    pub fn new(header: CommandHeader, kind: CommandKind) -> Self {
        Self { header, kind }
    }

    /// Returns the wire command number.
    pub fn number(&self) -> u8 {
        self.kind.number()
    }

    /// Fixed wire size of header plus record, excluding payload.
    pub fn size(&self) -> usize {
        command_size(self.number())
    }

    /// Returns the payload bytes if this is a payload-bearing command.
    pub fn payload(&self) -> Option<&SharedBytes> {
        self.kind.payload()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_numbers_are_dense() {
        for n in 1..number::COUNT {
            assert!(command_size(n) >= COMMAND_HEADER_SIZE, "command {} has no size", n);
        }
        assert_eq!(command_size(0), 0);
        assert_eq!(command_size(number::COUNT), 0);
    }

    #[test]
    fn test_flags_survive_in_size_lookup() {
        // The size table must ignore the flag bits.
        assert_eq!(
            command_size(number::SEND_RELIABLE | COMMAND_FLAG_ACKNOWLEDGE),
            command_size(number::SEND_RELIABLE)
        );
    }

    #[test]
    fn test_payload_accessor() {
        let cmd = ProtocolCommand::new(
            CommandHeader::channel(0, COMMAND_FLAG_ACKNOWLEDGE),
            CommandKind::SendReliable { data: vec![1, 2, 3].into() },
        );
        assert_eq!(cmd.payload().unwrap().len(), 3);
        assert!(cmd.header.is_acknowledged());

        let ping = ProtocolCommand::new(CommandHeader::control(COMMAND_FLAG_ACKNOWLEDGE), CommandKind::Ping);
        assert!(ping.payload().is_none());
        assert_eq!(ping.size(), COMMAND_HEADER_SIZE);
    }
}
