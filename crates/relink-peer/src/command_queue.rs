//! Outgoing and incoming command records.

use relink_core::shared::SharedBytes;
use relink_protocol::{
    command::number,
    packet::{Packet, PacketFlags},
    ProtocolCommand,
};

/// A command queued for transmission.
#[derive(Debug, Clone)]
pub struct OutgoingCommand {
    /// The protocol command; payload variants carry their bytes.
    pub command: ProtocolCommand,
    /// Reliable sequence number assigned at enqueue time.
    pub reliable_sequence_number: u16,
    /// Unreliable sequence number assigned at enqueue time.
    pub unreliable_sequence_number: u16,
    /// Service time of the last transmission attempt.
    pub sent_time: u32,
    /// Retransmission timeout; doubles on every expiry.
    pub round_trip_timeout: u32,
    /// Monotonic enqueue stamp used to interleave the outgoing queues.
    pub queue_time: u32,
    /// Byte offset of this command's payload within the original packet.
    pub fragment_offset: u32,
    /// Length of this command's payload.
    pub fragment_length: u16,
    /// Number of transmission attempts so far.
    pub send_attempts: u16,
}

impl OutgoingCommand {
    /// Creates a fresh record around a command; sequence numbers and the
    /// queue stamp are assigned by the peer when it enqueues the record.
    pub fn new(command: ProtocolCommand, fragment_offset: u32, fragment_length: u16) -> Self {
        Self {
            command,
            reliable_sequence_number: 0,
            unreliable_sequence_number: 0,
            sent_time: 0,
            round_trip_timeout: 0,
            queue_time: 0,
            fragment_offset,
            fragment_length,
            send_attempts: 0,
        }
    }

    /// True when the command carries payload bytes.
    pub fn has_payload(&self) -> bool {
        self.command.payload().is_some()
    }

    /// True when the command demands acknowledgement.
    pub fn is_reliable(&self) -> bool {
        self.command.header.is_acknowledged()
    }
}

/// Payload storage of a received command.
#[derive(Debug, Clone)]
pub enum IncomingPayload {
    /// Complete payload, ready for delivery.
    Ready(SharedBytes),
    /// Reassembly buffer still waiting for fragments.
    Assembling(Vec<u8>),
}

impl IncomingPayload {
    /// Payload length in bytes (final length for reassembly buffers).
    pub fn len(&self) -> usize {
        match self {
            IncomingPayload::Ready(data) => data.len(),
            IncomingPayload::Assembling(buffer) => buffer.len(),
        }
    }

    /// True when no payload bytes are present.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A command received from the network, possibly awaiting reassembly.
#[derive(Debug, Clone)]
pub struct IncomingCommand {
    /// Reliable sequence number the command arrived under.
    pub reliable_sequence_number: u16,
    /// Unreliable sequence number the command arrived under.
    pub unreliable_sequence_number: u16,
    /// Wire command number.
    pub command_number: u8,
    /// Channel the command arrived on.
    pub channel_id: u8,
    /// Delivery flags for the packet surfaced to the user.
    pub flags: PacketFlags,
    /// Total fragments of the payload; 0 for unfragmented commands.
    pub fragment_count: u32,
    /// Fragments still missing.
    pub fragments_remaining: u32,
    /// Bitmap of received fragment numbers.
    pub fragments: Box<[u32]>,
    /// Payload bytes or reassembly buffer.
    pub payload: IncomingPayload,
}

impl IncomingCommand {
    /// True when the named fragment has already been received.
    pub fn has_fragment(&self, fragment_number: u32) -> bool {
        self.fragments[(fragment_number / 32) as usize] & (1 << (fragment_number % 32)) != 0
    }

    /// Marks the named fragment received.
    pub fn mark_fragment(&mut self, fragment_number: u32) {
        self.fragments[(fragment_number / 32) as usize] |= 1 << (fragment_number % 32);
    }

    /// True once every fragment has arrived.
    pub fn is_complete(&self) -> bool {
        self.fragments_remaining == 0
    }

    /// True for unsequenced commands, which sequencing scans skip over.
    pub fn is_unsequenced(&self) -> bool {
        self.command_number == number::SEND_UNSEQUENCED
    }

    /// Payload length in bytes.
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Consumes the command into a deliverable packet, freezing the
    /// reassembly buffer when the payload was fragmented.
    pub fn into_packet(self) -> Packet {
        let data = match self.payload {
            IncomingPayload::Ready(data) => data,
            IncomingPayload::Assembling(buffer) => SharedBytes::from_vec(buffer),
        };
        Packet::new(data, self.flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relink_protocol::command::{CommandHeader, CommandKind, COMMAND_FLAG_ACKNOWLEDGE};

    #[test]
    fn test_fragment_bitmap() {
        let mut command = IncomingCommand {
            reliable_sequence_number: 1,
            unreliable_sequence_number: 0,
            command_number: number::SEND_FRAGMENT,
            channel_id: 0,
            flags: PacketFlags::RELIABLE,
            fragment_count: 40,
            fragments_remaining: 40,
            fragments: vec![0u32; 2].into_boxed_slice(),
            payload: IncomingPayload::Assembling(vec![0; 100]),
        };

        assert!(!command.has_fragment(0));
        assert!(!command.has_fragment(39));
        command.mark_fragment(39);
        assert!(command.has_fragment(39));
        assert!(!command.has_fragment(7));
    }

    #[test]
    fn test_into_packet_freezes_assembly() {
        let command = IncomingCommand {
            reliable_sequence_number: 1,
            unreliable_sequence_number: 0,
            command_number: number::SEND_FRAGMENT,
            channel_id: 0,
            flags: PacketFlags::RELIABLE,
            fragment_count: 1,
            fragments_remaining: 0,
            fragments: vec![1u32].into_boxed_slice(),
            payload: IncomingPayload::Assembling(vec![9, 9, 9]),
        };
        let packet = command.into_packet();
        assert_eq!(packet.data(), &[9, 9, 9]);
        assert!(packet.flags().contains(PacketFlags::RELIABLE));
    }

    #[test]
    fn test_outgoing_command_classification() {
        let reliable = OutgoingCommand::new(
            ProtocolCommand::new(
                CommandHeader { flags: COMMAND_FLAG_ACKNOWLEDGE, channel_id: 0, reliable_sequence_number: 0 },
                CommandKind::SendReliable { data: vec![1].into() },
            ),
            0,
            1,
        );
        assert!(reliable.is_reliable());
        assert!(reliable.has_payload());

        let ping = OutgoingCommand::new(
            ProtocolCommand::new(
                CommandHeader::control(COMMAND_FLAG_ACKNOWLEDGE),
                CommandKind::Ping,
            ),
            0,
            0,
        );
        assert!(ping.is_reliable());
        assert!(!ping.has_payload());
    }
}
