//! The peer engine: one connection endpoint and all of its state.

use std::collections::VecDeque;
use std::net::SocketAddr;

use relink_core::{
    constants::{
        MAXIMUM_FRAGMENT_COUNT, MAXIMUM_PEER_ID, MAXIMUM_WINDOW_SIZE, PEER_DEFAULT_ROUND_TRIP_TIME,
        PEER_FREE_RELIABLE_WINDOWS, PEER_PING_INTERVAL, PEER_RELIABLE_WINDOWS,
        PEER_TIMEOUT_LIMIT, PEER_TIMEOUT_MAXIMUM, PEER_TIMEOUT_MINIMUM,
    },
    error::{ErrorKind, Result},
    shared::SharedBytes,
};
use relink_protocol::{
    codec::DATAGRAM_HEADER_SIZE,
    command::{
        command_size, number, CommandHeader, CommandKind, ProtocolCommand,
        COMMAND_FLAG_ACKNOWLEDGE, COMMAND_FLAG_UNSEQUENCED,
    },
    packet::{Packet, PacketFlags},
    Acknowledgement, PacketThrottle,
};

use crate::{
    channel::{reliable_window, Channel},
    command_queue::{IncomingCommand, OutgoingCommand},
    peer_state::PeerState,
};

/// One connection endpoint on a host.
///
/// Fields are driven by the host service loop; applications read them
/// through the accessors and mutate only via the host's peer operations.
#[derive(Debug)]
pub struct Peer {
    /// This peer's slot id on the local host.
    pub incoming_peer_id: u16,
    /// The remote side's slot id, learned during the handshake.
    pub outgoing_peer_id: u16,
    /// Session id expected on incoming datagrams.
    pub incoming_session_id: u8,
    /// Session id stamped on outgoing datagrams.
    pub outgoing_session_id: u8,
    /// Random id identifying this connection across both hosts.
    pub connect_id: u32,
    /// Remote address, once known.
    pub address: Option<SocketAddr>,
    /// Lifecycle state.
    pub state: PeerState,
    /// Per-channel ordering contexts; empty while disconnected.
    pub channels: Vec<Channel>,

    /// Negotiated path MTU.
    pub mtu: u32,
    /// Reliable send window in bytes.
    pub window_size: u32,
    /// Remote's advertised incoming bandwidth in bytes/sec.
    pub incoming_bandwidth: u32,
    /// Remote's advertised outgoing bandwidth in bytes/sec.
    pub outgoing_bandwidth: u32,
    /// Marks the bandwidth-throttle round that adjusted this peer's
    /// incoming share.
    pub incoming_bandwidth_throttle_epoch: u32,
    /// Marks the bandwidth-throttle round that adjusted this peer's
    /// outgoing share.
    pub outgoing_bandwidth_throttle_epoch: u32,
    /// Bytes received since the last bandwidth-throttle round.
    pub incoming_data_total: u32,
    /// Bytes queued for send since the last bandwidth-throttle round.
    pub outgoing_data_total: u32,

    /// Service time of the last datagram sent to this peer.
    pub last_send_time: u32,
    /// Service time of the last acknowledge received from this peer.
    pub last_receive_time: u32,
    /// Earliest retransmission deadline among sent reliable commands.
    pub next_timeout: u32,
    /// Sent time of the oldest unacknowledged command, 0 when all acked.
    pub earliest_timeout: u32,
    /// Start of the current packet-loss measurement interval.
    pub packet_loss_epoch: u32,
    /// Commands sent during the current loss interval.
    pub packets_sent: u32,
    /// Retransmissions during the current loss interval.
    pub packets_lost: u32,
    /// Mean packet loss as a ratio scaled by `PEER_PACKET_LOSS_SCALE`.
    pub packet_loss: u32,
    /// Packet loss variance at the same scale.
    pub packet_loss_variance: u32,

    /// Interval between keep-alive pings in milliseconds.
    pub ping_interval: u32,
    /// Retransmission attempts (as a power of two) before timeout.
    pub timeout_limit: u32,
    /// Minimum quiet period before a retransmission-limit timeout.
    pub timeout_minimum: u32,
    /// Quiet period after which the peer times out unconditionally.
    pub timeout_maximum: u32,

    /// Smoothed round trip time in milliseconds.
    pub round_trip_time: u32,
    /// Round trip time variance.
    pub round_trip_time_variance: u32,
    /// Lowest RTT observed in the current throttle epoch.
    pub lowest_round_trip_time: u32,
    /// Highest RTT variance observed in the current throttle epoch.
    pub highest_round_trip_time_variance: u32,
    /// RTT baseline snapshotted from the previous throttle epoch.
    pub last_round_trip_time: u32,
    /// RTT variance baseline from the previous throttle epoch.
    pub last_round_trip_time_variance: u32,

    /// Unreliable-survival throttle.
    pub throttle: PacketThrottle,

    /// Reliable sequence counter for peer-wide control commands (channel 0xFF).
    pub outgoing_reliable_sequence_number: u16,
    /// Base group of the incoming unsequenced replay window.
    pub incoming_unsequenced_group: u16,
    /// Group assigned to the next outgoing unsequenced command, pre-increment.
    pub outgoing_unsequenced_group: u16,
    /// 1024-bit replay bitmap for unsequenced delivery.
    pub unsequenced_window: [u32; 32],

    /// User data from the most recent CONNECT or DISCONNECT command.
    pub event_data: u32,
    /// Bytes buffered in incoming packets not yet delivered.
    pub total_waiting_data: usize,
    /// Payload bytes of sent reliable commands awaiting acknowledgement.
    pub reliable_data_in_transit: u32,
    /// Monotonic stamp source for `OutgoingCommand::queue_time`.
    pub total_queued: u32,

    /// Set when a send pass ran out of room and must run again.
    pub continue_sending: bool,
    /// Set when this peer has events or packets to surface at dispatch.
    pub needs_dispatch: bool,

    /// Acknowledgements waiting to be emitted.
    pub acknowledgements: VecDeque<Acknowledgement>,
    /// Reliable commands sent and awaiting acknowledgement.
    pub sent_reliable_commands: VecDeque<OutgoingCommand>,
    /// Unreliable payload commands emitted during the current send pass.
    pub sent_unreliable_commands: Vec<OutgoingCommand>,
    /// Queued commands without payloads, plus unreliable payload commands.
    pub outgoing_commands: VecDeque<OutgoingCommand>,
    /// Queued reliable commands with payloads.
    pub outgoing_send_reliable_commands: VecDeque<OutgoingCommand>,
    /// Commands ready for delivery to the application.
    pub dispatched_commands: VecDeque<IncomingCommand>,

    /// Host MTU used to reinitialize `mtu` on reset.
    pub default_mtu: u32,
}

impl Peer {
    /// Creates a peer slot. Session ids start at 0xFF ("pick for me") and
    /// survive resets so reconnections rotate sessions.
    pub fn new(incoming_peer_id: u16, default_mtu: u32) -> Self {
        let mut peer = Peer {
            incoming_peer_id,
            outgoing_peer_id: MAXIMUM_PEER_ID,
            incoming_session_id: 0xFF,
            outgoing_session_id: 0xFF,
            connect_id: 0,
            address: None,
            state: PeerState::Disconnected,
            channels: Vec::new(),
            mtu: default_mtu,
            window_size: MAXIMUM_WINDOW_SIZE,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            incoming_bandwidth_throttle_epoch: 0,
            outgoing_bandwidth_throttle_epoch: 0,
            incoming_data_total: 0,
            outgoing_data_total: 0,
            last_send_time: 0,
            last_receive_time: 0,
            next_timeout: 0,
            earliest_timeout: 0,
            packet_loss_epoch: 0,
            packets_sent: 0,
            packets_lost: 0,
            packet_loss: 0,
            packet_loss_variance: 0,
            ping_interval: PEER_PING_INTERVAL,
            timeout_limit: PEER_TIMEOUT_LIMIT,
            timeout_minimum: PEER_TIMEOUT_MINIMUM,
            timeout_maximum: PEER_TIMEOUT_MAXIMUM,
            round_trip_time: PEER_DEFAULT_ROUND_TRIP_TIME,
            round_trip_time_variance: 0,
            lowest_round_trip_time: PEER_DEFAULT_ROUND_TRIP_TIME,
            highest_round_trip_time_variance: 0,
            last_round_trip_time: PEER_DEFAULT_ROUND_TRIP_TIME,
            last_round_trip_time_variance: 0,
            throttle: PacketThrottle::default(),
            outgoing_reliable_sequence_number: 0,
            incoming_unsequenced_group: 0,
            outgoing_unsequenced_group: 0,
            unsequenced_window: [0; 32],
            event_data: 0,
            total_waiting_data: 0,
            reliable_data_in_transit: 0,
            total_queued: 0,
            continue_sending: false,
            needs_dispatch: false,
            acknowledgements: VecDeque::new(),
            sent_reliable_commands: VecDeque::new(),
            sent_unreliable_commands: Vec::new(),
            outgoing_commands: VecDeque::new(),
            outgoing_send_reliable_commands: VecDeque::new(),
            dispatched_commands: VecDeque::new(),
            default_mtu,
        };
        peer.reset();
        peer
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Returns the remote address, once known.
    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    /// Returns the smoothed round trip time in milliseconds.
    pub fn round_trip_time(&self) -> u32 {
        self.round_trip_time
    }

    /// Returns the number of channels negotiated for this connection.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Drops every queue and returns the slot to DISCONNECTED without any
    /// network effect. The sole mechanism for forced teardown.
    pub fn reset(&mut self) {
        self.outgoing_peer_id = MAXIMUM_PEER_ID;
        self.connect_id = 0;
        self.state = PeerState::Disconnected;
        self.incoming_bandwidth = 0;
        self.outgoing_bandwidth = 0;
        self.incoming_bandwidth_throttle_epoch = 0;
        self.outgoing_bandwidth_throttle_epoch = 0;
        self.incoming_data_total = 0;
        self.outgoing_data_total = 0;
        self.last_send_time = 0;
        self.last_receive_time = 0;
        self.next_timeout = 0;
        self.earliest_timeout = 0;
        self.packet_loss_epoch = 0;
        self.packets_sent = 0;
        self.packets_lost = 0;
        self.packet_loss = 0;
        self.packet_loss_variance = 0;
        self.throttle = PacketThrottle::default();
        self.ping_interval = PEER_PING_INTERVAL;
        self.timeout_limit = PEER_TIMEOUT_LIMIT;
        self.timeout_minimum = PEER_TIMEOUT_MINIMUM;
        self.timeout_maximum = PEER_TIMEOUT_MAXIMUM;
        self.last_round_trip_time = PEER_DEFAULT_ROUND_TRIP_TIME;
        self.lowest_round_trip_time = PEER_DEFAULT_ROUND_TRIP_TIME;
        self.last_round_trip_time_variance = 0;
        self.highest_round_trip_time_variance = 0;
        self.round_trip_time = PEER_DEFAULT_ROUND_TRIP_TIME;
        self.round_trip_time_variance = 0;
        self.mtu = self.default_mtu;
        self.reliable_data_in_transit = 0;
        self.outgoing_reliable_sequence_number = 0;
        self.window_size = MAXIMUM_WINDOW_SIZE;
        self.incoming_unsequenced_group = 0;
        self.outgoing_unsequenced_group = 0;
        self.event_data = 0;
        self.total_waiting_data = 0;
        self.continue_sending = false;
        self.unsequenced_window = [0; 32];
        self.reset_queues();
    }

    /// Drops all queues and channels. The host removes the peer from its
    /// dispatch queue before calling this.
    pub fn reset_queues(&mut self) {
        self.needs_dispatch = false;
        self.acknowledgements.clear();
        self.sent_reliable_commands.clear();
        self.sent_unreliable_commands.clear();
        self.outgoing_commands.clear();
        self.outgoing_send_reliable_commands.clear();
        self.dispatched_commands.clear();
        self.channels.clear();
    }

    /// Seeds `count` channels with cleared sequencing state.
    pub fn setup_channels(&mut self, count: usize) {
        self.channels.clear();
        self.channels.resize_with(count, Channel::new);
    }

    /// True while any reliable command is queued or awaiting acknowledgement.
    pub fn has_outgoing_commands(&self) -> bool {
        !self.outgoing_commands.is_empty()
            || !self.outgoing_send_reliable_commands.is_empty()
            || !self.sent_reliable_commands.is_empty()
    }

    // ===== Command queuing =====

    /// Assigns sequence numbers and queue placement to a fresh command.
    pub fn setup_outgoing_command(&mut self, mut outgoing: OutgoingCommand) {
        self.outgoing_data_total +=
            command_size(outgoing.command.number()) as u32 + outgoing.fragment_length as u32;

        if outgoing.command.header.channel_id == 0xFF {
            self.outgoing_reliable_sequence_number = self.outgoing_reliable_sequence_number.wrapping_add(1);
            outgoing.reliable_sequence_number = self.outgoing_reliable_sequence_number;
            outgoing.unreliable_sequence_number = 0;
        } else {
            let channel = &mut self.channels[outgoing.command.header.channel_id as usize];
            if outgoing.command.header.is_acknowledged() {
                channel.outgoing_reliable_sequence_number =
                    channel.outgoing_reliable_sequence_number.wrapping_add(1);
                channel.outgoing_unreliable_sequence_number = 0;
                outgoing.reliable_sequence_number = channel.outgoing_reliable_sequence_number;
                outgoing.unreliable_sequence_number = 0;
            } else if outgoing.command.header.is_unsequenced() {
                self.outgoing_unsequenced_group = self.outgoing_unsequenced_group.wrapping_add(1);
                outgoing.reliable_sequence_number = 0;
                outgoing.unreliable_sequence_number = 0;
            } else {
                if outgoing.fragment_offset == 0 {
                    channel.outgoing_unreliable_sequence_number =
                        channel.outgoing_unreliable_sequence_number.wrapping_add(1);
                }
                outgoing.reliable_sequence_number = channel.outgoing_reliable_sequence_number;
                outgoing.unreliable_sequence_number = channel.outgoing_unreliable_sequence_number;
            }
        }

        outgoing.send_attempts = 0;
        outgoing.sent_time = 0;
        outgoing.round_trip_timeout = 0;
        outgoing.command.header.reliable_sequence_number = outgoing.reliable_sequence_number;
        self.total_queued = self.total_queued.wrapping_add(1);
        outgoing.queue_time = self.total_queued;

        match &mut outgoing.command.kind {
            CommandKind::SendUnreliable { unreliable_sequence_number, .. } => {
                *unreliable_sequence_number = outgoing.unreliable_sequence_number;
            }
            CommandKind::SendUnsequenced { unsequenced_group, .. } => {
                *unsequenced_group = self.outgoing_unsequenced_group;
            }
            _ => {}
        }

        if outgoing.command.header.is_acknowledged() && outgoing.has_payload() {
            self.outgoing_send_reliable_commands.push_back(outgoing);
        } else {
            self.outgoing_commands.push_back(outgoing);
        }
    }

    /// Queues a command for transmission.
    pub fn queue_outgoing_command(
        &mut self,
        command: ProtocolCommand,
        fragment_offset: u32,
        fragment_length: u16,
    ) {
        self.setup_outgoing_command(OutgoingCommand::new(command, fragment_offset, fragment_length));
    }

    /// Queues an acknowledgement for a received command.
    ///
    /// Returns false when the command's sequence number sits in the band
    /// just outside the free window horizon, where acking would let the
    /// sender wrap into still-occupied windows.
    pub fn queue_acknowledgement(
        &mut self,
        header: &CommandHeader,
        command_number: u8,
        sent_time: u16,
    ) -> bool {
        if (header.channel_id as usize) < self.channels.len() {
            let channel = &self.channels[header.channel_id as usize];
            let reliable_window = channel.incoming_window_of(header.reliable_sequence_number);
            let current_window = channel.current_incoming_window();

            if reliable_window >= current_window + PEER_FREE_RELIABLE_WINDOWS - 1
                && reliable_window <= current_window + PEER_FREE_RELIABLE_WINDOWS
            {
                return false;
            }
        }

        self.outgoing_data_total += command_size(number::ACKNOWLEDGE) as u32;

        self.acknowledgements.push_back(Acknowledgement {
            sent_time,
            channel_id: header.channel_id,
            reliable_sequence_number: header.reliable_sequence_number,
            command_number,
        });

        true
    }

    // ===== Sending =====

    /// Queues a packet for delivery on a channel, fragmenting when the
    /// payload exceeds what one datagram can carry.
    pub fn send(
        &mut self,
        channel_id: u8,
        packet: Packet,
        maximum_packet_size: usize,
        checksum_enabled: bool,
    ) -> Result<()> {
        if self.state != PeerState::Connected {
            return Err(ErrorKind::PeerNotConnected);
        }
        if channel_id as usize >= self.channels.len() {
            return Err(ErrorKind::InvalidChannel);
        }
        if packet.len() > maximum_packet_size {
            return Err(ErrorKind::PacketTooLarge);
        }

        let mut fragment_length = self.mtu as usize
            - DATAGRAM_HEADER_SIZE
            - command_size(number::SEND_FRAGMENT)
            - if checksum_enabled { 4 } else { 0 };

        if packet.len() > fragment_length {
            return self.send_fragments(channel_id, packet, fragment_length);
        }

        fragment_length = packet.len();
        let flags = packet.flags();
        let data = packet.into_shared();

        let command = if flags.contains(PacketFlags::UNSEQUENCED) && !flags.contains(PacketFlags::RELIABLE)
        {
            ProtocolCommand::new(
                CommandHeader::channel(channel_id, COMMAND_FLAG_UNSEQUENCED),
                CommandKind::SendUnsequenced { unsequenced_group: 0, data },
            )
        } else if flags.contains(PacketFlags::RELIABLE)
            || self.channels[channel_id as usize].outgoing_unreliable_sequence_number >= 0xFFFF
        {
            ProtocolCommand::new(
                CommandHeader::channel(channel_id, COMMAND_FLAG_ACKNOWLEDGE),
                CommandKind::SendReliable { data },
            )
        } else {
            ProtocolCommand::new(
                CommandHeader::channel(channel_id, 0),
                CommandKind::SendUnreliable { unreliable_sequence_number: 0, data },
            )
        };

        self.queue_outgoing_command(command, 0, fragment_length as u16);
        Ok(())
    }

    fn send_fragments(&mut self, channel_id: u8, packet: Packet, fragment_length: usize) -> Result<()> {
        let fragment_count = (packet.len() + fragment_length - 1) / fragment_length;
        if fragment_count as u32 > MAXIMUM_FRAGMENT_COUNT {
            return Err(ErrorKind::TooManyFragments);
        }

        let flags = packet.flags();
        let channel = &self.channels[channel_id as usize];
        let unreliable = flags.contains(PacketFlags::UNRELIABLE_FRAGMENT)
            && !flags.contains(PacketFlags::RELIABLE)
            && channel.outgoing_unreliable_sequence_number < 0xFFFF;
        let (command_flags, start_sequence_number) = if unreliable {
            (0, channel.outgoing_unreliable_sequence_number.wrapping_add(1))
        } else {
            (COMMAND_FLAG_ACKNOWLEDGE, channel.outgoing_reliable_sequence_number.wrapping_add(1))
        };

        let data: SharedBytes = packet.into_shared();
        let total_length = data.len() as u32;

        let mut fragment_number = 0u32;
        let mut fragment_offset = 0usize;
        while fragment_offset < data.len() {
            let length = fragment_length.min(data.len() - fragment_offset);
            let slice = data.slice(fragment_offset, length);

            let kind = if unreliable {
                CommandKind::SendUnreliableFragment {
                    start_sequence_number,
                    fragment_count: fragment_count as u32,
                    fragment_number,
                    total_length,
                    fragment_offset: fragment_offset as u32,
                    data: slice,
                }
            } else {
                CommandKind::SendFragment {
                    start_sequence_number,
                    fragment_count: fragment_count as u32,
                    fragment_number,
                    total_length,
                    fragment_offset: fragment_offset as u32,
                    data: slice,
                }
            };

            self.queue_outgoing_command(
                ProtocolCommand::new(CommandHeader::channel(channel_id, command_flags), kind),
                fragment_offset as u32,
                length as u16,
            );

            fragment_number += 1;
            fragment_offset += length;
        }

        Ok(())
    }

    /// Queues a keep-alive ping on the control channel.
    pub fn ping(&mut self) {
        if self.state != PeerState::Connected {
            return;
        }
        self.queue_outgoing_command(
            ProtocolCommand::new(CommandHeader::control(COMMAND_FLAG_ACKNOWLEDGE), CommandKind::Ping),
            0,
            0,
        );
    }

    /// Sets the keep-alive interval; 0 restores the default.
    pub fn set_ping_interval(&mut self, ping_interval: u32) {
        self.ping_interval = if ping_interval != 0 { ping_interval } else { PEER_PING_INTERVAL };
    }

    /// Sets timeout parameters; 0 restores the respective default.
    pub fn set_timeout(&mut self, limit: u32, minimum: u32, maximum: u32) {
        self.timeout_limit = if limit != 0 { limit } else { PEER_TIMEOUT_LIMIT };
        self.timeout_minimum = if minimum != 0 { minimum } else { PEER_TIMEOUT_MINIMUM };
        self.timeout_maximum = if maximum != 0 { maximum } else { PEER_TIMEOUT_MAXIMUM };
    }

    /// Reconfigures the throttle and advertises the change to the remote.
    pub fn throttle_configure(&mut self, interval: u32, acceleration: u32, deceleration: u32) {
        self.throttle.configure(interval, acceleration, deceleration);

        self.queue_outgoing_command(
            ProtocolCommand::new(
                CommandHeader::control(COMMAND_FLAG_ACKNOWLEDGE),
                CommandKind::ThrottleConfigure {
                    packet_throttle_interval: interval,
                    packet_throttle_acceleration: acceleration,
                    packet_throttle_deceleration: deceleration,
                },
            ),
            0,
            0,
        );
    }

    /// Queues a DISCONNECT command carrying `data` with the given flags.
    pub fn queue_disconnect_command(&mut self, data: u32, flags: u8) {
        self.queue_outgoing_command(
            ProtocolCommand::new(CommandHeader::control(flags), CommandKind::Disconnect { data }),
            0,
            0,
        );
    }

    // ===== Delivery =====

    /// Takes the next delivered packet, if any.
    pub fn receive(&mut self) -> Option<(u8, Packet)> {
        let command = self.dispatched_commands.pop_front()?;
        self.total_waiting_data -= command.payload_len().min(self.total_waiting_data);
        Some((command.channel_id, command.into_packet()))
    }

    // ===== Window bookkeeping =====

    /// Retires a sent reliable command by sequence number and channel,
    /// searching the sent queue first and the outgoing queues after.
    ///
    /// Returns the retired command's number, or None when nothing matched.
    pub fn remove_sent_reliable_command(
        &mut self,
        reliable_sequence_number: u16,
        channel_id: u8,
    ) -> Option<u8> {
        let mut was_sent = true;

        let position = self
            .sent_reliable_commands
            .iter()
            .position(|command| {
                command.reliable_sequence_number == reliable_sequence_number
                    && command.command.header.channel_id == channel_id
            });

        let outgoing = match position.and_then(|index| self.sent_reliable_commands.remove(index)) {
            Some(command) => command,
            None => {
                was_sent = false;
                match Self::take_unsent_reliable(
                    &mut self.outgoing_commands,
                    reliable_sequence_number,
                    channel_id,
                )
                .or_else(|| {
                    Self::take_unsent_reliable(
                        &mut self.outgoing_send_reliable_commands,
                        reliable_sequence_number,
                        channel_id,
                    )
                }) {
                    Some(command) => command,
                    None => return None,
                }
            }
        };

        if (channel_id as usize) < self.channels.len() {
            self.channels[channel_id as usize].retire_reliable(reliable_sequence_number);
        }

        let command_number = outgoing.command.number();

        if outgoing.has_payload() && was_sent {
            self.reliable_data_in_transit =
                self.reliable_data_in_transit.saturating_sub(outgoing.fragment_length as u32);
        }

        if let Some(front) = self.sent_reliable_commands.front() {
            self.next_timeout = front.sent_time.wrapping_add(front.round_trip_timeout);
        }

        Some(command_number)
    }

    /// Finds an acked reliable command that never left the outgoing queue
    /// (a retransmit raced its own earlier acknowledgement).
    fn take_unsent_reliable(
        queue: &mut VecDeque<OutgoingCommand>,
        reliable_sequence_number: u16,
        channel_id: u8,
    ) -> Option<OutgoingCommand> {
        for (index, command) in queue.iter().enumerate() {
            if !command.is_reliable() {
                continue;
            }
            if command.send_attempts < 1 {
                return None;
            }
            if command.reliable_sequence_number == reliable_sequence_number
                && command.command.header.channel_id == channel_id
            {
                return queue.remove(index);
            }
        }
        None
    }

    /// True when the channel's sending side would wrap into an occupied
    /// reliable window if this fresh sequence number were transmitted.
    pub(crate) fn reliable_window_blocked(&self, channel_id: u8, sequence_number: u16) -> bool {
        let channel = &self.channels[channel_id as usize];
        let window = reliable_window(sequence_number);
        let preceding =
            ((window + PEER_RELIABLE_WINDOWS - 1) % PEER_RELIABLE_WINDOWS) as usize;
        if channel.reliable_windows[preceding] >= relink_core::constants::PEER_RELIABLE_WINDOW_SIZE {
            return true;
        }
        let span = (1u32 << (PEER_FREE_RELIABLE_WINDOWS + 2)) - 1;
        let mask =
            ((span << window) | (span >> (PEER_RELIABLE_WINDOWS - window))) as u16;
        channel.used_reliable_windows & mask != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected_peer(channels: usize) -> Peer {
        let mut peer = Peer::new(0, 1400);
        peer.state = PeerState::Connected;
        peer.setup_channels(channels);
        peer
    }

    #[test]
    fn test_send_rejects_when_not_connected() {
        let mut peer = Peer::new(0, 1400);
        let result = peer.send(0, Packet::reliable(vec![1]), 32 * 1024 * 1024, false);
        assert_eq!(result.unwrap_err(), ErrorKind::PeerNotConnected);
    }

    #[test]
    fn test_send_rejects_bad_channel() {
        let mut peer = connected_peer(1);
        let result = peer.send(3, Packet::reliable(vec![1]), 32 * 1024 * 1024, false);
        assert_eq!(result.unwrap_err(), ErrorKind::InvalidChannel);
    }

    #[test]
    fn test_send_rejects_oversized_packet() {
        let mut peer = connected_peer(1);
        let result = peer.send(0, Packet::reliable(vec![0; 100]), 50, false);
        assert_eq!(result.unwrap_err(), ErrorKind::PacketTooLarge);
    }

    #[test]
    fn test_reliable_send_assigns_channel_sequence() {
        let mut peer = connected_peer(2);
        peer.send(1, Packet::reliable(vec![1, 2]), 1 << 20, false).unwrap();
        peer.send(1, Packet::reliable(vec![3]), 1 << 20, false).unwrap();

        assert_eq!(peer.outgoing_send_reliable_commands.len(), 2);
        assert_eq!(peer.outgoing_send_reliable_commands[0].reliable_sequence_number, 1);
        assert_eq!(peer.outgoing_send_reliable_commands[1].reliable_sequence_number, 2);
        assert_eq!(peer.channels[1].outgoing_reliable_sequence_number, 2);
        // Channel 0 untouched.
        assert_eq!(peer.channels[0].outgoing_reliable_sequence_number, 0);
    }

    #[test]
    fn test_unreliable_send_goes_to_plain_queue() {
        let mut peer = connected_peer(1);
        peer.send(0, Packet::unreliable(vec![1, 2]), 1 << 20, false).unwrap();
        assert!(peer.outgoing_send_reliable_commands.is_empty());
        assert_eq!(peer.outgoing_commands.len(), 1);
        assert_eq!(peer.outgoing_commands[0].unreliable_sequence_number, 1);
    }

    #[test]
    fn test_unsequenced_send_advances_group() {
        let mut peer = connected_peer(1);
        peer.send(0, Packet::unsequenced(vec![1]), 1 << 20, false).unwrap();
        peer.send(0, Packet::unsequenced(vec![2]), 1 << 20, false).unwrap();
        assert_eq!(peer.outgoing_unsequenced_group, 2);
        match &peer.outgoing_commands[1].command.kind {
            CommandKind::SendUnsequenced { unsequenced_group, .. } => assert_eq!(*unsequenced_group, 2),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_large_reliable_payload_fragments() {
        let mut peer = connected_peer(1);
        let payload = vec![7u8; 4000];
        peer.send(0, Packet::reliable(payload.clone()), 1 << 20, false).unwrap();

        let fragments = &peer.outgoing_send_reliable_commands;
        assert!(fragments.len() > 1);
        let mut reassembled = vec![0u8; 4000];
        for fragment in fragments {
            match &fragment.command.kind {
                CommandKind::SendFragment { fragment_offset, data, start_sequence_number, .. } => {
                    assert_eq!(*start_sequence_number, 1);
                    let offset = *fragment_offset as usize;
                    reassembled[offset..offset + data.len()].copy_from_slice(data.as_slice());
                }
                other => panic!("unexpected command {:?}", other),
            }
        }
        assert_eq!(reassembled, payload);
        // Every fragment took its own reliable sequence number.
        assert_eq!(
            peer.channels[0].outgoing_reliable_sequence_number as usize,
            fragments.len()
        );
    }

    #[test]
    fn test_unreliable_fragment_run_shares_sequence() {
        let mut peer = connected_peer(1);
        peer.send(0, Packet::unreliable_fragment(vec![1u8; 4000]), 1 << 20, false).unwrap();

        assert!(peer.outgoing_send_reliable_commands.is_empty());
        assert!(peer.outgoing_commands.len() > 1);
        for command in &peer.outgoing_commands {
            assert_eq!(command.unreliable_sequence_number, 1);
            assert!(matches!(command.command.kind, CommandKind::SendUnreliableFragment { .. }));
        }
    }

    #[test]
    fn test_control_commands_use_peer_wide_sequence() {
        let mut peer = connected_peer(1);
        peer.ping();
        peer.ping();
        assert_eq!(peer.outgoing_reliable_sequence_number, 2);
        assert_eq!(peer.outgoing_commands.len(), 2);
        assert_eq!(peer.outgoing_commands[1].reliable_sequence_number, 2);
    }

    #[test]
    fn test_ack_admission_rejects_horizon_band() {
        let mut peer = connected_peer(1);
        let header = CommandHeader {
            flags: COMMAND_FLAG_ACKNOWLEDGE,
            channel_id: 0,
            // Window 7 = current window + FREE_RELIABLE_WINDOWS - 1.
            reliable_sequence_number: 7 * 0x1000,
        };
        assert!(!peer.queue_acknowledgement(&header, number::SEND_RELIABLE, 0));

        let inside = CommandHeader { reliable_sequence_number: 0x1000, ..header };
        assert!(peer.queue_acknowledgement(&inside, number::SEND_RELIABLE, 0));
        assert_eq!(peer.acknowledgements.len(), 1);
    }

    #[test]
    fn test_remove_sent_reliable_updates_window() {
        let mut peer = connected_peer(1);
        peer.send(0, Packet::reliable(vec![1]), 1 << 20, false).unwrap();

        // Simulate a transmission.
        let mut command = peer.outgoing_send_reliable_commands.pop_front().unwrap();
        command.send_attempts = 1;
        peer.channels[0].occupy_reliable(command.reliable_sequence_number);
        peer.reliable_data_in_transit += command.fragment_length as u32;
        peer.sent_reliable_commands.push_back(command);

        let retired = peer.remove_sent_reliable_command(1, 0);
        assert_eq!(retired, Some(number::SEND_RELIABLE));
        assert_eq!(peer.reliable_data_in_transit, 0);
        assert_eq!(peer.channels[0].reliable_windows[0], 0);
        assert_eq!(peer.remove_sent_reliable_command(1, 0), None);
    }

    #[test]
    fn test_reset_clears_connection_state_but_keeps_sessions() {
        let mut peer = connected_peer(1);
        peer.incoming_session_id = 2;
        peer.outgoing_session_id = 3;
        peer.send(0, Packet::reliable(vec![1]), 1 << 20, false).unwrap();

        peer.reset();
        assert_eq!(peer.state, PeerState::Disconnected);
        assert!(peer.channels.is_empty());
        assert!(!peer.has_outgoing_commands());
        assert_eq!(peer.incoming_session_id, 2);
        assert_eq!(peer.outgoing_session_id, 3);
        assert_eq!(peer.outgoing_peer_id, MAXIMUM_PEER_ID);
    }
}
