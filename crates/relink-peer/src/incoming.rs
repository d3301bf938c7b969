//! Receive-side command handling.
//!
//! Each handler validates a decoded command against the peer's state and
//! sequence windows, queues it for delivery (or reassembly), and silently
//! absorbs the transient failures the protocol expects: out-of-window
//! arrivals, duplicates, and replayed unsequenced groups.

use relink_core::{
    constants::{
        MAXIMUM_FRAGMENT_COUNT, MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE,
        PEER_FREE_RELIABLE_WINDOWS, PEER_FREE_UNSEQUENCED_WINDOWS, PEER_UNSEQUENCED_WINDOW_SIZE,
        PEER_WINDOW_SIZE_SCALE,
    },
    error::{ErrorKind, Result},
    shared::SharedBytes,
    time::{time_difference, time_less},
};
use relink_protocol::{
    command::{number, CommandHeader},
    packet::PacketFlags,
};

use crate::{
    command_queue::{IncomingCommand, IncomingPayload},
    peer::Peer,
    peer_state::PeerState,
};

/// Host-level caps the receive path enforces per peer.
#[derive(Debug, Clone, Copy)]
pub struct HostLimits {
    /// Cap on a single packet's payload size.
    pub maximum_packet_size: usize,
    /// Cap on buffered, undelivered incoming data per peer.
    pub maximum_waiting_data: usize,
}

/// Outcome of processing an ACKNOWLEDGE command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckResult {
    /// The acknowledgement was stale or from the future; nothing changed.
    Ignored,
    /// RTT was folded in; carries the retired command's number, if any.
    Retired(Option<u8>),
}

pub(crate) enum Queued {
    /// Queued at this index of the channel queue it belongs to.
    ///
    /// The index is only stable until the next queue mutation; fragment
    /// reassembly consumes it immediately.
    Fresh(usize),
    /// A duplicate; the datagram walk continues without error.
    Duplicate,
}

impl Peer {
    fn receivable(&self, header: &CommandHeader) -> bool {
        (header.channel_id as usize) < self.channels.len()
            && (self.state == PeerState::Connected || self.state == PeerState::DisconnectLater)
    }

    /// Handles a SEND_RELIABLE command.
    pub fn handle_send_reliable(
        &mut self,
        header: &CommandHeader,
        data: &SharedBytes,
        limits: HostLimits,
    ) -> Result<()> {
        if !self.receivable(header) || data.len() > limits.maximum_packet_size {
            return Err(ErrorKind::MalformedCommand);
        }

        self.queue_incoming_command(
            header.channel_id,
            header.reliable_sequence_number,
            0,
            number::SEND_RELIABLE,
            PacketFlags::RELIABLE,
            IncomingPayload::Ready(data.clone()),
            0,
            limits,
        )?;
        Ok(())
    }

    /// Handles a SEND_UNRELIABLE command.
    pub fn handle_send_unreliable(
        &mut self,
        header: &CommandHeader,
        unreliable_sequence_number: u16,
        data: &SharedBytes,
        limits: HostLimits,
    ) -> Result<()> {
        if !self.receivable(header) || data.len() > limits.maximum_packet_size {
            return Err(ErrorKind::MalformedCommand);
        }

        self.queue_incoming_command(
            header.channel_id,
            header.reliable_sequence_number,
            unreliable_sequence_number,
            number::SEND_UNRELIABLE,
            PacketFlags::NONE,
            IncomingPayload::Ready(data.clone()),
            0,
            limits,
        )?;
        Ok(())
    }

    /// Handles a SEND_UNSEQUENCED command, enforcing the replay window.
    pub fn handle_send_unsequenced(
        &mut self,
        header: &CommandHeader,
        unsequenced_group: u16,
        data: &SharedBytes,
        limits: HostLimits,
    ) -> Result<()> {
        if !self.receivable(header) || data.len() > limits.maximum_packet_size {
            return Err(ErrorKind::MalformedCommand);
        }

        let index = (unsequenced_group % PEER_UNSEQUENCED_WINDOW_SIZE as u16) as u32;
        let mut group = unsequenced_group as u32;
        if unsequenced_group < self.incoming_unsequenced_group {
            group += 0x10000;
        }

        if group
            >= self.incoming_unsequenced_group as u32
                + PEER_FREE_UNSEQUENCED_WINDOWS * PEER_UNSEQUENCED_WINDOW_SIZE
        {
            return Ok(());
        }

        let group = (group & 0xFFFF) as u16;

        if group.wrapping_sub(index as u16) != self.incoming_unsequenced_group {
            self.incoming_unsequenced_group = group.wrapping_sub(index as u16);
            self.unsequenced_window = [0; 32];
        } else if self.unsequenced_window[(index / 32) as usize] & (1 << (index % 32)) != 0 {
            return Ok(());
        }

        self.queue_incoming_command(
            header.channel_id,
            0,
            0,
            number::SEND_UNSEQUENCED,
            PacketFlags::UNSEQUENCED,
            IncomingPayload::Ready(data.clone()),
            0,
            limits,
        )?;

        self.unsequenced_window[(index / 32) as usize] |= 1 << (index % 32);
        Ok(())
    }

    /// Handles one fragment of a reliable payload, reassembling in place.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_send_fragment(
        &mut self,
        header: &CommandHeader,
        start_sequence_number: u16,
        fragment_count: u32,
        fragment_number: u32,
        total_length: u32,
        fragment_offset: u32,
        data: &SharedBytes,
        limits: HostLimits,
    ) -> Result<()> {
        if !self.receivable(header) {
            return Err(ErrorKind::MalformedCommand);
        }

        let fragment_length = data.len() as u32;
        if fragment_length == 0 || fragment_length as usize > limits.maximum_packet_size {
            return Err(ErrorKind::MalformedCommand);
        }

        {
            let channel = &self.channels[header.channel_id as usize];
            let start_window = channel.incoming_window_of(start_sequence_number);
            let current_window = channel.current_incoming_window();
            if start_window < current_window
                || start_window >= current_window + PEER_FREE_RELIABLE_WINDOWS - 1
            {
                return Ok(());
            }
        }

        if fragment_count > MAXIMUM_FRAGMENT_COUNT
            || fragment_number >= fragment_count
            || total_length as usize > limits.maximum_packet_size
            || total_length < fragment_count
            || fragment_offset >= total_length
            || fragment_length > total_length - fragment_offset
        {
            return Err(ErrorKind::MalformedCommand);
        }

        let start_index = match self.find_reliable_start_command(
            header.channel_id,
            start_sequence_number,
            total_length,
            fragment_count,
        )? {
            Some(index) => index,
            None => {
                match self.queue_incoming_command(
                    header.channel_id,
                    start_sequence_number,
                    0,
                    number::SEND_FRAGMENT,
                    PacketFlags::RELIABLE,
                    IncomingPayload::Assembling(vec![0; total_length as usize]),
                    fragment_count,
                    limits,
                )? {
                    Queued::Fresh(index) => index,
                    Queued::Duplicate => return Ok(()),
                }
            }
        };

        let complete = {
            let channel = &mut self.channels[header.channel_id as usize];
            let command = &mut channel.incoming_reliable_commands[start_index];
            apply_fragment(command, fragment_number, fragment_offset, data);
            command.is_complete()
        };
        if complete {
            self.dispatch_incoming_reliable_commands(header.channel_id as usize);
        }

        Ok(())
    }

    /// Handles one fragment of an unreliable payload.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_send_unreliable_fragment(
        &mut self,
        header: &CommandHeader,
        start_sequence_number: u16,
        fragment_count: u32,
        fragment_number: u32,
        total_length: u32,
        fragment_offset: u32,
        data: &SharedBytes,
        limits: HostLimits,
    ) -> Result<()> {
        if !self.receivable(header) {
            return Err(ErrorKind::MalformedCommand);
        }

        let fragment_length = data.len() as u32;
        if fragment_length as usize > limits.maximum_packet_size {
            return Err(ErrorKind::MalformedCommand);
        }

        let reliable_sequence_number = header.reliable_sequence_number;
        {
            let channel = &self.channels[header.channel_id as usize];
            let reliable_window = channel.incoming_window_of(reliable_sequence_number);
            let current_window = channel.current_incoming_window();
            if reliable_window < current_window
                || reliable_window >= current_window + PEER_FREE_RELIABLE_WINDOWS - 1
            {
                return Ok(());
            }

            if reliable_sequence_number == channel.incoming_reliable_sequence_number
                && start_sequence_number <= channel.incoming_unreliable_sequence_number
            {
                return Ok(());
            }
        }

        if fragment_count > MAXIMUM_FRAGMENT_COUNT
            || fragment_number >= fragment_count
            || total_length as usize > limits.maximum_packet_size
            || fragment_offset >= total_length
            || fragment_length > total_length - fragment_offset
        {
            return Err(ErrorKind::MalformedCommand);
        }

        let start_index = match self.find_unreliable_start_command(
            header.channel_id,
            reliable_sequence_number,
            start_sequence_number,
            total_length,
            fragment_count,
        )? {
            Some(index) => index,
            None => {
                match self.queue_incoming_command(
                    header.channel_id,
                    reliable_sequence_number,
                    start_sequence_number,
                    number::SEND_UNRELIABLE_FRAGMENT,
                    PacketFlags::UNRELIABLE_FRAGMENT,
                    IncomingPayload::Assembling(vec![0; total_length as usize]),
                    fragment_count,
                    limits,
                )? {
                    Queued::Fresh(index) => index,
                    Queued::Duplicate => return Ok(()),
                }
            }
        };

        let complete = {
            let channel = &mut self.channels[header.channel_id as usize];
            let command = &mut channel.incoming_unreliable_commands[start_index];
            apply_fragment(command, fragment_number, fragment_offset, data);
            command.is_complete()
        };
        if complete {
            self.dispatch_incoming_unreliable_commands(header.channel_id as usize, None);
        }

        Ok(())
    }

    /// Handles a PING command; the acknowledgement is the entire reply.
    pub fn handle_ping(&self) -> Result<()> {
        if self.state == PeerState::Connected || self.state == PeerState::DisconnectLater {
            Ok(())
        } else {
            Err(ErrorKind::MalformedCommand)
        }
    }

    /// Handles a THROTTLE_CONFIGURE command.
    pub fn handle_throttle_configure(
        &mut self,
        interval: u32,
        acceleration: u32,
        deceleration: u32,
    ) -> Result<()> {
        if self.state != PeerState::Connected && self.state != PeerState::DisconnectLater {
            return Err(ErrorKind::MalformedCommand);
        }
        self.throttle.configure(interval, acceleration, deceleration);
        Ok(())
    }

    /// Handles a BANDWIDTH_LIMIT command, re-deriving the window size from
    /// the new advertisement against the host's outgoing bandwidth.
    pub fn handle_bandwidth_limit(
        &mut self,
        incoming_bandwidth: u32,
        outgoing_bandwidth: u32,
        host_outgoing_bandwidth: u32,
    ) -> Result<()> {
        if self.state != PeerState::Connected && self.state != PeerState::DisconnectLater {
            return Err(ErrorKind::MalformedCommand);
        }

        self.incoming_bandwidth = incoming_bandwidth;
        self.outgoing_bandwidth = outgoing_bandwidth;

        let window_size = if self.incoming_bandwidth == 0 && host_outgoing_bandwidth == 0 {
            MAXIMUM_WINDOW_SIZE
        } else if self.incoming_bandwidth == 0 || host_outgoing_bandwidth == 0 {
            (self.incoming_bandwidth.max(host_outgoing_bandwidth) / PEER_WINDOW_SIZE_SCALE)
                * MINIMUM_WINDOW_SIZE
        } else {
            (self.incoming_bandwidth.min(host_outgoing_bandwidth) / PEER_WINDOW_SIZE_SCALE)
                * MINIMUM_WINDOW_SIZE
        };
        self.window_size = window_size.clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE);

        Ok(())
    }

    /// Processes an ACKNOWLEDGE command: stitches the 16-bit echo back to a
    /// full timestamp, folds the RTT sample into the smoothed estimate and
    /// throttle, and retires the acknowledged command.
    pub fn process_acknowledge(
        &mut self,
        channel_id: u8,
        received_reliable_sequence_number: u16,
        received_sent_time: u16,
        service_time: u32,
    ) -> AckResult {
        let mut received_sent_time = received_sent_time as u32 | (service_time & 0xFFFF_0000);
        if (received_sent_time & 0x8000) > (service_time & 0x8000) {
            received_sent_time = received_sent_time.wrapping_sub(0x10000);
        }

        if time_less(service_time, received_sent_time) {
            return AckResult::Ignored;
        }

        let round_trip_time = time_difference(service_time, received_sent_time).max(1);

        if self.last_receive_time > 0 {
            self.throttle.adjust(
                round_trip_time,
                self.last_round_trip_time,
                self.last_round_trip_time_variance,
            );

            self.round_trip_time_variance -= self.round_trip_time_variance / 4;
            if round_trip_time >= self.round_trip_time {
                let diff = round_trip_time - self.round_trip_time;
                self.round_trip_time_variance += diff / 4;
                self.round_trip_time += diff / 8;
            } else {
                let diff = self.round_trip_time - round_trip_time;
                self.round_trip_time_variance += diff / 4;
                self.round_trip_time -= diff / 8;
            }
        } else {
            self.round_trip_time = round_trip_time;
            self.round_trip_time_variance = (round_trip_time + 1) / 2;
        }

        if self.round_trip_time < self.lowest_round_trip_time {
            self.lowest_round_trip_time = self.round_trip_time;
        }
        if self.round_trip_time_variance > self.highest_round_trip_time_variance {
            self.highest_round_trip_time_variance = self.round_trip_time_variance;
        }

        if self.throttle.epoch == 0
            || time_difference(service_time, self.throttle.epoch) >= self.throttle.interval
        {
            self.last_round_trip_time = self.lowest_round_trip_time;
            self.last_round_trip_time_variance = self.highest_round_trip_time_variance.max(1);
            self.lowest_round_trip_time = self.round_trip_time;
            self.highest_round_trip_time_variance = self.round_trip_time_variance;
            self.throttle.epoch = service_time;
        }

        self.last_receive_time = service_time.max(1);
        self.earliest_timeout = 0;

        AckResult::Retired(
            self.remove_sent_reliable_command(received_reliable_sequence_number, channel_id),
        )
    }

    // ===== Queue admission =====

    /// Searches backward for the reassembly slot of a reliable fragment run.
    fn find_reliable_start_command(
        &self,
        channel_id: u8,
        start_sequence_number: u16,
        total_length: u32,
        fragment_count: u32,
    ) -> Result<Option<usize>> {
        let channel = &self.channels[channel_id as usize];
        for (index, incoming) in channel.incoming_reliable_commands.iter().enumerate().rev() {
            if start_sequence_number >= channel.incoming_reliable_sequence_number {
                if incoming.reliable_sequence_number < channel.incoming_reliable_sequence_number {
                    continue;
                }
            } else if incoming.reliable_sequence_number >= channel.incoming_reliable_sequence_number {
                break;
            }

            if incoming.reliable_sequence_number <= start_sequence_number {
                if incoming.reliable_sequence_number < start_sequence_number {
                    break;
                }
                if incoming.command_number != number::SEND_FRAGMENT
                    || total_length as usize != incoming.payload_len()
                    || fragment_count != incoming.fragment_count
                {
                    return Err(ErrorKind::MalformedCommand);
                }
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    /// Searches backward for the reassembly slot of an unreliable fragment run.
    fn find_unreliable_start_command(
        &self,
        channel_id: u8,
        reliable_sequence_number: u16,
        start_sequence_number: u16,
        total_length: u32,
        fragment_count: u32,
    ) -> Result<Option<usize>> {
        let channel = &self.channels[channel_id as usize];
        for (index, incoming) in channel.incoming_unreliable_commands.iter().enumerate().rev() {
            if reliable_sequence_number >= channel.incoming_reliable_sequence_number {
                if incoming.reliable_sequence_number < channel.incoming_reliable_sequence_number {
                    continue;
                }
            } else if incoming.reliable_sequence_number >= channel.incoming_reliable_sequence_number {
                break;
            }

            if incoming.reliable_sequence_number < reliable_sequence_number {
                break;
            }
            if incoming.reliable_sequence_number > reliable_sequence_number {
                continue;
            }

            if incoming.unreliable_sequence_number <= start_sequence_number {
                if incoming.unreliable_sequence_number < start_sequence_number {
                    break;
                }
                if incoming.command_number != number::SEND_UNRELIABLE_FRAGMENT
                    || total_length as usize != incoming.payload_len()
                    || fragment_count != incoming.fragment_count
                {
                    return Err(ErrorKind::MalformedCommand);
                }
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    /// Admits a received command into its channel queue.
    ///
    /// Three exits: queued (with its insertion index), a silently tolerated
    /// duplicate, or an error that aborts the datagram walk. Fragmented
    /// admissions (`fragment_count > 0`) never tolerate duplicates: a
    /// discarded fragment start would strand the rest of its run.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn queue_incoming_command(
        &mut self,
        channel_id: u8,
        reliable_sequence_number: u16,
        unreliable_sequence_number: u16,
        command_number: u8,
        flags: PacketFlags,
        payload: IncomingPayload,
        fragment_count: u32,
        limits: HostLimits,
    ) -> Result<Queued> {
        let discard = |fragment_count: u32| {
            if fragment_count > 0 {
                Err(ErrorKind::MalformedCommand)
            } else {
                Ok(Queued::Duplicate)
            }
        };

        if self.state == PeerState::DisconnectLater {
            return discard(fragment_count);
        }

        if command_number != number::SEND_UNSEQUENCED {
            let channel = &self.channels[channel_id as usize];
            let reliable_window = channel.incoming_window_of(reliable_sequence_number);
            let current_window = channel.current_incoming_window();
            if reliable_window < current_window
                || reliable_window >= current_window + PEER_FREE_RELIABLE_WINDOWS - 1
            {
                return discard(fragment_count);
            }
        }

        let insert_index = match command_number {
            number::SEND_FRAGMENT | number::SEND_RELIABLE => {
                let channel = &self.channels[channel_id as usize];
                if reliable_sequence_number == channel.incoming_reliable_sequence_number {
                    return discard(fragment_count);
                }

                let mut insert_at = 0usize;
                let mut duplicate = false;
                for (index, incoming) in channel.incoming_reliable_commands.iter().enumerate().rev()
                {
                    if reliable_sequence_number >= channel.incoming_reliable_sequence_number {
                        if incoming.reliable_sequence_number
                            < channel.incoming_reliable_sequence_number
                        {
                            continue;
                        }
                    } else if incoming.reliable_sequence_number
                        >= channel.incoming_reliable_sequence_number
                    {
                        insert_at = index + 1;
                        break;
                    }

                    if incoming.reliable_sequence_number <= reliable_sequence_number {
                        if incoming.reliable_sequence_number == reliable_sequence_number {
                            duplicate = true;
                        }
                        insert_at = index + 1;
                        break;
                    }
                }
                if duplicate {
                    return discard(fragment_count);
                }
                insert_at
            }

            number::SEND_UNRELIABLE | number::SEND_UNRELIABLE_FRAGMENT => {
                let channel = &self.channels[channel_id as usize];
                if reliable_sequence_number == channel.incoming_reliable_sequence_number
                    && unreliable_sequence_number <= channel.incoming_unreliable_sequence_number
                {
                    return discard(fragment_count);
                }

                let mut insert_at = 0usize;
                let mut duplicate = false;
                for (index, incoming) in
                    channel.incoming_unreliable_commands.iter().enumerate().rev()
                {
                    if reliable_sequence_number >= channel.incoming_reliable_sequence_number {
                        if incoming.reliable_sequence_number
                            < channel.incoming_reliable_sequence_number
                        {
                            continue;
                        }
                    } else if incoming.reliable_sequence_number
                        >= channel.incoming_reliable_sequence_number
                    {
                        insert_at = index + 1;
                        break;
                    }

                    if incoming.reliable_sequence_number < reliable_sequence_number {
                        insert_at = index + 1;
                        break;
                    }
                    if incoming.reliable_sequence_number > reliable_sequence_number {
                        continue;
                    }

                    if incoming.unreliable_sequence_number <= unreliable_sequence_number {
                        if incoming.unreliable_sequence_number == unreliable_sequence_number {
                            duplicate = true;
                        }
                        insert_at = index + 1;
                        break;
                    }
                }
                if duplicate {
                    return discard(fragment_count);
                }
                insert_at
            }

            number::SEND_UNSEQUENCED => 0,

            _ => return discard(fragment_count),
        };

        if self.total_waiting_data >= limits.maximum_waiting_data {
            tracing::warn!(
                peer = self.incoming_peer_id,
                waiting = self.total_waiting_data,
                "refusing incoming packet: maximum waiting data reached"
            );
            return Err(ErrorKind::MaximumWaitingData);
        }

        let command = IncomingCommand {
            reliable_sequence_number,
            unreliable_sequence_number,
            command_number,
            channel_id,
            flags,
            fragment_count,
            fragments_remaining: fragment_count,
            fragments: vec![0u32; ((fragment_count + 31) / 32) as usize].into_boxed_slice(),
            payload,
        };

        self.total_waiting_data += command.payload_len();

        match command_number {
            number::SEND_FRAGMENT | number::SEND_RELIABLE => {
                self.channels[channel_id as usize]
                    .incoming_reliable_commands
                    .insert(insert_index, command);
                if fragment_count == 0 {
                    self.dispatch_incoming_reliable_commands(channel_id as usize);
                }
            }
            _ => {
                self.channels[channel_id as usize]
                    .incoming_unreliable_commands
                    .insert(insert_index, command);
                if fragment_count == 0 {
                    self.dispatch_incoming_unreliable_commands(channel_id as usize, Some(insert_index));
                }
            }
        }

        Ok(Queued::Fresh(insert_index))
    }
}

/// Copies a fragment into its reassembly buffer and updates the bitmap.
fn apply_fragment(
    command: &mut IncomingCommand,
    fragment_number: u32,
    fragment_offset: u32,
    data: &SharedBytes,
) {
    if command.has_fragment(fragment_number) {
        return;
    }

    command.fragments_remaining -= 1;
    command.mark_fragment(fragment_number);

    if let IncomingPayload::Assembling(buffer) = &mut command.payload {
        let offset = fragment_offset as usize;
        let length = data.len().min(buffer.len().saturating_sub(offset));
        buffer[offset..offset + length].copy_from_slice(&data.as_slice()[..length]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relink_protocol::command::COMMAND_FLAG_ACKNOWLEDGE;

    const LIMITS: HostLimits =
        HostLimits { maximum_packet_size: 32 * 1024 * 1024, maximum_waiting_data: 32 * 1024 * 1024 };

    fn connected_peer() -> Peer {
        let mut peer = Peer::new(0, 1400);
        peer.state = PeerState::Connected;
        peer.setup_channels(2);
        peer
    }

    fn reliable_header(channel_id: u8, sequence: u16) -> CommandHeader {
        CommandHeader {
            flags: COMMAND_FLAG_ACKNOWLEDGE,
            channel_id,
            reliable_sequence_number: sequence,
        }
    }

    #[test]
    fn test_in_order_reliable_delivery() {
        let mut peer = connected_peer();
        for sequence in 1..=3u16 {
            peer.handle_send_reliable(
                &reliable_header(0, sequence),
                &vec![sequence as u8].into(),
                LIMITS,
            )
            .unwrap();
        }

        assert!(peer.needs_dispatch);
        let mut delivered = Vec::new();
        while let Some((channel, packet)) = peer.receive() {
            assert_eq!(channel, 0);
            delivered.push(packet.data()[0]);
        }
        assert_eq!(delivered, vec![1, 2, 3]);
        assert_eq!(peer.total_waiting_data, 0);
    }

    #[test]
    fn test_out_of_order_reliable_held_until_gap_fills() {
        let mut peer = connected_peer();
        peer.handle_send_reliable(&reliable_header(0, 2), &vec![2].into(), LIMITS).unwrap();
        assert!(peer.receive().is_none());

        peer.handle_send_reliable(&reliable_header(0, 1), &vec![1].into(), LIMITS).unwrap();
        let first = peer.receive().unwrap().1;
        let second = peer.receive().unwrap().1;
        assert_eq!(first.data(), &[1]);
        assert_eq!(second.data(), &[2]);
    }

    #[test]
    fn test_duplicate_reliable_is_tolerated() {
        let mut peer = connected_peer();
        peer.handle_send_reliable(&reliable_header(0, 2), &vec![2].into(), LIMITS).unwrap();
        // Same sequence again while still queued: silently dropped.
        peer.handle_send_reliable(&reliable_header(0, 2), &vec![2].into(), LIMITS).unwrap();
        peer.handle_send_reliable(&reliable_header(0, 1), &vec![1].into(), LIMITS).unwrap();

        let mut count = 0;
        while peer.receive().is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn test_already_delivered_reliable_is_tolerated() {
        let mut peer = connected_peer();
        peer.handle_send_reliable(&reliable_header(0, 1), &vec![1].into(), LIMITS).unwrap();
        peer.receive().unwrap();
        // Retransmission of a delivered sequence number.
        peer.handle_send_reliable(&reliable_header(0, 1), &vec![1].into(), LIMITS).unwrap();
        assert!(peer.receive().is_none());
    }

    #[test]
    fn test_channels_are_independent() {
        let mut peer = connected_peer();
        peer.handle_send_reliable(&reliable_header(1, 2), &vec![2].into(), LIMITS).unwrap();
        peer.handle_send_reliable(&reliable_header(0, 1), &vec![1].into(), LIMITS).unwrap();

        let (channel, packet) = peer.receive().unwrap();
        assert_eq!(channel, 0);
        assert_eq!(packet.data(), &[1]);
        // Channel 1 still waits for sequence 1.
        assert!(peer.receive().is_none());
    }

    #[test]
    fn test_rejects_send_on_bad_channel() {
        let mut peer = connected_peer();
        let result = peer.handle_send_reliable(&reliable_header(7, 1), &vec![1].into(), LIMITS);
        assert!(result.is_err());
    }

    #[test]
    fn test_out_of_window_sequence_silently_dropped() {
        let mut peer = connected_peer();
        // Window 8 is outside [current, current + FREE - 1).
        let header = reliable_header(0, 8 * 0x1000 + 1);
        peer.handle_send_reliable(&header, &vec![1].into(), LIMITS).unwrap();
        assert!(peer.receive().is_none());
        assert!(peer.channels[0].incoming_reliable_commands.is_empty());
    }

    #[test]
    fn test_unreliable_ordering_and_stale_drop() {
        let mut peer = connected_peer();
        let header = CommandHeader { flags: 0, channel_id: 0, reliable_sequence_number: 0 };

        // 2 dispatches immediately; 1 then arrives stale and is dropped.
        peer.handle_send_unreliable(&header, 2, &vec![2].into(), LIMITS).unwrap();
        peer.handle_send_unreliable(&header, 1, &vec![1].into(), LIMITS).unwrap();
        peer.handle_send_unreliable(&header, 3, &vec![3].into(), LIMITS).unwrap();

        let mut delivered = Vec::new();
        while let Some((_, packet)) = peer.receive() {
            delivered.push(packet.data()[0]);
        }
        assert_eq!(delivered, vec![2, 3]);

        // A stale unreliable sequence is dropped outright.
        peer.handle_send_unreliable(&header, 2, &vec![2].into(), LIMITS).unwrap();
        assert!(peer.receive().is_none());
    }

    #[test]
    fn test_unsequenced_replay_suppression() {
        let mut peer = connected_peer();
        let header = CommandHeader { flags: 0, channel_id: 0, reliable_sequence_number: 0 };

        for _ in 0..3 {
            peer.handle_send_unsequenced(&header, 5, &vec![5].into(), LIMITS).unwrap();
        }

        let mut count = 0;
        while peer.receive().is_some() {
            count += 1;
        }
        assert_eq!(count, 1);
        // The replay bit stays set.
        assert_ne!(peer.unsequenced_window[0] & (1 << 5), 0);
    }

    #[test]
    fn test_unsequenced_beyond_horizon_dropped() {
        let mut peer = connected_peer();
        let header = CommandHeader { flags: 0, channel_id: 0, reliable_sequence_number: 0 };

        let horizon =
            (PEER_FREE_UNSEQUENCED_WINDOWS * PEER_UNSEQUENCED_WINDOW_SIZE) as u16;
        peer.handle_send_unsequenced(&header, horizon, &vec![1].into(), LIMITS).unwrap();
        assert!(peer.receive().is_none());

        peer.handle_send_unsequenced(&header, horizon - 1, &vec![1].into(), LIMITS).unwrap();
        assert!(peer.receive().is_some());
    }

    #[test]
    fn test_fragment_reassembly_out_of_order() {
        let mut peer = connected_peer();
        let payload: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
        let fragment_length = 1000usize;
        let header = reliable_header(0, 1);

        for &fragment_number in &[2u32, 0, 1] {
            let offset = fragment_number as usize * fragment_length;
            let length = fragment_length.min(payload.len() - offset);
            peer.handle_send_fragment(
                &CommandHeader { reliable_sequence_number: 1 + fragment_number as u16, ..header },
                1,
                3,
                fragment_number,
                payload.len() as u32,
                offset as u32,
                &payload[offset..offset + length].to_vec().into(),
                LIMITS,
            )
            .unwrap();
        }

        let (_, packet) = peer.receive().unwrap();
        assert_eq!(packet.data(), &payload[..]);
        // The fragment run consumed sequence numbers 1..=3.
        assert_eq!(peer.channels[0].incoming_reliable_sequence_number, 3);
    }

    #[test]
    fn test_duplicate_fragment_ignored() {
        let mut peer = connected_peer();
        let header = reliable_header(0, 1);

        peer.handle_send_fragment(&header, 1, 2, 0, 20, 0, &vec![1u8; 10].into(), LIMITS).unwrap();
        peer.handle_send_fragment(&header, 1, 2, 0, 20, 0, &vec![9u8; 10].into(), LIMITS).unwrap();
        assert!(peer.receive().is_none());

        peer.handle_send_fragment(&header, 1, 2, 1, 20, 10, &vec![2u8; 10].into(), LIMITS).unwrap();
        let (_, packet) = peer.receive().unwrap();
        // First arrival wins; the duplicate's bytes were ignored.
        assert_eq!(&packet.data()[..10], &[1u8; 10]);
        assert_eq!(&packet.data()[10..], &[2u8; 10]);
    }

    #[test]
    fn test_fragment_mismatched_totals_rejected() {
        let mut peer = connected_peer();
        let header = reliable_header(0, 1);
        peer.handle_send_fragment(&header, 1, 2, 0, 20, 0, &vec![1u8; 10].into(), LIMITS).unwrap();

        let result =
            peer.handle_send_fragment(&header, 1, 3, 1, 20, 10, &vec![2u8; 10].into(), LIMITS);
        assert!(result.is_err());
    }

    #[test]
    fn test_fragment_count_limit() {
        let mut peer = connected_peer();
        let header = reliable_header(0, 1);

        // At the limit: admitted (validation passes, slot is created).
        peer.handle_send_fragment(
            &header,
            1,
            MAXIMUM_FRAGMENT_COUNT,
            0,
            MAXIMUM_FRAGMENT_COUNT,
            0,
            &vec![0u8].into(),
            LIMITS,
        )
        .unwrap();

        // One past the limit: malformed.
        let result = peer.handle_send_unreliable_fragment(
            &CommandHeader { flags: 0, channel_id: 1, reliable_sequence_number: 0 },
            1,
            MAXIMUM_FRAGMENT_COUNT + 1,
            0,
            MAXIMUM_FRAGMENT_COUNT + 1,
            0,
            &vec![0u8].into(),
            LIMITS,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_waiting_data_cap_refuses_packets() {
        let mut peer = connected_peer();
        let limits = HostLimits { maximum_packet_size: 1 << 20, maximum_waiting_data: 4 };

        peer.handle_send_reliable(&reliable_header(0, 2), &vec![0u8; 4].into(), limits).unwrap();
        // The buffered out-of-order packet saturates the cap.
        let result = peer.handle_send_reliable(&reliable_header(0, 3), &vec![0u8; 4].into(), limits);
        assert_eq!(result.unwrap_err(), ErrorKind::MaximumWaitingData);
    }

    #[test]
    fn test_ack_from_future_ignored() {
        let mut peer = connected_peer();
        let result = peer.process_acknowledge(0xFF, 1, 5000, 1000);
        assert_eq!(result, AckResult::Ignored);
    }

    #[test]
    fn test_ack_rtt_initialization_and_smoothing() {
        let mut peer = connected_peer();
        peer.ping();
        let mut command = peer.outgoing_commands.pop_front().unwrap();
        command.send_attempts = 1;
        command.sent_time = 1000;
        peer.sent_reliable_commands.push_back(command);

        let result = peer.process_acknowledge(0xFF, 1, 1000, 1100);
        assert_eq!(result, AckResult::Retired(Some(number::PING)));
        assert_eq!(peer.round_trip_time, 100);
        assert_eq!(peer.round_trip_time_variance, 50);
        assert_eq!(peer.last_receive_time, 1100);
        assert!(peer.sent_reliable_commands.is_empty());
    }

    #[test]
    fn test_sent_time_stitching_across_wrap() {
        let mut peer = connected_peer();
        // Sent at 0xFFFF (lower half boundary), acked at 0x10010: the
        // high-bit rule reconstructs the earlier timestamp.
        let result = peer.process_acknowledge(0xFF, 9, 0xFFFF, 0x0001_0010);
        // Nothing to retire, but the sample is accepted.
        assert_eq!(result, AckResult::Retired(None));
        assert_eq!(peer.round_trip_time, 17);
    }
}
