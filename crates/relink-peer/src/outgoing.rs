//! Send-side datagram assembly and retransmission timers.
//!
//! The host drives one [`DatagramBuilder`] per peer per send pass: acks
//! drain first, then expired reliable commands requeue for retransmission,
//! then the outgoing queues fill the remaining MTU budget.

use relink_core::{
    constants::{
        MAXIMUM_PACKET_COMMANDS, PEER_PACKET_THROTTLE_COUNTER, PEER_PACKET_THROTTLE_SCALE,
    },
    time::{time_difference, time_less},
};
use relink_protocol::{
    codec::{encode_command, DATAGRAM_HEADER_SIZE},
    command::{command_size, number, CommandHeader, CommandKind, ProtocolCommand},
};

use crate::peer::Peer;

/// Accumulates the command region of one outgoing datagram.
#[derive(Debug)]
pub struct DatagramBuilder {
    /// Encoded commands.
    pub commands: Vec<u8>,
    /// Commands encoded so far.
    pub command_count: usize,
    /// Datagram size so far, header included.
    pub packet_size: usize,
    /// Set once a reliable command is aboard; the header must carry the
    /// send time so the remote can echo it back.
    pub needs_sent_time: bool,
}

impl DatagramBuilder {
    /// Starts an empty datagram; the header is accounted for up front.
    pub fn new() -> Self {
        Self {
            commands: Vec::new(),
            command_count: 0,
            packet_size: DATAGRAM_HEADER_SIZE,
            needs_sent_time: false,
        }
    }

    /// True when no commands were gathered.
    pub fn is_empty(&self) -> bool {
        self.command_count == 0
    }

    fn has_room(&self, mtu: u32, bytes: usize) -> bool {
        self.command_count < MAXIMUM_PACKET_COMMANDS && mtu as usize - self.packet_size >= bytes
    }

    fn push(&mut self, command: &ProtocolCommand, payload_length: usize) {
        encode_command(&mut self.commands, command);
        self.packet_size += command_size(command.number()) + payload_length;
        self.command_count += 1;
    }
}

impl Default for DatagramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// What a timeout check decided about a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOutcome {
    /// Expired commands (if any) were requeued for retransmission.
    Retransmitting,
    /// The peer exceeded its timeout policy and must be disconnected.
    Disconnect,
}

impl Peer {
    /// Drains the acknowledgement queue into the datagram.
    ///
    /// Returns true when an ack for a DISCONNECT command was emitted; the
    /// host then schedules the zombie transition.
    pub fn emit_acknowledgements(&mut self, frame: &mut DatagramBuilder) -> bool {
        let mut acked_disconnect = false;

        while !self.acknowledgements.is_empty() {
            if !frame.has_room(self.mtu, command_size(number::ACKNOWLEDGE)) {
                self.continue_sending = true;
                break;
            }

            let Some(acknowledgement) = self.acknowledgements.pop_front() else { break };

            let command = ProtocolCommand::new(
                CommandHeader {
                    flags: 0,
                    channel_id: acknowledgement.channel_id,
                    reliable_sequence_number: acknowledgement.reliable_sequence_number,
                },
                CommandKind::Acknowledge {
                    received_reliable_sequence_number: acknowledgement.reliable_sequence_number,
                    received_sent_time: acknowledgement.sent_time,
                },
            );
            frame.push(&command, 0);

            if acknowledgement.command_number == number::DISCONNECT {
                acked_disconnect = true;
            }
        }

        acked_disconnect
    }

    /// Requeues expired reliable commands with doubled timeouts.
    ///
    /// Returns [`TimeoutOutcome::Disconnect`] when the oldest unacked send
    /// is past `timeout_maximum`, or past `timeout_minimum` with the
    /// exponential backoff attempts exhausted.
    pub fn check_timeouts(&mut self, service_time: u32) -> TimeoutOutcome {
        let mut index = 0usize;
        let mut insert_plain = 0usize;
        let mut insert_payload = 0usize;

        while index < self.sent_reliable_commands.len() {
            let command = &self.sent_reliable_commands[index];

            if time_difference(service_time, command.sent_time) < command.round_trip_timeout {
                index += 1;
                continue;
            }

            if self.earliest_timeout == 0 || time_less(command.sent_time, self.earliest_timeout) {
                self.earliest_timeout = command.sent_time;
            }

            if self.earliest_timeout != 0 {
                let quiet = time_difference(service_time, self.earliest_timeout);
                let attempts_exhausted = 1u32
                    .checked_shl(command.send_attempts.saturating_sub(1) as u32)
                    .map(|attempts| attempts >= self.timeout_limit)
                    .unwrap_or(true);
                if quiet >= self.timeout_maximum
                    || (attempts_exhausted && quiet >= self.timeout_minimum)
                {
                    return TimeoutOutcome::Disconnect;
                }
            }

            self.packets_lost += 1;

            let Some(mut command) = self.sent_reliable_commands.remove(index) else { break };
            command.round_trip_timeout = command.round_trip_timeout.saturating_mul(2);

            if command.has_payload() {
                self.reliable_data_in_transit =
                    self.reliable_data_in_transit.saturating_sub(command.fragment_length as u32);
                self.outgoing_send_reliable_commands.insert(insert_payload, command);
                insert_payload += 1;
            } else {
                self.outgoing_commands.insert(insert_plain, command);
                insert_plain += 1;
            }

            if index == 0 {
                if let Some(front) = self.sent_reliable_commands.front() {
                    self.next_timeout = front.sent_time.wrapping_add(front.round_trip_timeout);
                }
            }
        }

        TimeoutOutcome::Retransmitting
    }

    /// Fills the datagram from the outgoing queues, oldest first across
    /// both, honoring window wrap, the throttled send window, and the
    /// MTU/command budgets.
    ///
    /// Returns true when a ping may ride in this datagram (no reliable
    /// command is pending or aboard).
    pub fn emit_commands(&mut self, frame: &mut DatagramBuilder, service_time: u32) -> bool {
        let mut window_wrap = false;
        let mut can_ping = true;
        let mut plain_index = 0usize;
        let mut payload_index = 0usize;

        loop {
            enum Source {
                Plain,
                Payload,
            }

            let source = if plain_index < self.outgoing_commands.len() {
                if payload_index < self.outgoing_send_reliable_commands.len()
                    && time_less(
                        self.outgoing_send_reliable_commands[payload_index].queue_time,
                        self.outgoing_commands[plain_index].queue_time,
                    )
                {
                    Source::Payload
                } else {
                    Source::Plain
                }
            } else if payload_index < self.outgoing_send_reliable_commands.len() {
                Source::Payload
            } else {
                break;
            };

            let command = match source {
                Source::Plain => &self.outgoing_commands[plain_index],
                Source::Payload => &self.outgoing_send_reliable_commands[payload_index],
            };

            let reliable = command.is_reliable();
            let has_payload = command.has_payload();
            let channel_id = command.command.header.channel_id;
            let has_channel = (channel_id as usize) < self.channels.len();
            let reliable_sequence_number = command.reliable_sequence_number;
            let send_attempts = command.send_attempts;
            let fragment_length = command.fragment_length;
            let size = command_size(command.command.number());

            if reliable {
                if has_channel {
                    if window_wrap {
                        match source {
                            Source::Plain => plain_index += 1,
                            Source::Payload => payload_index += 1,
                        }
                        continue;
                    }

                    if send_attempts < 1
                        && reliable_sequence_number % relink_core::constants::PEER_RELIABLE_WINDOW_SIZE == 0
                        && self.reliable_window_blocked(channel_id, reliable_sequence_number)
                    {
                        window_wrap = true;
                        if let Source::Plain = source {
                            plain_index += 1;
                        }
                        payload_index = self.outgoing_send_reliable_commands.len();
                        continue;
                    }
                }

                if has_payload {
                    let window_size =
                        self.throttle.value * self.window_size / PEER_PACKET_THROTTLE_SCALE;
                    if self.reliable_data_in_transit + fragment_length as u32
                        > window_size.max(self.mtu)
                    {
                        // The throttled window is full; stop pulling payloads.
                        if let Source::Plain = source {
                            plain_index += 1;
                        }
                        payload_index = self.outgoing_send_reliable_commands.len();
                        continue;
                    }
                }

                can_ping = false;
            }

            let payload_length = if has_payload { fragment_length as usize } else { 0 };
            if !frame.has_room(self.mtu, size + payload_length) {
                self.continue_sending = true;
                break;
            }

            let removed = match source {
                Source::Plain => self.outgoing_commands.remove(plain_index),
                Source::Payload => self.outgoing_send_reliable_commands.remove(payload_index),
            };
            let Some(mut command) = removed else { break };

            if reliable {
                if has_channel && command.send_attempts < 1 {
                    self.channels[channel_id as usize].occupy_reliable(reliable_sequence_number);
                }

                command.send_attempts += 1;
                if command.round_trip_timeout == 0 {
                    command.round_trip_timeout =
                        self.round_trip_time + 4 * self.round_trip_time_variance;
                }
                if self.sent_reliable_commands.is_empty() {
                    self.next_timeout = service_time.wrapping_add(command.round_trip_timeout);
                }
                command.sent_time = service_time;
                frame.needs_sent_time = true;
                self.reliable_data_in_transit += command.fragment_length as u32;

                frame.push(&command.command, payload_length);
                self.sent_reliable_commands.push_back(command);
            } else {
                if has_payload && command.fragment_offset == 0 {
                    self.throttle.counter += PEER_PACKET_THROTTLE_COUNTER;
                    self.throttle.counter %= PEER_PACKET_THROTTLE_SCALE;

                    if self.throttle.counter > self.throttle.value {
                        // Shed this unreliable send and the rest of its
                        // fragment run.
                        tracing::trace!(
                            peer = self.incoming_peer_id,
                            throttle = self.throttle.value,
                            "throttle shed unreliable send"
                        );
                        let reliable_sequence_number = command.reliable_sequence_number;
                        let unreliable_sequence_number = command.unreliable_sequence_number;
                        drop(command);

                        while plain_index < self.outgoing_commands.len() {
                            let next = &self.outgoing_commands[plain_index];
                            if next.reliable_sequence_number != reliable_sequence_number
                                || next.unreliable_sequence_number != unreliable_sequence_number
                            {
                                break;
                            }
                            self.outgoing_commands.remove(plain_index);
                        }

                        continue;
                    }
                }

                frame.push(&command.command, payload_length);
                if command.has_payload() {
                    self.sent_unreliable_commands.push(command);
                }
            }

            self.packets_sent += 1;
        }

        can_ping
    }

    /// Releases unreliable payloads emitted during the last send pass.
    pub fn remove_sent_unreliable_commands(&mut self) {
        self.sent_unreliable_commands.clear();
    }
}
