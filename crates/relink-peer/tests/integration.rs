//! Integration tests for the relink-peer crate.
//!
//! Two peer engines are wired back to back through the real command codec:
//! frames assembled by one side are decoded and fed to the other side's
//! handlers, with optional datagram loss injected in between. No sockets.

use relink_core::time::time_greater_equal;
use relink_peer::{DatagramBuilder, HostLimits, Peer, PeerState};
use relink_protocol::{
    codec::decode_command,
    command::CommandKind,
    packet::Packet,
};

const LIMITS: HostLimits =
    HostLimits { maximum_packet_size: 32 * 1024 * 1024, maximum_waiting_data: 32 * 1024 * 1024 };

fn connected_pair(channels: usize) -> (Peer, Peer) {
    let mut a = Peer::new(0, 1400);
    a.state = PeerState::Connected;
    a.setup_channels(channels);
    let mut b = Peer::new(1, 1400);
    b.state = PeerState::Connected;
    b.setup_channels(channels);
    (a, b)
}

/// Feeds one frame's commands into the receiving peer.
fn deliver_frame(frame: &DatagramBuilder, to: &mut Peer, time: u32) {
    let data = &frame.commands;
    let mut offset = 0usize;
    while offset < data.len() {
        let (command, next) = decode_command(data, offset).expect("harness frames are well formed");
        offset = next;

        let header = command.header;
        match &command.kind {
            CommandKind::Acknowledge { received_reliable_sequence_number, received_sent_time } => {
                to.process_acknowledge(
                    header.channel_id,
                    *received_reliable_sequence_number,
                    *received_sent_time,
                    time,
                );
            }
            CommandKind::Ping => {
                to.handle_ping().unwrap();
            }
            CommandKind::SendReliable { data } => {
                to.handle_send_reliable(&header, data, LIMITS).unwrap();
            }
            CommandKind::SendUnreliable { unreliable_sequence_number, data } => {
                to.handle_send_unreliable(&header, *unreliable_sequence_number, data, LIMITS)
                    .unwrap();
            }
            CommandKind::SendUnsequenced { unsequenced_group, data } => {
                to.handle_send_unsequenced(&header, *unsequenced_group, data, LIMITS).unwrap();
            }
            CommandKind::SendFragment {
                start_sequence_number,
                fragment_count,
                fragment_number,
                total_length,
                fragment_offset,
                data,
            } => {
                to.handle_send_fragment(
                    &header,
                    *start_sequence_number,
                    *fragment_count,
                    *fragment_number,
                    *total_length,
                    *fragment_offset,
                    data,
                    LIMITS,
                )
                .unwrap();
            }
            CommandKind::SendUnreliableFragment {
                start_sequence_number,
                fragment_count,
                fragment_number,
                total_length,
                fragment_offset,
                data,
            } => {
                to.handle_send_unreliable_fragment(
                    &header,
                    *start_sequence_number,
                    *fragment_count,
                    *fragment_number,
                    *total_length,
                    *fragment_offset,
                    data,
                    LIMITS,
                )
                .unwrap();
            }
            other => panic!("unexpected command in harness: {:?}", other),
        }

        if header.is_acknowledged() {
            to.queue_acknowledgement(&header, command.number(), (time & 0xFFFF) as u16);
        }
    }
}

/// Flushes every pending frame from `from` into `to`; `keep` decides which
/// datagrams survive the wire.
fn transfer(from: &mut Peer, to: &mut Peer, time: u32, keep: &mut dyn FnMut(usize) -> bool) {
    if !from.sent_reliable_commands.is_empty() && time_greater_equal(time, from.next_timeout) {
        from.check_timeouts(time);
    }

    let mut datagram_index = 0usize;
    loop {
        from.continue_sending = false;
        let mut frame = DatagramBuilder::new();
        from.emit_acknowledgements(&mut frame);
        from.emit_commands(&mut frame, time);
        from.remove_sent_unreliable_commands();

        if frame.is_empty() {
            break;
        }
        if keep(datagram_index) {
            deliver_frame(&frame, to, time);
        }
        datagram_index += 1;

        if !from.continue_sending {
            break;
        }
    }
}

/// Runs both directions until quiescent.
fn pump(a: &mut Peer, b: &mut Peer, time: u32) {
    for _ in 0..8 {
        transfer(a, b, time, &mut |_| true);
        transfer(b, a, time, &mut |_| true);
    }
}

fn drain(peer: &mut Peer) -> Vec<Vec<u8>> {
    let mut delivered = Vec::new();
    while let Some((_, packet)) = peer.receive() {
        delivered.push(packet.data().to_vec());
    }
    delivered
}

#[test]
fn test_reliable_delivery_and_retirement() {
    let (mut a, mut b) = connected_pair(1);

    for tag in 0..5u8 {
        a.send(0, Packet::reliable(vec![tag]), LIMITS.maximum_packet_size, false).unwrap();
    }
    pump(&mut a, &mut b, 1000);

    assert_eq!(drain(&mut b), vec![vec![0], vec![1], vec![2], vec![3], vec![4]]);
    // Every command was acknowledged and retired.
    assert!(a.sent_reliable_commands.is_empty());
    assert_eq!(a.reliable_data_in_transit, 0);
    assert_eq!(a.channels[0].reliable_windows[0], 0);
    assert_eq!(a.channels[0].used_reliable_windows, 0);
}

#[test]
fn test_delivery_order_survives_datagram_loss() {
    let (mut a, mut b) = connected_pair(1);

    for tag in 0..4u8 {
        a.send(0, Packet::reliable(vec![tag]), LIMITS.maximum_packet_size, false).unwrap();
    }

    // First transmission vanishes entirely.
    transfer(&mut a, &mut b, 1000, &mut |_| false);
    assert!(drain(&mut b).is_empty());
    assert_eq!(a.sent_reliable_commands.len(), 4);

    // Past the retransmission timeout the commands go out again.
    let retry_time = 1000 + a.sent_reliable_commands[0].round_trip_timeout;
    pump(&mut a, &mut b, retry_time);

    assert_eq!(drain(&mut b), vec![vec![0], vec![1], vec![2], vec![3]]);
    assert!(a.sent_reliable_commands.is_empty());
    assert!(a.packets_lost >= 4);
}

#[test]
fn test_partial_loss_preserves_order() {
    let (mut a, mut b) = connected_pair(1);

    // Large payloads so each command rides its own datagram.
    let payloads: Vec<Vec<u8>> = (0..3u8).map(|tag| vec![tag; 1300]).collect();
    for payload in &payloads {
        a.send(0, Packet::reliable(payload.clone()), LIMITS.maximum_packet_size, false).unwrap();
    }

    // Drop the middle datagram of the first flight.
    transfer(&mut a, &mut b, 1000, &mut |index| index != 1);
    transfer(&mut b, &mut a, 1000, &mut |_| true);

    // Nothing after the gap may be delivered yet.
    assert_eq!(drain(&mut b), vec![payloads[0].clone()]);

    let retry_time = 1000 + a.sent_reliable_commands[0].round_trip_timeout;
    pump(&mut a, &mut b, retry_time);
    assert_eq!(drain(&mut b), vec![payloads[1].clone(), payloads[2].clone()]);
}

#[test]
fn test_fragmented_payload_round_trips() {
    let (mut a, mut b) = connected_pair(1);

    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    a.send(0, Packet::reliable(payload.clone()), LIMITS.maximum_packet_size, false).unwrap();
    assert!(a.outgoing_send_reliable_commands.len() > 1);

    pump(&mut a, &mut b, 1000);

    let delivered = drain(&mut b);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0], payload);
}

#[test]
fn test_fragments_reassemble_despite_loss() {
    let (mut a, mut b) = connected_pair(1);

    let payload: Vec<u8> = (0..6000u32).map(|i| (i % 249) as u8).collect();
    a.send(0, Packet::reliable(payload.clone()), LIMITS.maximum_packet_size, false).unwrap();

    // Every other fragment datagram is lost on the first flight.
    transfer(&mut a, &mut b, 1000, &mut |index| index % 2 == 0);
    transfer(&mut b, &mut a, 1000, &mut |_| true);
    assert!(drain(&mut b).is_empty());

    let retry_time = 1000 + a.sent_reliable_commands[0].round_trip_timeout;
    pump(&mut a, &mut b, retry_time);

    let delivered = drain(&mut b);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0], payload);
}

#[test]
fn test_reliable_sequence_wraps_across_65535() {
    let (mut a, mut b) = connected_pair(1);

    // An established stream sitting just below the wrap point.
    a.channels[0].outgoing_reliable_sequence_number = u16::MAX - 10;
    b.channels[0].incoming_reliable_sequence_number = u16::MAX - 10;

    for tag in 0..40u8 {
        a.send(0, Packet::reliable(vec![tag]), LIMITS.maximum_packet_size, false).unwrap();
    }
    pump(&mut a, &mut b, 1000);

    let delivered = drain(&mut b);
    assert_eq!(delivered.len(), 40);
    for (tag, payload) in delivered.iter().enumerate() {
        assert_eq!(payload, &vec![tag as u8]);
    }
    assert_eq!(b.channels[0].incoming_reliable_sequence_number, 29);
}

#[test]
fn test_unreliable_fragments_drop_as_a_unit_under_throttle() {
    let (mut a, mut b) = connected_pair(1);
    a.throttle.value = 0;

    a.send(0, Packet::unreliable_fragment(vec![9u8; 4000]), LIMITS.maximum_packet_size, false)
        .unwrap();
    pump(&mut a, &mut b, 1000);

    // The whole fragment run was shed by the sender.
    assert!(drain(&mut b).is_empty());
    assert!(a.outgoing_commands.is_empty());
    assert!(b.channels[0].incoming_unreliable_commands.is_empty());
}

#[test]
fn test_unreliable_fragments_reassemble_at_full_throttle() {
    let (mut a, mut b) = connected_pair(1);

    let payload: Vec<u8> = (0..4000u32).map(|i| (i % 247) as u8).collect();
    a.send(0, Packet::unreliable_fragment(payload.clone()), LIMITS.maximum_packet_size, false)
        .unwrap();
    pump(&mut a, &mut b, 1000);

    let delivered = drain(&mut b);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0], payload);
}

#[test]
fn test_unsequenced_replay_is_suppressed_on_the_wire() {
    let (mut a, mut b) = connected_pair(1);

    a.send(0, Packet::unsequenced(vec![5]), LIMITS.maximum_packet_size, false).unwrap();

    // Capture the frame and replay it three times.
    let mut frame = DatagramBuilder::new();
    a.emit_commands(&mut frame, 1000);
    a.remove_sent_unreliable_commands();
    for _ in 0..3 {
        deliver_frame(&frame, &mut b, 1000);
    }

    assert_eq!(drain(&mut b).len(), 1);
}

#[test]
fn test_window_backpressure_until_acks_arrive() {
    let (mut a, mut b) = connected_pair(1);
    // Tight window: one MTU of reliable data in flight at a time.
    a.window_size = 4096;

    let packet_count = 8usize;
    for tag in 0..packet_count as u8 {
        a.send(0, Packet::reliable(vec![tag; 1300]), LIMITS.maximum_packet_size, false).unwrap();
    }

    // One flight without returning acks: the window limits what leaves.
    transfer(&mut a, &mut b, 1000, &mut |_| true);
    let first_flight = packet_count - a.outgoing_send_reliable_commands.len();
    assert!(first_flight < packet_count, "window should hold some payloads back");
    assert!(a.reliable_data_in_transit > 0);

    // With acks flowing everything drains.
    pump(&mut a, &mut b, 1000);
    assert_eq!(drain(&mut b).len(), packet_count);
    assert!(a.outgoing_send_reliable_commands.is_empty());
}

#[test]
fn test_ping_keeps_rtt_statistics_fresh() {
    let (mut a, mut b) = connected_pair(1);

    a.ping();
    let mut frame = DatagramBuilder::new();
    a.emit_commands(&mut frame, 1000);
    deliver_frame(&frame, &mut b, 1000);

    // The ack comes back 40ms later.
    transfer(&mut b, &mut a, 1040, &mut |_| true);

    assert_eq!(a.round_trip_time, 40);
    assert!(a.sent_reliable_commands.is_empty());
    assert_eq!(a.last_receive_time, 1040);
}
