//! Command and datagram header serialization.
//!
//! All multi-byte integers are big-endian on the wire. Commands have a fixed
//! 4-byte header followed by a fixed-size record from the size table; payload
//! bearing commands append `data_length` bytes after the record.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};

use relink_core::{error::DecodingErrorKind, shared::SharedBytes};

use crate::command::{
    command_size, number, CommandHeader, CommandKind, ConnectParams, ProtocolCommand,
    COMMAND_HEADER_SIZE, COMMAND_MASK,
};

/// Datagram header flag: the header carries a 16-bit sent time.
pub const HEADER_FLAG_SENT_TIME: u16 = 1 << 15;
/// Datagram header flag: the command region is compressed.
pub const HEADER_FLAG_COMPRESSED: u16 = 1 << 14;
/// All datagram header flag bits.
pub const HEADER_FLAG_MASK: u16 = HEADER_FLAG_SENT_TIME | HEADER_FLAG_COMPRESSED;
/// Mask of the session id bits within the peer id field.
pub const HEADER_SESSION_MASK: u16 = 3 << 12;
/// Shift of the session id bits within the peer id field.
pub const HEADER_SESSION_SHIFT: u16 = 12;

/// Size of the datagram header when a sent time is present.
pub const DATAGRAM_HEADER_SIZE: usize = 4;
/// Size of the datagram header without a sent time.
pub const DATAGRAM_HEADER_SIZE_MINIMUM: usize = 2;

/// Decoded datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramInfo {
    /// Target peer id (low 12 bits of the first word).
    pub peer_id: u16,
    /// Session id carried in bits 12..14.
    pub session_id: u8,
    /// Sent time, present when `HEADER_FLAG_SENT_TIME` is set.
    pub sent_time: Option<u16>,
    /// True when the command region is compressed.
    pub compressed: bool,
    /// Total header size, including the checksum word when configured.
    pub header_size: usize,
}

/// Decodes the datagram header.
///
/// `checksum_present` widens the header by the 4-byte checksum word; the word
/// itself is left for the caller to verify in place.
pub fn decode_header(data: &[u8], checksum_present: bool) -> Result<DatagramInfo, DecodingErrorKind> {
    if data.len() < DATAGRAM_HEADER_SIZE_MINIMUM {
        return Err(DecodingErrorKind::DatagramHeader);
    }

    let word = u16::from_be_bytes([data[0], data[1]]);
    let session_id = ((word & HEADER_SESSION_MASK) >> HEADER_SESSION_SHIFT) as u8;
    let peer_id = word & !(HEADER_FLAG_MASK | HEADER_SESSION_MASK);

    let mut header_size = if word & HEADER_FLAG_SENT_TIME != 0 {
        DATAGRAM_HEADER_SIZE
    } else {
        DATAGRAM_HEADER_SIZE_MINIMUM
    };
    let sent_time = if word & HEADER_FLAG_SENT_TIME != 0 {
        if data.len() < DATAGRAM_HEADER_SIZE {
            return Err(DecodingErrorKind::DatagramHeader);
        }
        Some(u16::from_be_bytes([data[2], data[3]]))
    } else {
        None
    };

    if checksum_present {
        header_size += 4;
        if data.len() < header_size {
            return Err(DecodingErrorKind::DatagramHeader);
        }
    }

    Ok(DatagramInfo {
        peer_id,
        session_id,
        sent_time,
        compressed: word & HEADER_FLAG_COMPRESSED != 0,
        header_size,
    })
}

/// Appends the datagram header to `buffer`.
///
/// `peer_id_and_flags` already carries the flag and session bits.
pub fn encode_header(buffer: &mut Vec<u8>, peer_id_and_flags: u16, sent_time: Option<u16>) {
    buffer.extend_from_slice(&peer_id_and_flags.to_be_bytes());
    if let Some(time) = sent_time {
        buffer.extend_from_slice(&time.to_be_bytes());
    }
}

fn put_u16(buffer: &mut Vec<u8>, value: u16) {
    buffer.extend_from_slice(&value.to_be_bytes());
}

fn put_u32(buffer: &mut Vec<u8>, value: u32) {
    buffer.extend_from_slice(&value.to_be_bytes());
}

fn put_connect_params(buffer: &mut Vec<u8>, params: &ConnectParams) {
    put_u16(buffer, params.outgoing_peer_id);
    buffer.push(params.incoming_session_id);
    buffer.push(params.outgoing_session_id);
    put_u32(buffer, params.mtu);
    put_u32(buffer, params.window_size);
    put_u32(buffer, params.channel_count);
    put_u32(buffer, params.incoming_bandwidth);
    put_u32(buffer, params.outgoing_bandwidth);
    put_u32(buffer, params.packet_throttle_interval);
    put_u32(buffer, params.packet_throttle_acceleration);
    put_u32(buffer, params.packet_throttle_deceleration);
    put_u32(buffer, params.connect_id);
}

/// Appends one command (header, record, payload) to `buffer`.
pub fn encode_command(buffer: &mut Vec<u8>, command: &ProtocolCommand) {
    buffer.push(command.number() | command.header.flags);
    buffer.push(command.header.channel_id);
    put_u16(buffer, command.header.reliable_sequence_number);

    match &command.kind {
        CommandKind::Acknowledge { received_reliable_sequence_number, received_sent_time } => {
            put_u16(buffer, *received_reliable_sequence_number);
            put_u16(buffer, *received_sent_time);
        }
        CommandKind::Connect { params, data } => {
            put_connect_params(buffer, params);
            put_u32(buffer, *data);
        }
        CommandKind::VerifyConnect { params } => {
            put_connect_params(buffer, params);
        }
        CommandKind::Disconnect { data } => {
            put_u32(buffer, *data);
        }
        CommandKind::Ping => {}
        CommandKind::SendReliable { data } => {
            put_u16(buffer, data.len() as u16);
            buffer.extend_from_slice(data.as_slice());
        }
        CommandKind::SendUnreliable { unreliable_sequence_number, data } => {
            put_u16(buffer, *unreliable_sequence_number);
            put_u16(buffer, data.len() as u16);
            buffer.extend_from_slice(data.as_slice());
        }
        CommandKind::SendFragment {
            start_sequence_number,
            fragment_count,
            fragment_number,
            total_length,
            fragment_offset,
            data,
        }
        | CommandKind::SendUnreliableFragment {
            start_sequence_number,
            fragment_count,
            fragment_number,
            total_length,
            fragment_offset,
            data,
        } => {
            put_u16(buffer, *start_sequence_number);
            put_u16(buffer, data.len() as u16);
            put_u32(buffer, *fragment_count);
            put_u32(buffer, *fragment_number);
            put_u32(buffer, *total_length);
            put_u32(buffer, *fragment_offset);
            buffer.extend_from_slice(data.as_slice());
        }
        CommandKind::SendUnsequenced { unsequenced_group, data } => {
            put_u16(buffer, *unsequenced_group);
            put_u16(buffer, data.len() as u16);
            buffer.extend_from_slice(data.as_slice());
        }
        CommandKind::BandwidthLimit { incoming_bandwidth, outgoing_bandwidth } => {
            put_u32(buffer, *incoming_bandwidth);
            put_u32(buffer, *outgoing_bandwidth);
        }
        CommandKind::ThrottleConfigure {
            packet_throttle_interval,
            packet_throttle_acceleration,
            packet_throttle_deceleration,
        } => {
            put_u32(buffer, *packet_throttle_interval);
            put_u32(buffer, *packet_throttle_acceleration);
            put_u32(buffer, *packet_throttle_deceleration);
        }
    }
}

fn read_connect_params(cursor: &mut Cursor<&[u8]>) -> Result<ConnectParams, DecodingErrorKind> {
    let truncated = |_| DecodingErrorKind::CommandTooShort;
    Ok(ConnectParams {
        outgoing_peer_id: cursor.read_u16::<BigEndian>().map_err(truncated)?,
        incoming_session_id: cursor.read_u8().map_err(truncated)?,
        outgoing_session_id: cursor.read_u8().map_err(truncated)?,
        mtu: cursor.read_u32::<BigEndian>().map_err(truncated)?,
        window_size: cursor.read_u32::<BigEndian>().map_err(truncated)?,
        channel_count: cursor.read_u32::<BigEndian>().map_err(truncated)?,
        incoming_bandwidth: cursor.read_u32::<BigEndian>().map_err(truncated)?,
        outgoing_bandwidth: cursor.read_u32::<BigEndian>().map_err(truncated)?,
        packet_throttle_interval: cursor.read_u32::<BigEndian>().map_err(truncated)?,
        packet_throttle_acceleration: cursor.read_u32::<BigEndian>().map_err(truncated)?,
        packet_throttle_deceleration: cursor.read_u32::<BigEndian>().map_err(truncated)?,
        connect_id: cursor.read_u32::<BigEndian>().map_err(truncated)?,
    })
}

/// Decodes one command at `offset`, returning it and the offset just past it
/// (including any payload).
///
/// Validation order follows the receive pipeline: the command header must
/// fit, the command number must be in range, the fixed record must fit, and
/// for payload commands the declared payload must lie within the datagram.
pub fn decode_command(
    data: &[u8],
    offset: usize,
) -> Result<(ProtocolCommand, usize), DecodingErrorKind> {
    if offset + COMMAND_HEADER_SIZE > data.len() {
        return Err(DecodingErrorKind::CommandTooShort);
    }

    let command_byte = data[offset];
    let command_number = command_byte & COMMAND_MASK;
    if command_number == 0 || command_number >= number::COUNT {
        return Err(DecodingErrorKind::CommandNumber);
    }

    let size = command_size(command_number);
    if offset + size > data.len() {
        return Err(DecodingErrorKind::CommandTooShort);
    }

    let header = CommandHeader {
        flags: command_byte & !COMMAND_MASK,
        channel_id: data[offset + 1],
        reliable_sequence_number: u16::from_be_bytes([data[offset + 2], data[offset + 3]]),
    };

    let truncated = |_| DecodingErrorKind::CommandTooShort;
    let record = &data[offset + COMMAND_HEADER_SIZE..offset + size];
    let mut cursor = Cursor::new(record);
    let record_end = offset + size;

    // Payload-bearing commands consume data_length additional bytes.
    let read_payload = |data_length: usize| -> Result<SharedBytes, DecodingErrorKind> {
        if record_end + data_length > data.len() {
            return Err(DecodingErrorKind::PayloadOutOfBounds);
        }
        Ok(SharedBytes::copy_from_slice(&data[record_end..record_end + data_length]))
    };

    let (kind, next) = match command_number {
        number::ACKNOWLEDGE => {
            let received_reliable_sequence_number =
                cursor.read_u16::<BigEndian>().map_err(truncated)?;
            let received_sent_time = cursor.read_u16::<BigEndian>().map_err(truncated)?;
            (
                CommandKind::Acknowledge { received_reliable_sequence_number, received_sent_time },
                record_end,
            )
        }
        number::CONNECT => {
            let params = read_connect_params(&mut cursor)?;
            let data = cursor.read_u32::<BigEndian>().map_err(truncated)?;
            (CommandKind::Connect { params, data }, record_end)
        }
        number::VERIFY_CONNECT => {
            let params = read_connect_params(&mut cursor)?;
            (CommandKind::VerifyConnect { params }, record_end)
        }
        number::DISCONNECT => {
            let data = cursor.read_u32::<BigEndian>().map_err(truncated)?;
            (CommandKind::Disconnect { data }, record_end)
        }
        number::PING => (CommandKind::Ping, record_end),
        number::SEND_RELIABLE => {
            let data_length = cursor.read_u16::<BigEndian>().map_err(truncated)? as usize;
            let payload = read_payload(data_length)?;
            (CommandKind::SendReliable { data: payload }, record_end + data_length)
        }
        number::SEND_UNRELIABLE => {
            let unreliable_sequence_number = cursor.read_u16::<BigEndian>().map_err(truncated)?;
            let data_length = cursor.read_u16::<BigEndian>().map_err(truncated)? as usize;
            let payload = read_payload(data_length)?;
            (
                CommandKind::SendUnreliable { unreliable_sequence_number, data: payload },
                record_end + data_length,
            )
        }
        number::SEND_FRAGMENT | number::SEND_UNRELIABLE_FRAGMENT => {
            let start_sequence_number = cursor.read_u16::<BigEndian>().map_err(truncated)?;
            let data_length = cursor.read_u16::<BigEndian>().map_err(truncated)? as usize;
            let fragment_count = cursor.read_u32::<BigEndian>().map_err(truncated)?;
            let fragment_number = cursor.read_u32::<BigEndian>().map_err(truncated)?;
            let total_length = cursor.read_u32::<BigEndian>().map_err(truncated)?;
            let fragment_offset = cursor.read_u32::<BigEndian>().map_err(truncated)?;
            let payload = read_payload(data_length)?;
            let kind = if command_number == number::SEND_FRAGMENT {
                CommandKind::SendFragment {
                    start_sequence_number,
                    fragment_count,
                    fragment_number,
                    total_length,
                    fragment_offset,
                    data: payload,
                }
            } else {
                CommandKind::SendUnreliableFragment {
                    start_sequence_number,
                    fragment_count,
                    fragment_number,
                    total_length,
                    fragment_offset,
                    data: payload,
                }
            };
            (kind, record_end + data_length)
        }
        number::SEND_UNSEQUENCED => {
            let unsequenced_group = cursor.read_u16::<BigEndian>().map_err(truncated)?;
            let data_length = cursor.read_u16::<BigEndian>().map_err(truncated)? as usize;
            let payload = read_payload(data_length)?;
            (
                CommandKind::SendUnsequenced { unsequenced_group, data: payload },
                record_end + data_length,
            )
        }
        number::BANDWIDTH_LIMIT => {
            let incoming_bandwidth = cursor.read_u32::<BigEndian>().map_err(truncated)?;
            let outgoing_bandwidth = cursor.read_u32::<BigEndian>().map_err(truncated)?;
            (CommandKind::BandwidthLimit { incoming_bandwidth, outgoing_bandwidth }, record_end)
        }
        number::THROTTLE_CONFIGURE => {
            let packet_throttle_interval = cursor.read_u32::<BigEndian>().map_err(truncated)?;
            let packet_throttle_acceleration = cursor.read_u32::<BigEndian>().map_err(truncated)?;
            let packet_throttle_deceleration = cursor.read_u32::<BigEndian>().map_err(truncated)?;
            (
                CommandKind::ThrottleConfigure {
                    packet_throttle_interval,
                    packet_throttle_acceleration,
                    packet_throttle_deceleration,
                },
                record_end,
            )
        }
        _ => return Err(DecodingErrorKind::CommandNumber),
    };

    Ok((ProtocolCommand::new(header, kind), next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{COMMAND_FLAG_ACKNOWLEDGE, COMMAND_FLAG_UNSEQUENCED};

    fn round_trip(command: ProtocolCommand) {
        let mut buffer = Vec::new();
        encode_command(&mut buffer, &command);
        let (decoded, next) = decode_command(&buffer, 0).unwrap();
        assert_eq!(decoded, command);
        assert_eq!(next, buffer.len());
    }

    #[test]
    fn test_round_trip_every_command() {
        let params = ConnectParams {
            outgoing_peer_id: 7,
            incoming_session_id: 2,
            outgoing_session_id: 1,
            mtu: 1400,
            window_size: 32768,
            channel_count: 2,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 56000,
            packet_throttle_interval: 5000,
            packet_throttle_acceleration: 2,
            packet_throttle_deceleration: 2,
            connect_id: 0xDEADBEEF,
        };

        round_trip(ProtocolCommand::new(
            CommandHeader { flags: 0, channel_id: 0xFF, reliable_sequence_number: 42 },
            CommandKind::Acknowledge { received_reliable_sequence_number: 42, received_sent_time: 9991 },
        ));
        round_trip(ProtocolCommand::new(
            CommandHeader::control(COMMAND_FLAG_ACKNOWLEDGE),
            CommandKind::Connect { params, data: 5 },
        ));
        round_trip(ProtocolCommand::new(
            CommandHeader::control(COMMAND_FLAG_ACKNOWLEDGE),
            CommandKind::VerifyConnect { params },
        ));
        round_trip(ProtocolCommand::new(
            CommandHeader::control(COMMAND_FLAG_UNSEQUENCED),
            CommandKind::Disconnect { data: 1 },
        ));
        round_trip(ProtocolCommand::new(CommandHeader::control(COMMAND_FLAG_ACKNOWLEDGE), CommandKind::Ping));
        round_trip(ProtocolCommand::new(
            CommandHeader { flags: COMMAND_FLAG_ACKNOWLEDGE, channel_id: 1, reliable_sequence_number: 3 },
            CommandKind::SendReliable { data: vec![1, 2, 3, 4].into() },
        ));
        round_trip(ProtocolCommand::new(
            CommandHeader { flags: 0, channel_id: 0, reliable_sequence_number: 3 },
            CommandKind::SendUnreliable { unreliable_sequence_number: 9, data: vec![5; 10].into() },
        ));
        round_trip(ProtocolCommand::new(
            CommandHeader { flags: COMMAND_FLAG_ACKNOWLEDGE, channel_id: 0, reliable_sequence_number: 4 },
            CommandKind::SendFragment {
                start_sequence_number: 4,
                fragment_count: 3,
                fragment_number: 1,
                total_length: 3000,
                fragment_offset: 1000,
                data: vec![7; 1000].into(),
            },
        ));
        round_trip(ProtocolCommand::new(
            CommandHeader { flags: COMMAND_FLAG_UNSEQUENCED, channel_id: 0, reliable_sequence_number: 0 },
            CommandKind::SendUnsequenced { unsequenced_group: 77, data: vec![8; 3].into() },
        ));
        round_trip(ProtocolCommand::new(
            CommandHeader::control(COMMAND_FLAG_ACKNOWLEDGE),
            CommandKind::BandwidthLimit { incoming_bandwidth: 1000, outgoing_bandwidth: 2000 },
        ));
        round_trip(ProtocolCommand::new(
            CommandHeader::control(COMMAND_FLAG_ACKNOWLEDGE),
            CommandKind::ThrottleConfigure {
                packet_throttle_interval: 1000,
                packet_throttle_acceleration: 4,
                packet_throttle_deceleration: 8,
            },
        ));
        round_trip(ProtocolCommand::new(
            CommandHeader { flags: 0, channel_id: 2, reliable_sequence_number: 11 },
            CommandKind::SendUnreliableFragment {
                start_sequence_number: 5,
                fragment_count: 2,
                fragment_number: 0,
                total_length: 1200,
                fragment_offset: 0,
                data: vec![9; 600].into(),
            },
        ));
    }

    #[test]
    fn test_commands_concatenate_in_one_region() {
        let mut buffer = Vec::new();
        encode_command(
            &mut buffer,
            &ProtocolCommand::new(CommandHeader::control(COMMAND_FLAG_ACKNOWLEDGE), CommandKind::Ping),
        );
        encode_command(
            &mut buffer,
            &ProtocolCommand::new(
                CommandHeader { flags: COMMAND_FLAG_ACKNOWLEDGE, channel_id: 0, reliable_sequence_number: 1 },
                CommandKind::SendReliable { data: vec![1, 2].into() },
            ),
        );

        let (first, offset) = decode_command(&buffer, 0).unwrap();
        assert_eq!(first.number(), number::PING);
        let (second, end) = decode_command(&buffer, offset).unwrap();
        assert_eq!(second.number(), number::SEND_RELIABLE);
        assert_eq!(end, buffer.len());
    }

    #[test]
    fn test_decode_rejects_bad_command_number() {
        let data = [0x00u8, 0, 0, 0];
        assert_eq!(decode_command(&data, 0), Err(DecodingErrorKind::CommandNumber));
        let data = [0x0Du8, 0, 0, 0];
        assert_eq!(decode_command(&data, 0), Err(DecodingErrorKind::CommandNumber));
    }

    #[test]
    fn test_decode_rejects_truncated_record() {
        let mut buffer = Vec::new();
        encode_command(
            &mut buffer,
            &ProtocolCommand::new(
                CommandHeader::control(COMMAND_FLAG_ACKNOWLEDGE),
                CommandKind::Disconnect { data: 0 },
            ),
        );
        assert_eq!(decode_command(&buffer[..buffer.len() - 1], 0), Err(DecodingErrorKind::CommandTooShort));
    }

    #[test]
    fn test_decode_rejects_payload_past_end() {
        let mut buffer = Vec::new();
        encode_command(
            &mut buffer,
            &ProtocolCommand::new(
                CommandHeader { flags: COMMAND_FLAG_ACKNOWLEDGE, channel_id: 0, reliable_sequence_number: 1 },
                CommandKind::SendReliable { data: vec![1, 2, 3, 4, 5].into() },
            ),
        );
        // Truncate into the payload: declared length now exceeds the buffer.
        assert_eq!(decode_command(&buffer[..buffer.len() - 2], 0), Err(DecodingErrorKind::PayloadOutOfBounds));
    }

    #[test]
    fn test_header_round_trip() {
        let mut buffer = Vec::new();
        let word = 0x123u16 | HEADER_FLAG_SENT_TIME | (2 << HEADER_SESSION_SHIFT);
        encode_header(&mut buffer, word, Some(0xBEEF));
        let info = decode_header(&buffer, false).unwrap();
        assert_eq!(info.peer_id, 0x123);
        assert_eq!(info.session_id, 2);
        assert_eq!(info.sent_time, Some(0xBEEF));
        assert!(!info.compressed);
        assert_eq!(info.header_size, DATAGRAM_HEADER_SIZE);
    }

    #[test]
    fn test_header_without_sent_time() {
        let mut buffer = Vec::new();
        encode_header(&mut buffer, 0x7FF, None);
        let info = decode_header(&buffer, false).unwrap();
        assert_eq!(info.peer_id, 0x7FF);
        assert_eq!(info.sent_time, None);
        assert_eq!(info.header_size, DATAGRAM_HEADER_SIZE_MINIMUM);
    }

    #[test]
    fn test_header_accounts_for_checksum() {
        let mut buffer = Vec::new();
        encode_header(&mut buffer, 5, None);
        buffer.extend_from_slice(&[0, 0, 0, 0]);
        let info = decode_header(&buffer, true).unwrap();
        assert_eq!(info.header_size, DATAGRAM_HEADER_SIZE_MINIMUM + 4);
        // Short of the checksum word the header must be rejected.
        assert!(decode_header(&buffer[..4], true).is_err());
    }
}
