//! Pending acknowledgement records.

/// An acknowledgement waiting to be emitted.
///
/// Snapshot of the command header being acked plus the sent time copied from
/// the triggering datagram header; the sender stitches that 16-bit time back
/// to a full timestamp to measure RTT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledgement {
    /// Low 16 bits of the triggering datagram's sent time.
    pub sent_time: u16,
    /// Channel of the command being acknowledged.
    pub channel_id: u8,
    /// Reliable sequence number of the command being acknowledged.
    pub reliable_sequence_number: u16,
    /// Command number of the command being acknowledged.
    pub command_number: u8,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::number;

    #[test]
    fn test_snapshot_fields() {
        let ack = Acknowledgement {
            sent_time: 0x1234,
            channel_id: 0xFF,
            reliable_sequence_number: 9,
            command_number: number::DISCONNECT,
        };
        assert_eq!(ack.command_number, number::DISCONNECT);
        assert_eq!(ack.reliable_sequence_number, 9);
    }
}
