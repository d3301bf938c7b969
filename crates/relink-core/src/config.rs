use crate::constants::{
    DEFAULT_MTU, HOST_DEFAULT_MAXIMUM_PACKET_SIZE, HOST_DEFAULT_MAXIMUM_WAITING_DATA,
    HOST_RECEIVE_BUFFER_SIZE, HOST_SEND_BUFFER_SIZE, MAXIMUM_PEER_ID,
};

/// Configuration options for a host.
#[derive(Clone, Debug)]
pub struct HostConfig {
    /// Number of peer slots to allocate (at most `MAXIMUM_PEER_ID`).
    pub peer_count: usize,
    /// Cap on channels negotiated per connection (0 = protocol maximum).
    pub channel_limit: usize,
    /// Incoming bandwidth limit in bytes/sec (0 = unlimited).
    pub incoming_bandwidth: u32,
    /// Outgoing bandwidth limit in bytes/sec (0 = unlimited).
    pub outgoing_bandwidth: u32,
    /// Maximum connections accepted from a single IP address.
    pub duplicate_peers: usize,
    /// Cap on a single packet's payload size in bytes.
    pub maximum_packet_size: usize,
    /// Cap on buffered, undelivered incoming data per peer in bytes.
    pub maximum_waiting_data: usize,
    /// MTU assumed for new peers before negotiation.
    pub mtu: u32,
    /// Verify a CRC-32 word on every datagram.
    pub use_checksums: bool,
    /// Socket receive buffer size (SO_RCVBUF); None keeps the system default.
    pub socket_receive_buffer_size: Option<usize>,
    /// Socket send buffer size (SO_SNDBUF); None keeps the system default.
    pub socket_send_buffer_size: Option<usize>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            peer_count: 32,
            channel_limit: 0,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            duplicate_peers: MAXIMUM_PEER_ID as usize,
            maximum_packet_size: HOST_DEFAULT_MAXIMUM_PACKET_SIZE,
            maximum_waiting_data: HOST_DEFAULT_MAXIMUM_WAITING_DATA,
            mtu: DEFAULT_MTU,
            use_checksums: false,
            socket_receive_buffer_size: Some(HOST_RECEIVE_BUFFER_SIZE),
            socket_send_buffer_size: Some(HOST_SEND_BUFFER_SIZE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.mtu, DEFAULT_MTU);
        assert_eq!(config.duplicate_peers, MAXIMUM_PEER_ID as usize);
        assert_eq!(config.maximum_packet_size, 32 * 1024 * 1024);
        assert!(!config.use_checksums);
    }
}
