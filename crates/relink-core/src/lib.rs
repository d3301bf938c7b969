#![warn(missing_docs)]

//! relink-core: foundational types and utilities.
//!
//! This crate provides the minimal set of core utilities shared across all layers:
//! - Protocol constants
//! - Configuration types
//! - Error handling
//! - Wrapping millisecond time arithmetic and the `Clock` trait
//! - Shared, reference-counted byte buffers
//! - Adapter traits (socket, compressor, checksum, interceptor)
//!
//! Protocol-specific logic lives in the specialized crates:
//! - `relink-protocol`: command types, wire codec, channels, throttle arithmetic
//! - `relink-peer`: per-connection protocol engine
//! - `relink-host`: host service loop and UDP transport

/// Protocol constants shared across layers.
pub mod constants {
    /// Smallest MTU a peer may negotiate.
    pub const MINIMUM_MTU: u32 = 576;
    /// Largest MTU a peer may negotiate.
    pub const MAXIMUM_MTU: u32 = 4096;
    /// Default MTU assumed until negotiation says otherwise.
    pub const DEFAULT_MTU: u32 = 1400;
    /// Most commands a single datagram may carry.
    pub const MAXIMUM_PACKET_COMMANDS: usize = 32;
    /// Smallest reliable send window in bytes.
    pub const MINIMUM_WINDOW_SIZE: u32 = 4096;
    /// Largest reliable send window in bytes.
    pub const MAXIMUM_WINDOW_SIZE: u32 = 65536;
    /// A connection always carries at least this many channels.
    pub const MINIMUM_CHANNEL_COUNT: usize = 1;
    /// A connection never carries more than this many channels.
    pub const MAXIMUM_CHANNEL_COUNT: usize = 255;
    /// Peer id meaning "no peer assigned"; also the peer table size limit.
    pub const MAXIMUM_PEER_ID: u16 = 0xFFF;
    /// Most fragments a single packet may split into.
    pub const MAXIMUM_FRAGMENT_COUNT: u32 = 1 << 20;

    /// Scale of the packet throttle; a throttle of this value drops nothing.
    pub const PEER_PACKET_THROTTLE_SCALE: u32 = 32;
    /// Throttle counter step applied per unreliable payload command.
    pub const PEER_PACKET_THROTTLE_COUNTER: u32 = 7;
    /// Throttle value a freshly reset peer starts with.
    pub const PEER_DEFAULT_PACKET_THROTTLE: u32 = 32;
    /// Default throttle acceleration.
    pub const PEER_PACKET_THROTTLE_ACCELERATION: u32 = 2;
    /// Default throttle deceleration.
    pub const PEER_PACKET_THROTTLE_DECELERATION: u32 = 2;
    /// Default throttle measurement epoch in milliseconds.
    pub const PEER_PACKET_THROTTLE_INTERVAL: u32 = 5000;
    /// Fixed-point scale of the packet loss ratio.
    pub const PEER_PACKET_LOSS_SCALE: u32 = 1 << 16;
    /// Packet loss statistics update interval in milliseconds.
    pub const PEER_PACKET_LOSS_INTERVAL: u32 = 10_000;
    /// Divisor applied to bandwidth when deriving a window size.
    pub const PEER_WINDOW_SIZE_SCALE: u32 = 64 * 1024;
    /// Default RTT assumed before the first measurement, in milliseconds.
    pub const PEER_DEFAULT_ROUND_TRIP_TIME: u32 = 500;
    /// Default interval between keep-alive pings in milliseconds.
    pub const PEER_PING_INTERVAL: u32 = 500;
    /// Retransmission attempts (as a power of two) before a timeout may fire.
    pub const PEER_TIMEOUT_LIMIT: u32 = 32;
    /// Minimum quiet period before a retransmission-limit timeout, in milliseconds.
    pub const PEER_TIMEOUT_MINIMUM: u32 = 5000;
    /// Quiet period after which a peer times out unconditionally, in milliseconds.
    pub const PEER_TIMEOUT_MAXIMUM: u32 = 30_000;
    /// Number of unsequenced group windows.
    pub const PEER_UNSEQUENCED_WINDOWS: u32 = 64;
    /// Size of one unsequenced group window (and of the replay bitmap).
    pub const PEER_UNSEQUENCED_WINDOW_SIZE: u32 = 1024;
    /// Unsequenced windows that may lie ahead of the current group.
    pub const PEER_FREE_UNSEQUENCED_WINDOWS: u32 = 32;
    /// Number of reliable sequence windows per channel.
    pub const PEER_RELIABLE_WINDOWS: u16 = 16;
    /// Size of one reliable sequence window.
    pub const PEER_RELIABLE_WINDOW_SIZE: u16 = 0x1000;
    /// Reliable windows a sender may occupy ahead of the retired pointer.
    pub const PEER_FREE_RELIABLE_WINDOWS: u16 = 8;

    /// Interval between host bandwidth throttle runs in milliseconds.
    pub const HOST_BANDWIDTH_THROTTLE_INTERVAL: u32 = 1000;
    /// Default cap on a single packet's payload size.
    pub const HOST_DEFAULT_MAXIMUM_PACKET_SIZE: usize = 32 * 1024 * 1024;
    /// Default cap on buffered, undelivered incoming data per peer.
    pub const HOST_DEFAULT_MAXIMUM_WAITING_DATA: usize = 32 * 1024 * 1024;
    /// Default socket receive buffer size in bytes.
    pub const HOST_RECEIVE_BUFFER_SIZE: usize = 256 * 1024;
    /// Default socket send buffer size in bytes.
    pub const HOST_SEND_BUFFER_SIZE: usize = 256 * 1024;
}

/// Compressor and checksum adapters.
pub mod compress;
/// Configuration options for hosts.
pub mod config;
/// Error types and results.
pub mod error;
/// Raw-datagram interception for custom processing.
pub mod interceptor;
/// Shared, reference-counted byte slices with zero-copy slicing.
pub mod shared;
/// Wrapping millisecond clock arithmetic and the `Clock` trait.
pub mod time;
/// Transport abstraction for pluggable I/O.
pub mod transport;
