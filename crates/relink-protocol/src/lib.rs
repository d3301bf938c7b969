#![warn(missing_docs)]

//! relink-protocol: command types, wire codec, and protocol arithmetic.

/// Pending acknowledgement records.
pub mod acknowledgment;
/// Protocol command types and the command size table.
pub mod command;
/// Command and datagram header serialization.
pub mod codec;
/// User-facing packet type and delivery flags.
pub mod packet;
/// Packet throttle state and adjustment law.
pub mod throttle;

pub use acknowledgment::Acknowledgement;
pub use command::{CommandHeader, CommandKind, ConnectParams, ProtocolCommand};
pub use packet::{Packet, PacketFlags};
pub use throttle::PacketThrottle;
