#![warn(missing_docs)]

//! relink-peer: per-connection protocol engine.
//!
//! A [`Peer`] owns everything one connection needs: its channels, command
//! queues, throttle and RTT statistics, and the replay window. The host crate
//! drives peers from its service loop; nothing here touches a socket.

/// Per-channel sequencing state and reliable window bookkeeping.
pub mod channel;
/// Outgoing and incoming command records.
pub mod command_queue;
/// Reliable and unreliable dispatch to the delivery queue.
mod dispatch;
/// Receive-side command handling, reassembly, and the replay window.
pub mod incoming;
/// Send-side datagram assembly and retransmission timers.
pub mod outgoing;
/// The peer engine itself.
pub mod peer;
/// Connection lifecycle states.
pub mod peer_state;

pub use channel::Channel;
pub use command_queue::{IncomingCommand, OutgoingCommand};
pub use incoming::{AckResult, HostLimits};
pub use outgoing::DatagramBuilder;
pub use peer::Peer;
pub use peer_state::PeerState;
