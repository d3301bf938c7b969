#![warn(missing_docs)]

//! Relink: a small public API facade for the workspace.
//!
//! This crate re-exports the surface most applications need to build on the
//! relink transport:
//!
//! - Host and events (`Host`, `Event`)
//! - Packet types and delivery flags (`Packet`, `PacketFlags`)
//! - Core configuration (`HostConfig`)
//!
//! Example
//! ```no_run
//! use relink::{Event, Host, Packet};
//!
//! let mut server = Host::bind("127.0.0.1:7777").unwrap();
//! loop {
//!     match server.service(100).unwrap() {
//!         Some(Event::Connect { peer, .. }) => {
//!             server.send(peer, 0, Packet::reliable(b"hello".as_slice())).unwrap();
//!         }
//!         Some(Event::Receive { peer, channel_id, packet }) => {
//!             println!("peer {} channel {}: {} bytes", peer, channel_id, packet.len());
//!         }
//!         Some(Event::Disconnect { peer, .. }) => {
//!             println!("peer {} left", peer);
//!         }
//!         None => {}
//!     }
//! }
//! ```

// Core configuration and errors
pub use relink_core::{
    config::HostConfig,
    error::{ErrorKind, Result},
};
// Host: service loop, events, peer handles
pub use relink_host::{Event, Host, PeerId};
// Peer state for introspection
pub use relink_peer::PeerState;
// Protocol: packets and delivery flags
pub use relink_protocol::packet::{Packet, PacketFlags};

/// Convenience prelude with the most commonly used items.
pub mod prelude {
    pub use crate::{Event, Host, HostConfig, Packet, PacketFlags, PeerId, PeerState};
}
