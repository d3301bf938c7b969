#![warn(missing_docs)]

//! relink-host: host service loop over the peer protocol engine.
//!
//! A [`Host`] owns one UDP socket and a fixed table of peer slots. A single
//! logical task drives it through [`Host::service`], which alternates
//! between sending, receiving, and surfacing [`Event`]s. There is no
//! internal locking; share a host across threads only behind external
//! synchronization.

/// Events surfaced by the service loop.
pub mod event;
/// The host itself.
pub mod host;
/// Clocks for driving the service loop.
pub mod time;
/// UDP transport implementation.
pub mod udp;

pub use event::Event;
pub use host::{Host, PeerId};
pub use time::ManualClock;
pub use udp::UdpTransport;
