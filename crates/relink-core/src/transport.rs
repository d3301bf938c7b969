//! Transport abstraction for pluggable I/O.

use std::{io::Result, net::SocketAddr};

/// Low-level datagram socket abstraction.
///
/// This trait allows various transports (UDP, loss emulators, test shims) to
/// be plugged into the host without coupling to a concrete implementation.
/// A datagram larger than the path MTU must be reported as an error by the
/// implementation, never silently truncated.
pub trait Socket: Send {
    /// Sends a single datagram to the given address.
    fn send_packet(&mut self, addr: &SocketAddr, payload: &[u8]) -> Result<usize>;

    /// Receives a single datagram without blocking.
    ///
    /// Returns `Ok(None)` when nothing is pending.
    fn receive_packet<'a>(&mut self, buffer: &'a mut [u8]) -> Result<Option<(&'a [u8], SocketAddr)>>;

    /// Blocks until a datagram is ready to receive or `timeout_ms` elapses.
    ///
    /// Returns true when data is ready, false on timeout.
    fn wait_receive(&mut self, timeout_ms: u32) -> Result<bool>;

    /// Returns the local address this socket is bound to.
    fn local_addr(&self) -> Result<SocketAddr>;
}
