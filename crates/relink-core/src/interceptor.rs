//! Raw-datagram interception for custom processing.
//!
//! An interceptor sees every received datagram before the protocol pipeline.
//! Useful for packet-level filtering, custom framing, logging, and analytics.

use std::net::SocketAddr;

/// What the host should do with an intercepted datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptAction {
    /// The interceptor consumed the datagram; skip the protocol pipeline.
    Consume,
    /// Process the datagram normally.
    Continue,
    /// Treat the datagram as a fatal receive error.
    Error,
}

/// Trait for intercepting raw datagrams before protocol processing.
pub trait Interceptor: Send {
    /// Called for every received datagram, before any decoding.
    ///
    /// The data is mutable so interceptors may rewrite it in place
    /// (e.g. strip custom framing) before handing it on.
    fn on_receive(&mut self, addr: &SocketAddr, data: &mut [u8]) -> InterceptAction;
}
