#![warn(missing_docs)]

//! Address resolution helpers for relink applications.
//!
//! The transport core deals only in `SocketAddr`s; these helpers cover the
//! name side: DNS resolution, reverse lookup, and string parsing/formatting.
//! They live in their own crate so the core stays free of resolver
//! dependencies.

use std::{
    io,
    net::{IpAddr, SocketAddr, ToSocketAddrs},
};

/// Resolves a hostname and port to the first matching socket address.
pub fn resolve_address(hostname: &str, port: u16) -> io::Result<SocketAddr> {
    (hostname, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "hostname did not resolve"))
}

/// Reverse-resolves an IP address to a hostname.
pub fn reverse_resolve(ip: &IpAddr) -> io::Result<String> {
    dns_lookup::lookup_addr(ip).map_err(io::Error::other)
}

/// Parses a literal IP string and port into a socket address, without DNS.
pub fn parse_address(ip: &str, port: u16) -> io::Result<SocketAddr> {
    let ip: IpAddr = ip
        .parse()
        .map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid ip: {}", error)))?;
    Ok(SocketAddr::new(ip, port))
}

/// Formats a socket address's IP as a string, without reverse DNS.
pub fn format_address(address: &SocketAddr) -> String {
    address.ip().to_string()
}
