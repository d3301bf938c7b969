//! Simple echo server.
//!
//! Run:
//! - cargo run -p relink --example server
//! - cargo run -p relink --example server -- 127.0.0.1:7777

use std::{env, net::SocketAddr};

use relink::{Event, Host, HostConfig, Packet};

fn parse_bind_addr() -> Option<SocketAddr> {
    env::args().nth(1).and_then(|arg| arg.parse().ok())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = HostConfig { peer_count: 32, channel_limit: 2, ..HostConfig::default() };

    let bind_addr = parse_bind_addr().unwrap_or_else(|| "127.0.0.1:9000".parse().unwrap());
    let mut host = Host::bind_with_config(bind_addr, config)?;
    println!("relink echo server listening on {}", host.local_addr()?);

    loop {
        match host.service(100)? {
            Some(Event::Connect { peer, data }) => {
                println!("[connect] peer={} data={}", peer, data);
            }
            Some(Event::Receive { peer, channel_id, packet }) => {
                let text = String::from_utf8_lossy(packet.data());
                println!("[receive] peer={} channel={} payload=\"{}\"", peer, channel_id, text);

                // Echo back on the same channel with the same flags.
                let echo = Packet::new(packet.data().to_vec(), packet.flags());
                if let Err(error) = host.send(peer, channel_id, echo) {
                    eprintln!("failed to queue echo: {}", error);
                }
            }
            Some(Event::Disconnect { peer, data }) => {
                println!("[disconnect] peer={} data={}", peer, data);
            }
            None => {}
        }
    }
}
