//! Client that connects to the echo server and sends a line per second.
//!
//! Run:
//! - cargo run -p relink --example client
//! - cargo run -p relink --example client -- 127.0.0.1:9000

use std::{env, net::SocketAddr};

use relink::{Event, Host, Packet};

fn parse_server_addr() -> Option<SocketAddr> {
    env::args().nth(1).and_then(|arg| arg.parse().ok())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let server_addr = parse_server_addr().unwrap_or_else(|| "127.0.0.1:9000".parse().unwrap());

    let mut host = Host::bind_any()?;
    let server = host.connect(server_addr, 2, 0)?;
    println!("connecting to {}", server_addr);

    let mut counter = 0u64;
    loop {
        match host.service(1000)? {
            Some(Event::Connect { peer, .. }) => {
                println!("[connected] peer={}", peer);
                host.send(peer, 0, Packet::reliable(b"hello".as_slice()))?;
            }
            Some(Event::Receive { packet, .. }) => {
                println!("[echo] \"{}\"", String::from_utf8_lossy(packet.data()));
                counter += 1;
                let line = format!("message {}", counter);
                host.send(server, 0, Packet::reliable(line.into_bytes()))?;
            }
            Some(Event::Disconnect { .. }) => {
                println!("[disconnected]");
                return Ok(());
            }
            None => {}
        }
    }
}
