//! UDP transport implementation.

use std::{
    io,
    mem::MaybeUninit,
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
    time::Duration,
};

use socket2::Socket as Socket2;

use relink_core::{config::HostConfig, transport::Socket};

/// Non-blocking UDP socket with a timed receive wait.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Binds a socket and applies the configured buffer sizes.
    pub fn bind<A: ToSocketAddrs>(addresses: A, config: &HostConfig) -> io::Result<Self> {
        let socket = UdpSocket::bind(addresses)?;
        apply_socket_options(&socket, config)?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket })
    }
}

/// Applies socket options from configuration to a UdpSocket.
fn apply_socket_options(socket: &UdpSocket, config: &HostConfig) -> io::Result<()> {
    let socket2 = Socket2::from(socket.try_clone()?);

    if let Some(size) = config.socket_receive_buffer_size {
        socket2.set_recv_buffer_size(size)?;
    }
    if let Some(size) = config.socket_send_buffer_size {
        socket2.set_send_buffer_size(size)?;
    }
    socket.set_broadcast(true)?;

    Ok(())
}

impl Socket for UdpTransport {
    fn send_packet(&mut self, addr: &SocketAddr, payload: &[u8]) -> io::Result<usize> {
        self.socket.send_to(payload, addr)
    }

    fn receive_packet<'a>(
        &mut self,
        buffer: &'a mut [u8],
    ) -> io::Result<Option<(&'a [u8], SocketAddr)>> {
        match self.socket.recv_from(buffer) {
            Ok((length, address)) => Ok(Some((&buffer[..length], address))),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(error) => Err(error),
        }
    }

    fn wait_receive(&mut self, timeout_ms: u32) -> io::Result<bool> {
        if timeout_ms == 0 {
            return Ok(false);
        }

        // Peek in blocking mode with a deadline, then restore non-blocking
        // operation for the receive pass.
        self.socket.set_nonblocking(false)?;
        self.socket.set_read_timeout(Some(Duration::from_millis(timeout_ms as u64)))?;

        let socket2 = Socket2::from(self.socket.try_clone()?);
        let mut probe = [MaybeUninit::<u8>::uninit(); 1];
        let result = socket2.peek_from(&mut probe);

        self.socket.set_read_timeout(None)?;
        self.socket.set_nonblocking(true)?;

        match result {
            Ok(_) => Ok(true),
            Err(error)
                if error.kind() == io::ErrorKind::WouldBlock
                    || error.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(false)
            }
            Err(error) => Err(error),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound_transport() -> UdpTransport {
        UdpTransport::bind("127.0.0.1:0", &HostConfig::default()).unwrap()
    }

    #[test]
    fn test_loopback_round_trip() {
        let mut sender = bound_transport();
        let mut receiver = bound_transport();
        let target = receiver.local_addr().unwrap();

        sender.send_packet(&target, b"relink").unwrap();

        let mut buffer = [0u8; 64];
        // Loopback delivery is fast but not instantaneous.
        assert!(receiver.wait_receive(1000).unwrap());
        let (payload, from) = receiver.receive_packet(&mut buffer).unwrap().unwrap();
        assert_eq!(payload, b"relink");
        assert_eq!(from, sender.local_addr().unwrap());
    }

    #[test]
    fn test_receive_without_data_does_not_block() {
        let mut transport = bound_transport();
        let mut buffer = [0u8; 64];
        assert!(transport.receive_packet(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn test_wait_times_out() {
        let mut transport = bound_transport();
        assert!(!transport.wait_receive(10).unwrap());
        assert!(!transport.wait_receive(0).unwrap());
    }
}
