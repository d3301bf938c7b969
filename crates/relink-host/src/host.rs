//! The host: a socket, a peer table, and the service loop that drives them.

use std::{
    collections::VecDeque,
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs},
    sync::Arc,
};

use relink_core::{
    compress::{Checksum, Compressor, Crc32Checksum},
    config::HostConfig,
    constants::{
        HOST_BANDWIDTH_THROTTLE_INTERVAL, MAXIMUM_CHANNEL_COUNT, MAXIMUM_MTU, MAXIMUM_PEER_ID,
        MAXIMUM_WINDOW_SIZE, MINIMUM_CHANNEL_COUNT, MINIMUM_WINDOW_SIZE, PEER_PACKET_LOSS_INTERVAL,
        PEER_PACKET_LOSS_SCALE, PEER_PACKET_THROTTLE_SCALE, PEER_WINDOW_SIZE_SCALE,
    },
    error::{ErrorKind, Result},
    interceptor::{InterceptAction, Interceptor},
    time::{time_difference, time_greater_equal, Clock, SystemClock},
    transport::Socket,
};
use relink_peer::{
    incoming::AckResult,
    outgoing::{DatagramBuilder, TimeoutOutcome},
    HostLimits, Peer, PeerState,
};
use relink_protocol::{
    codec::{
        decode_command, decode_header, encode_header, HEADER_FLAG_COMPRESSED,
        HEADER_FLAG_SENT_TIME, HEADER_SESSION_SHIFT,
    },
    command::{
        command_size, number, CommandHeader, CommandKind, ConnectParams, ProtocolCommand,
        COMMAND_FLAG_ACKNOWLEDGE,
    },
    packet::Packet,
};

use crate::{event::Event, udp::UdpTransport};

/// Identifies a peer slot on a host.
pub type PeerId = usize;

/// Derives a reliable window size from a single bandwidth figure.
fn initial_window_size(bandwidth: u32) -> u32 {
    if bandwidth == 0 {
        MAXIMUM_WINDOW_SIZE
    } else {
        ((bandwidth / PEER_WINDOW_SIZE_SCALE) * MINIMUM_WINDOW_SIZE)
            .clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE)
    }
}

/// Derives a reliable window size from both sides' bandwidth figures.
fn negotiated_window_size(local_bandwidth: u32, remote_bandwidth: u32) -> u32 {
    let window = if local_bandwidth == 0 && remote_bandwidth == 0 {
        MAXIMUM_WINDOW_SIZE
    } else if local_bandwidth == 0 || remote_bandwidth == 0 {
        (local_bandwidth.max(remote_bandwidth) / PEER_WINDOW_SIZE_SCALE) * MINIMUM_WINDOW_SIZE
    } else {
        (local_bandwidth.min(remote_bandwidth) / PEER_WINDOW_SIZE_SCALE) * MINIMUM_WINDOW_SIZE
    };
    window.clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE)
}

fn is_broadcast_address(address: SocketAddr) -> bool {
    match address {
        SocketAddr::V4(v4) => *v4.ip() == Ipv4Addr::BROADCAST,
        SocketAddr::V6(_) => false,
    }
}

/// Bytes a bandwidth figure allows over an elapsed window, without overflow.
fn scaled_bandwidth(bandwidth: u32, elapsed_ms: u32) -> u32 {
    ((bandwidth as u64 * elapsed_ms as u64) / 1000).min(u32::MAX as u64) as u32
}

/// `bandwidth * PEER_PACKET_THROTTLE_SCALE / data`, widened against overflow.
fn scaled_share(bandwidth: u32, data: u32) -> u32 {
    ((bandwidth as u64 * PEER_PACKET_THROTTLE_SCALE as u64) / data.max(1) as u64)
        .min(u32::MAX as u64) as u32
}

/// A fleet of peers bound to one UDP socket.
pub struct Host {
    socket: Box<dyn Socket>,
    config: HostConfig,
    clock: Arc<dyn Clock>,

    peers: Vec<Peer>,
    dispatch_queue: VecDeque<usize>,

    channel_limit: usize,
    incoming_bandwidth: u32,
    outgoing_bandwidth: u32,
    mtu: u32,

    service_time: u32,
    bandwidth_throttle_epoch: u32,
    recalculate_bandwidth_limits: bool,

    compressor: Option<Box<dyn Compressor>>,
    checksum: Option<Box<dyn Checksum>>,
    interceptor: Option<Box<dyn Interceptor>>,

    receive_buffer: Vec<u8>,
    decompress_buffer: Vec<u8>,

    total_sent_data: u32,
    total_sent_packets: u32,
    total_received_data: u32,
    total_received_packets: u32,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("peers", &self.peers.len())
            .field("channel_limit", &self.channel_limit)
            .field("mtu", &self.mtu)
            .finish()
    }
}

impl Host {
    /// Binds a host to the given address with default configuration.
    pub fn bind<A: ToSocketAddrs>(addresses: A) -> Result<Self> {
        Self::bind_with_config(addresses, HostConfig::default())
    }

    /// Binds a host to any free loopback port with default configuration.
    pub fn bind_any() -> Result<Self> {
        Self::bind_any_with_config(HostConfig::default())
    }

    /// Binds a host to any free loopback port.
    pub fn bind_any_with_config(config: HostConfig) -> Result<Self> {
        Self::bind_with_config("127.0.0.1:0", config)
    }

    /// Binds a host to the given address.
    pub fn bind_with_config<A: ToSocketAddrs>(addresses: A, config: HostConfig) -> Result<Self> {
        let transport = UdpTransport::bind(addresses, &config)?;
        Self::from_parts(Box::new(transport), config, Arc::new(SystemClock::default()))
    }

    /// Assembles a host from a transport, configuration, and clock.
    ///
    /// Tests inject a [`crate::ManualClock`] here to drive time explicitly.
    pub fn from_parts(
        socket: Box<dyn Socket>,
        config: HostConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if config.peer_count == 0 || config.peer_count > MAXIMUM_PEER_ID as usize {
            return Err(ErrorKind::NoAvailablePeers);
        }

        let channel_limit = if config.channel_limit == 0 {
            MAXIMUM_CHANNEL_COUNT
        } else {
            config.channel_limit.clamp(MINIMUM_CHANNEL_COUNT, MAXIMUM_CHANNEL_COUNT)
        };

        let peers = (0..config.peer_count).map(|id| Peer::new(id as u16, config.mtu)).collect();

        let checksum: Option<Box<dyn Checksum>> =
            if config.use_checksums { Some(Box::new(Crc32Checksum)) } else { None };

        Ok(Host {
            socket,
            clock,
            peers,
            dispatch_queue: VecDeque::new(),
            channel_limit,
            incoming_bandwidth: config.incoming_bandwidth,
            outgoing_bandwidth: config.outgoing_bandwidth,
            mtu: config.mtu,
            service_time: 0,
            bandwidth_throttle_epoch: 0,
            recalculate_bandwidth_limits: false,
            compressor: None,
            checksum,
            interceptor: None,
            receive_buffer: vec![0; MAXIMUM_MTU as usize],
            decompress_buffer: vec![0; MAXIMUM_MTU as usize],
            total_sent_data: 0,
            total_sent_packets: 0,
            total_received_data: 0,
            total_received_packets: 0,
            config,
        })
    }

    // ===== Accessors and limits =====

    /// Returns the local socket address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Returns the number of peer slots.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Returns the MTU assumed for new connections.
    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    /// Returns a peer by id.
    pub fn peer(&self, peer: PeerId) -> Option<&Peer> {
        self.peers.get(peer)
    }

    /// Returns a peer by id for configuration (ping interval, timeouts).
    pub fn peer_mut(&mut self, peer: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(peer)
    }

    /// Number of peers in a connected state.
    pub fn connected_peers(&self) -> usize {
        self.peers.iter().filter(|peer| peer.state.is_connected()).count()
    }

    fn bandwidth_limited_peers(&self) -> usize {
        self.peers
            .iter()
            .filter(|peer| peer.state.is_connected() && peer.incoming_bandwidth != 0)
            .count()
    }

    /// Total bytes handed to the socket since creation.
    pub fn total_sent_data(&self) -> u32 {
        self.total_sent_data
    }

    /// Total datagrams handed to the socket since creation.
    pub fn total_sent_packets(&self) -> u32 {
        self.total_sent_packets
    }

    /// Total bytes received from the socket since creation.
    pub fn total_received_data(&self) -> u32 {
        self.total_received_data
    }

    /// Total datagrams received from the socket since creation.
    pub fn total_received_packets(&self) -> u32 {
        self.total_received_packets
    }

    /// Adjusts the channel limit for future connections.
    pub fn set_channel_limit(&mut self, channel_limit: usize) {
        self.channel_limit = if channel_limit == 0 {
            MAXIMUM_CHANNEL_COUNT
        } else {
            channel_limit.clamp(MINIMUM_CHANNEL_COUNT, MAXIMUM_CHANNEL_COUNT)
        };
    }

    /// Adjusts the host bandwidth limits; peers learn of the change through
    /// BANDWIDTH_LIMIT commands at the next throttle interval.
    pub fn set_bandwidth_limit(&mut self, incoming_bandwidth: u32, outgoing_bandwidth: u32) {
        self.incoming_bandwidth = incoming_bandwidth;
        self.outgoing_bandwidth = outgoing_bandwidth;
        self.recalculate_bandwidth_limits = true;
    }

    /// Installs a compressor for outgoing command regions.
    pub fn set_compressor(&mut self, compressor: Option<Box<dyn Compressor>>) {
        self.compressor = compressor;
    }

    /// Installs a checksum; changes the wire format of every datagram.
    pub fn set_checksum(&mut self, checksum: Option<Box<dyn Checksum>>) {
        self.checksum = checksum;
    }

    /// Installs a raw-datagram interceptor.
    pub fn set_interceptor(&mut self, interceptor: Option<Box<dyn Interceptor>>) {
        self.interceptor = interceptor;
    }

    fn limits(&self) -> HostLimits {
        HostLimits {
            maximum_packet_size: self.config.maximum_packet_size,
            maximum_waiting_data: self.config.maximum_waiting_data,
        }
    }

    // ===== Connection management =====

    /// Initiates a connection, reserving a peer slot and queueing CONNECT.
    pub fn connect(
        &mut self,
        address: SocketAddr,
        channel_count: usize,
        data: u32,
    ) -> Result<PeerId> {
        let channel_count = channel_count.clamp(MINIMUM_CHANNEL_COUNT, MAXIMUM_CHANNEL_COUNT);

        let index = self
            .peers
            .iter()
            .position(|peer| peer.state == PeerState::Disconnected)
            .ok_or(ErrorKind::NoAvailablePeers)?;

        let outgoing_bandwidth = self.outgoing_bandwidth;
        let incoming_bandwidth = self.incoming_bandwidth;
        let peer = &mut self.peers[index];

        peer.setup_channels(channel_count);
        peer.state = PeerState::Connecting;
        peer.address = Some(address);
        peer.connect_id = rand::random();
        peer.window_size = initial_window_size(outgoing_bandwidth);

        let command = ProtocolCommand::new(
            CommandHeader::control(COMMAND_FLAG_ACKNOWLEDGE),
            CommandKind::Connect {
                params: ConnectParams {
                    outgoing_peer_id: peer.incoming_peer_id,
                    incoming_session_id: peer.incoming_session_id,
                    outgoing_session_id: peer.outgoing_session_id,
                    mtu: peer.mtu,
                    window_size: peer.window_size,
                    channel_count: channel_count as u32,
                    incoming_bandwidth,
                    outgoing_bandwidth,
                    packet_throttle_interval: peer.throttle.interval,
                    packet_throttle_acceleration: peer.throttle.acceleration,
                    packet_throttle_deceleration: peer.throttle.deceleration,
                    connect_id: peer.connect_id,
                },
                data,
            },
        );
        peer.queue_outgoing_command(command, 0, 0);

        Ok(index)
    }

    /// Queues a packet for delivery to a peer.
    pub fn send(&mut self, peer: PeerId, channel_id: u8, packet: Packet) -> Result<()> {
        let maximum_packet_size = self.config.maximum_packet_size;
        let checksum = self.checksum.is_some();
        self.peers
            .get_mut(peer)
            .ok_or(ErrorKind::InvalidPeer)?
            .send(channel_id, packet, maximum_packet_size, checksum)
    }

    /// Queues a packet for every connected peer; payload bytes are shared,
    /// not copied.
    pub fn broadcast(&mut self, channel_id: u8, packet: Packet) {
        let maximum_packet_size = self.config.maximum_packet_size;
        let checksum = self.checksum.is_some();
        for peer in &mut self.peers {
            if peer.state != PeerState::Connected {
                continue;
            }
            let _ = peer.send(channel_id, packet.clone(), maximum_packet_size, checksum);
        }
    }

    /// Requests a graceful disconnect; a DISCONNECT event surfaces once the
    /// remote acknowledges.
    pub fn disconnect(&mut self, peer: PeerId, data: u32) -> Result<()> {
        if peer >= self.peers.len() {
            return Err(ErrorKind::InvalidPeer);
        }

        let state = self.peers[peer].state;
        if matches!(
            state,
            PeerState::Disconnecting
                | PeerState::Disconnected
                | PeerState::AcknowledgingDisconnect
                | PeerState::Zombie
        ) {
            return Ok(());
        }

        self.reset_peer_queues(peer);

        let flags = if state.is_connected() {
            COMMAND_FLAG_ACKNOWLEDGE
        } else {
            relink_protocol::command::COMMAND_FLAG_UNSEQUENCED
        };
        self.peers[peer].queue_disconnect_command(data, flags);

        if state.is_connected() {
            self.peers[peer].state = PeerState::Disconnecting;
        } else {
            self.flush()?;
            self.reset_peer(peer);
        }

        Ok(())
    }

    /// Disconnects immediately: one unsequenced DISCONNECT is flushed and
    /// the slot resets without waiting for acknowledgement.
    pub fn disconnect_now(&mut self, peer: PeerId, data: u32) -> Result<()> {
        if peer >= self.peers.len() {
            return Err(ErrorKind::InvalidPeer);
        }

        let state = self.peers[peer].state;
        if state == PeerState::Disconnected {
            return Ok(());
        }

        if state != PeerState::Zombie && state != PeerState::Disconnecting {
            self.reset_peer_queues(peer);
            self.peers[peer]
                .queue_disconnect_command(data, relink_protocol::command::COMMAND_FLAG_UNSEQUENCED);
            self.flush()?;
        }

        self.reset_peer(peer);
        Ok(())
    }

    /// Disconnects once every queued send has been delivered.
    pub fn disconnect_later(&mut self, peer: PeerId, data: u32) -> Result<()> {
        if peer >= self.peers.len() {
            return Err(ErrorKind::InvalidPeer);
        }

        let state = self.peers[peer].state;
        if (state == PeerState::Connected || state == PeerState::DisconnectLater)
            && self.peers[peer].has_outgoing_commands()
        {
            self.peers[peer].state = PeerState::DisconnectLater;
            self.peers[peer].event_data = data;
            Ok(())
        } else {
            self.disconnect(peer, data)
        }
    }

    /// Forcibly returns a peer slot to DISCONNECTED with no network effect.
    pub fn reset_peer(&mut self, peer: PeerId) {
        self.dispatch_queue.retain(|&index| index != peer);
        if let Some(peer) = self.peers.get_mut(peer) {
            peer.reset();
        }
    }

    fn reset_peer_queues(&mut self, peer: PeerId) {
        self.dispatch_queue.retain(|&index| index != peer);
        self.peers[peer].reset_queues();
    }

    // ===== Dispatch =====

    fn enqueue_dispatch(&mut self, index: usize) {
        self.peers[index].needs_dispatch = true;
        if !self.dispatch_queue.contains(&index) {
            self.dispatch_queue.push_back(index);
        }
    }

    fn sync_dispatch(&mut self, index: usize) {
        if self.peers[index].needs_dispatch && !self.dispatch_queue.contains(&index) {
            self.dispatch_queue.push_back(index);
        }
    }

    fn dispatch_state(&mut self, index: usize, state: PeerState) {
        self.peers[index].state = state;
        self.enqueue_dispatch(index);
    }

    fn dispatch_incoming_commands(&mut self, event: &mut Option<Event>) -> bool {
        while let Some(index) = self.dispatch_queue.pop_front() {
            self.peers[index].needs_dispatch = false;

            match self.peers[index].state {
                PeerState::ConnectionPending | PeerState::ConnectionSucceeded => {
                    self.peers[index].state = PeerState::Connected;
                    *event =
                        Some(Event::Connect { peer: index, data: self.peers[index].event_data });
                    return true;
                }

                PeerState::Zombie => {
                    self.recalculate_bandwidth_limits = true;
                    *event =
                        Some(Event::Disconnect { peer: index, data: self.peers[index].event_data });
                    self.reset_peer(index);
                    return true;
                }

                PeerState::Connected => {
                    if let Some((channel_id, packet)) = self.peers[index].receive() {
                        *event = Some(Event::Receive { peer: index, channel_id, packet });
                        if !self.peers[index].dispatched_commands.is_empty() {
                            self.enqueue_dispatch(index);
                        }
                        return true;
                    }
                }

                _ => {}
            }
        }

        false
    }

    fn notify_connect(&mut self, index: usize, event: &mut Option<Event>, surface: bool) {
        self.recalculate_bandwidth_limits = true;

        if surface && event.is_none() {
            self.peers[index].state = PeerState::Connected;
            *event = Some(Event::Connect { peer: index, data: self.peers[index].event_data });
        } else {
            let state = if self.peers[index].state == PeerState::Connecting {
                PeerState::ConnectionSucceeded
            } else {
                PeerState::ConnectionPending
            };
            self.dispatch_state(index, state);
        }
    }

    fn notify_disconnect(&mut self, index: usize, event: &mut Option<Event>, surface: bool) {
        let state = self.peers[index].state;

        if state >= PeerState::ConnectionPending {
            self.recalculate_bandwidth_limits = true;
        }

        if state != PeerState::Connecting && state < PeerState::ConnectionSucceeded {
            self.reset_peer(index);
        } else if surface && event.is_none() {
            *event = Some(Event::Disconnect { peer: index, data: 0 });
            self.reset_peer(index);
        } else {
            self.peers[index].event_data = 0;
            self.dispatch_state(index, PeerState::Zombie);
        }
    }

    // ===== Handshake =====

    fn handle_connect(
        &mut self,
        params: &ConnectParams,
        data: u32,
        received_address: SocketAddr,
    ) -> Option<usize> {
        let channel_count = params.channel_count as usize;
        if !(MINIMUM_CHANNEL_COUNT..=MAXIMUM_CHANNEL_COUNT).contains(&channel_count) {
            return None;
        }

        let mut slot = None;
        let mut duplicate_peers = 0usize;
        for (index, peer) in self.peers.iter().enumerate() {
            if peer.state == PeerState::Disconnected {
                if slot.is_none() {
                    slot = Some(index);
                }
            } else if peer.state != PeerState::Connecting {
                let Some(peer_address) = peer.address else { continue };
                if peer_address.ip() != received_address.ip() {
                    continue;
                }
                if peer_address.port() == received_address.port()
                    && peer.connect_id == params.connect_id
                {
                    return None;
                }
                duplicate_peers += 1;
            }
        }

        let index = slot?;
        if duplicate_peers >= self.config.duplicate_peers {
            return None;
        }

        let channel_count = channel_count.min(self.channel_limit);
        let host_incoming_bandwidth = self.incoming_bandwidth;
        let host_outgoing_bandwidth = self.outgoing_bandwidth;

        let peer = &mut self.peers[index];
        peer.setup_channels(channel_count);
        peer.state = PeerState::AcknowledgingConnect;
        peer.connect_id = params.connect_id;
        peer.address = Some(received_address);
        peer.outgoing_peer_id = params.outgoing_peer_id;
        peer.incoming_bandwidth = params.incoming_bandwidth;
        peer.outgoing_bandwidth = params.outgoing_bandwidth;
        peer.throttle.interval = params.packet_throttle_interval;
        peer.throttle.acceleration = params.packet_throttle_acceleration;
        peer.throttle.deceleration = params.packet_throttle_deceleration;
        peer.event_data = data;

        // Rotate session ids, skipping the value currently in use; 0xFF in
        // the command means the remote wants us to pick.
        let mut incoming_session_id = if params.incoming_session_id == 0xFF {
            peer.outgoing_session_id
        } else {
            params.incoming_session_id
        };
        incoming_session_id = (incoming_session_id.wrapping_add(1)) & 3;
        if incoming_session_id == peer.outgoing_session_id {
            incoming_session_id = (incoming_session_id + 1) & 3;
        }
        peer.outgoing_session_id = incoming_session_id;

        let mut outgoing_session_id = if params.outgoing_session_id == 0xFF {
            peer.incoming_session_id
        } else {
            params.outgoing_session_id
        };
        outgoing_session_id = (outgoing_session_id.wrapping_add(1)) & 3;
        if outgoing_session_id == peer.incoming_session_id {
            outgoing_session_id = (outgoing_session_id + 1) & 3;
        }
        peer.incoming_session_id = outgoing_session_id;

        let mtu = params.mtu.clamp(relink_core::constants::MINIMUM_MTU, MAXIMUM_MTU);
        if mtu < peer.mtu {
            peer.mtu = mtu;
        }

        peer.window_size = negotiated_window_size(host_outgoing_bandwidth, peer.incoming_bandwidth);

        let window_size =
            initial_window_size(host_incoming_bandwidth).min(params.window_size).clamp(
                MINIMUM_WINDOW_SIZE,
                MAXIMUM_WINDOW_SIZE,
            );

        let verify = ProtocolCommand::new(
            CommandHeader::control(COMMAND_FLAG_ACKNOWLEDGE),
            CommandKind::VerifyConnect {
                params: ConnectParams {
                    outgoing_peer_id: peer.incoming_peer_id,
                    incoming_session_id,
                    outgoing_session_id,
                    mtu: peer.mtu,
                    window_size,
                    channel_count: channel_count as u32,
                    incoming_bandwidth: host_incoming_bandwidth,
                    outgoing_bandwidth: host_outgoing_bandwidth,
                    packet_throttle_interval: peer.throttle.interval,
                    packet_throttle_acceleration: peer.throttle.acceleration,
                    packet_throttle_deceleration: peer.throttle.deceleration,
                    connect_id: peer.connect_id,
                },
            },
        );
        peer.queue_outgoing_command(verify, 0, 0);

        Some(index)
    }

    fn handle_verify_connect(
        &mut self,
        index: usize,
        params: &ConnectParams,
        event: &mut Option<Event>,
    ) -> Result<()> {
        if self.peers[index].state != PeerState::Connecting {
            // Stale VERIFY_CONNECT for a connection we've moved on from.
            return Ok(());
        }

        let channel_count = params.channel_count as usize;
        {
            let peer = &self.peers[index];
            if !(MINIMUM_CHANNEL_COUNT..=MAXIMUM_CHANNEL_COUNT).contains(&channel_count)
                || params.packet_throttle_interval != peer.throttle.interval
                || params.packet_throttle_acceleration != peer.throttle.acceleration
                || params.packet_throttle_deceleration != peer.throttle.deceleration
                || params.connect_id != peer.connect_id
            {
                self.peers[index].event_data = 0;
                self.dispatch_state(index, PeerState::Zombie);
                return Err(ErrorKind::MalformedCommand);
            }
        }

        self.peers[index].remove_sent_reliable_command(1, 0xFF);

        let peer = &mut self.peers[index];
        if channel_count < peer.channels.len() {
            peer.channels.truncate(channel_count);
        }
        peer.outgoing_peer_id = params.outgoing_peer_id;
        peer.incoming_session_id = params.incoming_session_id;
        peer.outgoing_session_id = params.outgoing_session_id;

        let mtu = params.mtu.clamp(relink_core::constants::MINIMUM_MTU, MAXIMUM_MTU);
        if mtu < peer.mtu {
            peer.mtu = mtu;
        }

        let window_size = params.window_size.clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE);
        if window_size < peer.window_size {
            peer.window_size = window_size;
        }

        peer.incoming_bandwidth = params.incoming_bandwidth;
        peer.outgoing_bandwidth = params.outgoing_bandwidth;

        self.notify_connect(index, event, true);
        Ok(())
    }

    fn handle_disconnect(&mut self, index: usize, data: u32, acknowledged: bool) {
        let state = self.peers[index].state;
        if matches!(
            state,
            PeerState::Disconnected | PeerState::Zombie | PeerState::AcknowledgingDisconnect
        ) {
            return;
        }

        self.reset_peer_queues(index);

        match state {
            PeerState::ConnectionSucceeded | PeerState::Disconnecting | PeerState::Connecting => {
                self.dispatch_state(index, PeerState::Zombie);
            }
            PeerState::Connected | PeerState::DisconnectLater => {
                if acknowledged {
                    self.peers[index].state = PeerState::AcknowledgingDisconnect;
                } else {
                    self.dispatch_state(index, PeerState::Zombie);
                }
            }
            _ => {
                if state == PeerState::ConnectionPending {
                    self.recalculate_bandwidth_limits = true;
                }
                self.reset_peer(index);
            }
        }

        if self.peers[index].state != PeerState::Disconnected {
            self.peers[index].event_data = data;
        }
    }

    fn handle_acknowledge(
        &mut self,
        index: usize,
        channel_id: u8,
        received_reliable_sequence_number: u16,
        received_sent_time: u16,
        event: &mut Option<Event>,
    ) -> Result<()> {
        let state = self.peers[index].state;
        if state == PeerState::Disconnected || state == PeerState::Zombie {
            return Ok(());
        }

        let result = self.peers[index].process_acknowledge(
            channel_id,
            received_reliable_sequence_number,
            received_sent_time,
            self.service_time,
        );

        let command_number = match result {
            AckResult::Ignored => return Ok(()),
            AckResult::Retired(command_number) => command_number,
        };

        match state {
            PeerState::AcknowledgingConnect => {
                if command_number != Some(number::VERIFY_CONNECT) {
                    return Err(ErrorKind::MalformedCommand);
                }
                self.notify_connect(index, event, true);
            }
            PeerState::Disconnecting => {
                if command_number != Some(number::DISCONNECT) {
                    return Err(ErrorKind::MalformedCommand);
                }
                self.notify_disconnect(index, event, true);
            }
            PeerState::DisconnectLater => {
                if !self.peers[index].has_outgoing_commands() {
                    let data = self.peers[index].event_data;
                    self.disconnect(index, data)?;
                }
            }
            _ => {}
        }

        Ok(())
    }

    // ===== Receive path =====

    fn receive_incoming_commands(&mut self, event: &mut Option<Event>) -> Result<bool> {
        for _ in 0..256 {
            let (length, address) = match self.socket.receive_packet(&mut self.receive_buffer)? {
                Some((payload, address)) => (payload.len(), address),
                None => return Ok(false),
            };

            self.total_received_data += length as u32;
            self.total_received_packets += 1;

            if let Some(interceptor) = self.interceptor.as_mut() {
                match interceptor.on_receive(&address, &mut self.receive_buffer[..length]) {
                    InterceptAction::Consume => continue,
                    InterceptAction::Error => {
                        return Err(ErrorKind::IoError(std::io::Error::other(
                            "interceptor rejected datagram",
                        )))
                    }
                    InterceptAction::Continue => {}
                }
            }

            self.handle_incoming_datagram(length, address, event);
            if event.is_some() {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Runs one datagram through header validation, decompression, checksum
    /// verification, and the command walk. Malformed input is silently
    /// absorbed; the walk stops at the first bad command.
    fn handle_incoming_datagram(
        &mut self,
        length: usize,
        address: SocketAddr,
        event: &mut Option<Event>,
    ) {
        let info = match decode_header(&self.receive_buffer[..length], self.checksum.is_some()) {
            Ok(info) => info,
            Err(_) => return,
        };

        let mut connect_id = 0u32;
        let mut current_peer: Option<usize> = if info.peer_id == MAXIMUM_PEER_ID {
            None
        } else if info.peer_id as usize >= self.peers.len() {
            return;
        } else {
            let index = info.peer_id as usize;
            let peer = &self.peers[index];
            if peer.state == PeerState::Disconnected || peer.state == PeerState::Zombie {
                return;
            }
            match peer.address {
                Some(peer_address) => {
                    if peer_address != address && !is_broadcast_address(peer_address) {
                        return;
                    }
                }
                None => return,
            }
            if peer.outgoing_peer_id < MAXIMUM_PEER_ID && info.session_id != peer.incoming_session_id
            {
                return;
            }
            connect_id = peer.connect_id;
            Some(index)
        };

        // Decompress the command region into the spare buffer, re-prefixing
        // the untouched header.
        let mut total = length;
        let mut use_decompress_buffer = false;
        if info.compressed {
            let Some(compressor) = self.compressor.as_mut() else { return };
            let mut region = vec![0u8; MAXIMUM_MTU as usize - info.header_size];
            let size = compressor
                .decompress(&self.receive_buffer[info.header_size..length], &mut region);
            if size == 0 {
                tracing::warn!(peer = info.peer_id, "dropping datagram: decompression failed");
                return;
            }
            self.decompress_buffer[..info.header_size]
                .copy_from_slice(&self.receive_buffer[..info.header_size]);
            self.decompress_buffer[info.header_size..info.header_size + size]
                .copy_from_slice(&region[..size]);
            total = info.header_size + size;
            use_decompress_buffer = true;
        }

        if let Some(checksum) = self.checksum.as_mut() {
            let data: &mut [u8] = if use_decompress_buffer {
                &mut self.decompress_buffer[..total]
            } else {
                &mut self.receive_buffer[..total]
            };
            let offset = info.header_size - 4;
            let wire_checksum = u32::from_be_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]);
            // The on-wire word carried the checksum; during verification the
            // slot holds the connect id instead.
            data[offset..offset + 4].copy_from_slice(&connect_id.to_be_bytes());

            if checksum.checksum(data) != wire_checksum {
                tracing::warn!(peer = info.peer_id, "dropping datagram: checksum mismatch");
                return;
            }
        }

        if let Some(index) = current_peer {
            self.peers[index].address = Some(address);
            self.peers[index].incoming_data_total += total as u32;
        }

        let limits = self.limits();
        let mut offset = info.header_size;

        while offset < total {
            let decoded = {
                let data: &[u8] = if use_decompress_buffer {
                    &self.decompress_buffer[..total]
                } else {
                    &self.receive_buffer[..total]
                };
                decode_command(data, offset)
            };
            let (command, next_offset) = match decoded {
                Ok(decoded) => decoded,
                Err(_) => break,
            };
            offset = next_offset;

            let command_number = command.number();
            let header = command.header;

            if let CommandKind::Connect { params, data } = &command.kind {
                if current_peer.is_some() {
                    break;
                }
                match self.handle_connect(params, *data, address) {
                    Some(index) => current_peer = Some(index),
                    None => break,
                }
            } else {
                let Some(index) = current_peer else { break };

                let outcome: Result<()> = match &command.kind {
                    CommandKind::Acknowledge {
                        received_reliable_sequence_number,
                        received_sent_time,
                    } => self.handle_acknowledge(
                        index,
                        header.channel_id,
                        *received_reliable_sequence_number,
                        *received_sent_time,
                        event,
                    ),

                    CommandKind::VerifyConnect { params } => {
                        self.handle_verify_connect(index, params, event)
                    }

                    CommandKind::Disconnect { data } => {
                        self.handle_disconnect(index, *data, header.is_acknowledged());
                        Ok(())
                    }

                    CommandKind::Ping => self.peers[index].handle_ping(),

                    CommandKind::SendReliable { data } => {
                        self.peers[index].handle_send_reliable(&header, data, limits)
                    }

                    CommandKind::SendUnreliable { unreliable_sequence_number, data } => self.peers
                        [index]
                    .handle_send_unreliable(&header, *unreliable_sequence_number, data, limits),

                    CommandKind::SendUnsequenced { unsequenced_group, data } => self.peers[index]
                        .handle_send_unsequenced(&header, *unsequenced_group, data, limits),

                    CommandKind::SendFragment {
                        start_sequence_number,
                        fragment_count,
                        fragment_number,
                        total_length,
                        fragment_offset,
                        data,
                    } => self.peers[index].handle_send_fragment(
                        &header,
                        *start_sequence_number,
                        *fragment_count,
                        *fragment_number,
                        *total_length,
                        *fragment_offset,
                        data,
                        limits,
                    ),

                    CommandKind::SendUnreliableFragment {
                        start_sequence_number,
                        fragment_count,
                        fragment_number,
                        total_length,
                        fragment_offset,
                        data,
                    } => self.peers[index].handle_send_unreliable_fragment(
                        &header,
                        *start_sequence_number,
                        *fragment_count,
                        *fragment_number,
                        *total_length,
                        *fragment_offset,
                        data,
                        limits,
                    ),

                    CommandKind::BandwidthLimit { incoming_bandwidth, outgoing_bandwidth } => {
                        let host_outgoing_bandwidth = self.outgoing_bandwidth;
                        self.peers[index].handle_bandwidth_limit(
                            *incoming_bandwidth,
                            *outgoing_bandwidth,
                            host_outgoing_bandwidth,
                        )
                    }

                    CommandKind::ThrottleConfigure {
                        packet_throttle_interval,
                        packet_throttle_acceleration,
                        packet_throttle_deceleration,
                    } => self.peers[index].handle_throttle_configure(
                        *packet_throttle_interval,
                        *packet_throttle_acceleration,
                        *packet_throttle_deceleration,
                    ),

                    CommandKind::Connect { .. } => unreachable!("handled above"),
                };

                if outcome.is_err() {
                    break;
                }
            }

            let Some(index) = current_peer else { continue };
            self.sync_dispatch(index);

            if header.is_acknowledged() {
                let Some(sent_time) = info.sent_time else { break };

                match self.peers[index].state {
                    PeerState::Disconnecting
                    | PeerState::AcknowledgingConnect
                    | PeerState::Disconnected
                    | PeerState::Zombie => {}

                    PeerState::AcknowledgingDisconnect => {
                        if command_number == number::DISCONNECT {
                            self.peers[index].queue_acknowledgement(
                                &header,
                                command_number,
                                sent_time,
                            );
                        }
                    }

                    _ => {
                        self.peers[index].queue_acknowledgement(&header, command_number, sent_time);
                    }
                }
            }
        }
    }

    // ===== Send path =====

    fn check_disconnect_later(&mut self, index: usize) -> Result<()> {
        if self.peers[index].state == PeerState::DisconnectLater
            && !self.peers[index].has_outgoing_commands()
            && self.peers[index].sent_unreliable_commands.is_empty()
        {
            let data = self.peers[index].event_data;
            self.disconnect(index, data)?;
        }
        Ok(())
    }

    fn send_outgoing_commands(
        &mut self,
        event: &mut Option<Event>,
        check_for_timeouts: bool,
        surface: bool,
    ) -> Result<bool> {
        let mut continue_until = 0usize;
        let mut send_pass = 0usize;

        while send_pass <= continue_until {
            for index in 0..self.peers.len() {
                {
                    let peer = &self.peers[index];
                    if peer.state == PeerState::Disconnected
                        || peer.state == PeerState::Zombie
                        || (send_pass > 0 && !peer.continue_sending)
                    {
                        continue;
                    }
                }
                self.peers[index].continue_sending = false;

                let mut frame = DatagramBuilder::new();

                if !self.peers[index].acknowledgements.is_empty()
                    && self.peers[index].emit_acknowledgements(&mut frame)
                {
                    // An ack for a DISCONNECT is aboard: the peer is done
                    // once this datagram leaves.
                    self.dispatch_state(index, PeerState::Zombie);
                }

                if check_for_timeouts
                    && !self.peers[index].sent_reliable_commands.is_empty()
                    && time_greater_equal(self.service_time, self.peers[index].next_timeout)
                    && self.peers[index].check_timeouts(self.service_time)
                        == TimeoutOutcome::Disconnect
                {
                    self.notify_disconnect(index, event, surface);
                    if event.is_some() {
                        return Ok(true);
                    }
                    continue;
                }

                let queues_empty = self.peers[index].outgoing_commands.is_empty()
                    && self.peers[index].outgoing_send_reliable_commands.is_empty();
                let can_ping = if queues_empty {
                    true
                } else {
                    let can_ping = self.peers[index].emit_commands(&mut frame, self.service_time);
                    self.check_disconnect_later(index)?;
                    can_ping
                };

                if can_ping
                    && self.peers[index].sent_reliable_commands.is_empty()
                    && time_difference(self.service_time, self.peers[index].last_receive_time)
                        >= self.peers[index].ping_interval
                    && self.peers[index].mtu as usize - frame.packet_size
                        >= command_size(number::PING)
                {
                    self.peers[index].ping();
                    self.peers[index].emit_commands(&mut frame, self.service_time);
                    self.check_disconnect_later(index)?;
                }

                if frame.is_empty() {
                    if self.peers[index].continue_sending {
                        continue_until = send_pass + 1;
                    }
                    continue;
                }

                self.update_packet_loss(index);

                let datagram = self.finalize_datagram(index, &frame);
                self.peers[index].last_send_time = self.service_time;

                let Some(destination) = self.peers[index].address else { continue };
                let sent = self.socket.send_packet(&destination, &datagram);

                self.peers[index].remove_sent_unreliable_commands();
                self.check_disconnect_later(index)?;

                let sent_length = sent?;
                self.total_sent_data += sent_length as u32;
                self.total_sent_packets += 1;

                if self.peers[index].continue_sending {
                    continue_until = send_pass + 1;
                }
            }

            send_pass += 1;
        }

        Ok(false)
    }

    fn update_packet_loss(&mut self, index: usize) {
        let peer = &mut self.peers[index];

        if peer.packet_loss_epoch == 0 {
            peer.packet_loss_epoch = self.service_time;
        } else if time_difference(self.service_time, peer.packet_loss_epoch)
            >= PEER_PACKET_LOSS_INTERVAL
            && peer.packets_sent > 0
        {
            let packet_loss = peer.packets_lost * PEER_PACKET_LOSS_SCALE / peer.packets_sent;

            peer.packet_loss_variance = (peer.packet_loss_variance * 3
                + packet_loss.abs_diff(peer.packet_loss))
                / 4;
            peer.packet_loss = (peer.packet_loss * 7 + packet_loss) / 8;

            peer.packet_loss_epoch = self.service_time;
            peer.packets_sent = 0;
            peer.packets_lost = 0;
        }
    }

    /// Builds the final datagram bytes: header, optional checksum word,
    /// optionally compressed command region.
    fn finalize_datagram(&mut self, index: usize, frame: &DatagramBuilder) -> Vec<u8> {
        let outgoing_peer_id = self.peers[index].outgoing_peer_id;
        let outgoing_session_id = self.peers[index].outgoing_session_id;
        let connect_id = self.peers[index].connect_id;

        let mut header_flags = 0u16;
        let sent_time = if frame.needs_sent_time {
            header_flags |= HEADER_FLAG_SENT_TIME;
            Some((self.service_time & 0xFFFF) as u16)
        } else {
            None
        };

        let mut compressed: Option<Vec<u8>> = None;
        if let Some(compressor) = self.compressor.as_mut() {
            let mut output = vec![0u8; frame.commands.len()];
            let size = compressor.compress(&frame.commands, &mut output, frame.commands.len());
            if size > 0 && size < frame.commands.len() {
                output.truncate(size);
                header_flags |= HEADER_FLAG_COMPRESSED;
                compressed = Some(output);
            }
        }

        if outgoing_peer_id < MAXIMUM_PEER_ID {
            header_flags |= (outgoing_session_id as u16) << HEADER_SESSION_SHIFT;
        }

        let mut datagram = Vec::with_capacity(frame.commands.len() + 8);
        encode_header(&mut datagram, outgoing_peer_id | header_flags, sent_time);

        if let Some(checksum) = self.checksum.as_mut() {
            // The checksum word carries the connect id during computation,
            // and is computed over the uncompressed command region.
            let word = if outgoing_peer_id < MAXIMUM_PEER_ID { connect_id } else { 0 };
            let offset = datagram.len();
            datagram.extend_from_slice(&word.to_be_bytes());

            let mut coverage = datagram.clone();
            coverage.extend_from_slice(&frame.commands);
            let value = checksum.checksum(&coverage);
            datagram[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
        }

        match compressed {
            Some(bytes) => datagram.extend_from_slice(&bytes),
            None => datagram.extend_from_slice(&frame.commands),
        }

        datagram
    }

    // ===== Bandwidth throttle =====

    /// Periodically redistributes outgoing bandwidth across connected peers
    /// and, when limits changed, advertises per-peer incoming allowances.
    fn bandwidth_throttle(&mut self) {
        let time_current = self.clock.now_ms();
        let elapsed_time = time_current.wrapping_sub(self.bandwidth_throttle_epoch);

        if elapsed_time < HOST_BANDWIDTH_THROTTLE_INTERVAL {
            return;
        }

        self.bandwidth_throttle_epoch = time_current;

        let mut peers_remaining = self.connected_peers() as u32;
        if peers_remaining == 0 {
            return;
        }

        let mut data_total = u32::MAX;
        let mut bandwidth = u32::MAX;
        let mut needs_adjustment = self.bandwidth_limited_peers() > 0;

        if self.outgoing_bandwidth != 0 {
            data_total = 0;
            bandwidth = scaled_bandwidth(self.outgoing_bandwidth, elapsed_time);

            for peer in &self.peers {
                if !peer.state.is_connected() {
                    continue;
                }
                data_total = data_total.saturating_add(peer.outgoing_data_total);
            }
        }

        // Fixed-point iteration: cap peers whose fair share exceeds their
        // advertised incoming capacity, then re-share the remainder.
        let mut throttle;
        while peers_remaining > 0 && needs_adjustment {
            needs_adjustment = false;

            throttle = if data_total <= bandwidth {
                PEER_PACKET_THROTTLE_SCALE
            } else {
                scaled_share(bandwidth, data_total)
            };

            for peer in &mut self.peers {
                if !peer.state.is_connected()
                    || peer.incoming_bandwidth == 0
                    || peer.outgoing_bandwidth_throttle_epoch == time_current
                {
                    continue;
                }

                let peer_bandwidth = scaled_bandwidth(peer.incoming_bandwidth, elapsed_time);
                if (throttle as u64 * peer.outgoing_data_total as u64
                    / PEER_PACKET_THROTTLE_SCALE as u64)
                    <= peer_bandwidth as u64
                {
                    continue;
                }

                peer.throttle.limit = scaled_share(peer_bandwidth, peer.outgoing_data_total).max(1);
                peer.throttle.value = peer.throttle.value.min(peer.throttle.limit);

                peer.outgoing_bandwidth_throttle_epoch = time_current;
                peer.incoming_data_total = 0;
                peer.outgoing_data_total = 0;

                needs_adjustment = true;
                peers_remaining -= 1;
                bandwidth = bandwidth.saturating_sub(peer_bandwidth);
                data_total = data_total.saturating_sub(peer_bandwidth);
            }
        }

        if peers_remaining > 0 {
            throttle = if data_total <= bandwidth {
                PEER_PACKET_THROTTLE_SCALE
            } else {
                scaled_share(bandwidth, data_total)
            };

            for peer in &mut self.peers {
                if !peer.state.is_connected()
                    || peer.outgoing_bandwidth_throttle_epoch == time_current
                {
                    continue;
                }

                peer.throttle.limit = throttle;
                peer.throttle.value = peer.throttle.value.min(throttle);
                peer.incoming_data_total = 0;
                peer.outgoing_data_total = 0;
            }
        }

        if self.recalculate_bandwidth_limits {
            self.recalculate_bandwidth_limits = false;

            let mut peers_remaining = self.connected_peers() as u32;
            let mut bandwidth = self.incoming_bandwidth;
            let mut needs_adjustment = true;
            let mut bandwidth_limit = 0u32;

            if bandwidth != 0 {
                while peers_remaining > 0 && needs_adjustment {
                    needs_adjustment = false;
                    bandwidth_limit = bandwidth / peers_remaining;

                    for peer in &mut self.peers {
                        if !peer.state.is_connected()
                            || peer.incoming_bandwidth_throttle_epoch == time_current
                        {
                            continue;
                        }
                        if peer.outgoing_bandwidth > 0
                            && peer.outgoing_bandwidth >= bandwidth_limit
                        {
                            continue;
                        }

                        peer.incoming_bandwidth_throttle_epoch = time_current;
                        needs_adjustment = true;
                        peers_remaining -= 1;
                        bandwidth = bandwidth.saturating_sub(peer.outgoing_bandwidth);
                    }
                }
            }

            let host_outgoing_bandwidth = self.outgoing_bandwidth;
            for peer in &mut self.peers {
                if !peer.state.is_connected() {
                    continue;
                }

                let incoming_bandwidth = if peer.incoming_bandwidth_throttle_epoch == time_current
                {
                    peer.outgoing_bandwidth
                } else {
                    bandwidth_limit
                };

                let command = ProtocolCommand::new(
                    CommandHeader::control(COMMAND_FLAG_ACKNOWLEDGE),
                    CommandKind::BandwidthLimit {
                        incoming_bandwidth,
                        outgoing_bandwidth: host_outgoing_bandwidth,
                    },
                );
                peer.queue_outgoing_command(command, 0, 0);
            }
        }
    }

    // ===== Service loop =====

    /// Surfaces a pending event without touching the socket.
    pub fn check_events(&mut self) -> Option<Event> {
        let mut event = None;
        self.dispatch_incoming_commands(&mut event);
        event
    }

    /// Sends any queued commands without blocking and without surfacing
    /// events or running timeout checks.
    pub fn flush(&mut self) -> Result<()> {
        self.service_time = self.clock.now_ms();
        let mut event = None;
        self.send_outgoing_commands(&mut event, false, false)?;
        Ok(())
    }

    /// Pumps the host: dispatch pending events, throttle bandwidth, send,
    /// receive, send again, and wait on the socket until `timeout`
    /// milliseconds have passed or an event surfaces.
    pub fn service(&mut self, timeout: u32) -> Result<Option<Event>> {
        let mut event = None;
        if self.dispatch_incoming_commands(&mut event) {
            return Ok(event);
        }

        self.service_time = self.clock.now_ms();
        let deadline = self.service_time.wrapping_add(timeout);

        loop {
            if time_difference(self.service_time, self.bandwidth_throttle_epoch)
                >= HOST_BANDWIDTH_THROTTLE_INTERVAL
            {
                self.bandwidth_throttle();
            }

            if self.send_outgoing_commands(&mut event, true, true)? {
                return Ok(event);
            }
            if self.receive_incoming_commands(&mut event)? {
                return Ok(event);
            }
            if self.send_outgoing_commands(&mut event, true, true)? {
                return Ok(event);
            }
            if self.dispatch_incoming_commands(&mut event) {
                return Ok(event);
            }

            if time_greater_equal(self.service_time, deadline) {
                return Ok(None);
            }

            loop {
                self.service_time = self.clock.now_ms();
                if time_greater_equal(self.service_time, deadline) {
                    return Ok(None);
                }
                if self
                    .socket
                    .wait_receive(time_difference(deadline, self.service_time))?
                {
                    break;
                }
            }

            self.service_time = self.clock.now_ms();
        }
    }

    /// The service time sampled at the top of the current service iteration.
    pub fn service_time(&self) -> u32 {
        self.service_time
    }
}
