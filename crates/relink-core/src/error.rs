use std::{fmt, io};

/// Convenience alias for results produced by this workspace.
pub type Result<T> = std::result::Result<T, ErrorKind>;

/// Describes what part of a datagram failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodingErrorKind {
    /// The datagram header was shorter than the fixed prefix.
    DatagramHeader,
    /// A command number outside the valid range was encountered.
    CommandNumber,
    /// A command record extended past the end of the datagram.
    CommandTooShort,
    /// A command's payload extended past the end of the datagram.
    PayloadOutOfBounds,
}

impl fmt::Display for DecodingErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodingErrorKind::DatagramHeader => write!(f, "datagram header truncated"),
            DecodingErrorKind::CommandNumber => write!(f, "command number out of range"),
            DecodingErrorKind::CommandTooShort => write!(f, "command record truncated"),
            DecodingErrorKind::PayloadOutOfBounds => write!(f, "command payload out of bounds"),
        }
    }
}

/// Errors surfaced by the transport.
#[derive(Debug)]
pub enum ErrorKind {
    /// An I/O error from the underlying socket.
    IoError(io::Error),
    /// A datagram failed to decode.
    DecodingError(DecodingErrorKind),
    /// A send was attempted on a peer that is not connected.
    PeerNotConnected,
    /// The channel id is outside the negotiated channel count.
    InvalidChannel,
    /// The packet exceeds the host's maximum packet size.
    PacketTooLarge,
    /// Fragmenting the packet would exceed the fragment count limit.
    TooManyFragments,
    /// No disconnected peer slot was available.
    NoAvailablePeers,
    /// The peer id does not name a peer on this host.
    InvalidPeer,
    /// A command inside a datagram violated the protocol.
    MalformedCommand,
    /// The peer's buffered incoming data exceeds the configured cap.
    MaximumWaitingData,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::IoError(e) => write!(f, "io error: {}", e),
            ErrorKind::DecodingError(e) => write!(f, "decoding error: {}", e),
            ErrorKind::PeerNotConnected => write!(f, "peer is not connected"),
            ErrorKind::InvalidChannel => write!(f, "channel id out of range"),
            ErrorKind::PacketTooLarge => write!(f, "packet exceeds maximum packet size"),
            ErrorKind::TooManyFragments => write!(f, "fragment count exceeds the limit"),
            ErrorKind::NoAvailablePeers => write!(f, "no free peer slot available"),
            ErrorKind::InvalidPeer => write!(f, "no such peer"),
            ErrorKind::MalformedCommand => write!(f, "malformed protocol command"),
            ErrorKind::MaximumWaitingData => write!(f, "peer exceeded maximum waiting data"),
        }
    }
}

impl std::error::Error for ErrorKind {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ErrorKind::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ErrorKind {
    fn from(e: io::Error) -> Self {
        ErrorKind::IoError(e)
    }
}

impl From<DecodingErrorKind> for ErrorKind {
    fn from(e: DecodingErrorKind) -> Self {
        ErrorKind::DecodingError(e)
    }
}

impl PartialEq for ErrorKind {
    fn eq(&self, other: &Self) -> bool {
        use ErrorKind::*;
        match (self, other) {
            (IoError(a), IoError(b)) => a.kind() == b.kind(),
            (DecodingError(a), DecodingError(b)) => a == b,
            (PeerNotConnected, PeerNotConnected)
            | (InvalidChannel, InvalidChannel)
            | (PacketTooLarge, PacketTooLarge)
            | (TooManyFragments, TooManyFragments)
            | (NoAvailablePeers, NoAvailablePeers)
            | (InvalidPeer, InvalidPeer)
            | (MalformedCommand, MalformedCommand)
            | (MaximumWaitingData, MaximumWaitingData) => true,
            _ => false,
        }
    }
}
