//! User-facing packet type and delivery flags.

use relink_core::shared::SharedBytes;

/// Delivery flags attached to a packet.
///
/// Payload sharing means flags describe a send, not a buffer: broadcasting
/// the same bytes reliably on one channel and unsequenced on another is two
/// packets over one `SharedBytes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(u32);

impl PacketFlags {
    /// No flags: unreliable, sequenced delivery.
    pub const NONE: PacketFlags = PacketFlags(0);
    /// The packet must arrive, retransmitted until acknowledged.
    pub const RELIABLE: PacketFlags = PacketFlags(1 << 0);
    /// The packet skips sequencing entirely, guarded only by the replay window.
    pub const UNSEQUENCED: PacketFlags = PacketFlags(1 << 1);
    /// An oversized packet may be sent as unreliable fragments instead of
    /// being promoted to reliable.
    pub const UNRELIABLE_FRAGMENT: PacketFlags = PacketFlags(1 << 3);

    /// True when every flag in `other` is set in `self`.
    pub fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when no flags are set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for PacketFlags {
    type Output = PacketFlags;
    fn bitor(self, rhs: PacketFlags) -> PacketFlags {
        PacketFlags(self.0 | rhs.0)
    }
}

/// A payload plus its delivery flags.
///
/// The payload is reference counted; fragments and reassembly slots hold
/// views into the same buffer rather than copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    flags: PacketFlags,
    data: SharedBytes,
}

impl Packet {
    /// Creates a packet with explicit flags.
    pub fn new(data: impl Into<SharedBytes>, flags: PacketFlags) -> Self {
        Self { flags, data: data.into() }
    }

    /// Creates a reliable packet.
    pub fn reliable(data: impl Into<SharedBytes>) -> Self {
        Self::new(data, PacketFlags::RELIABLE)
    }

    /// Creates an unreliable, sequenced packet.
    pub fn unreliable(data: impl Into<SharedBytes>) -> Self {
        Self::new(data, PacketFlags::NONE)
    }

    /// Creates an unsequenced packet.
    pub fn unsequenced(data: impl Into<SharedBytes>) -> Self {
        Self::new(data, PacketFlags::UNSEQUENCED)
    }

    /// Creates an unreliable packet that may fragment without becoming reliable.
    pub fn unreliable_fragment(data: impl Into<SharedBytes>) -> Self {
        Self::new(data, PacketFlags::UNRELIABLE_FRAGMENT)
    }

    /// Returns the payload bytes.
    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Returns the shared payload view.
    pub fn shared(&self) -> &SharedBytes {
        &self.data
    }

    /// Consumes the packet, returning the shared payload.
    pub fn into_shared(self) -> SharedBytes {
        self.data
    }

    /// Returns the payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the delivery flags.
    pub fn flags(&self) -> PacketFlags {
        self.flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_combinations() {
        let flags = PacketFlags::RELIABLE | PacketFlags::UNSEQUENCED;
        assert!(flags.contains(PacketFlags::RELIABLE));
        assert!(flags.contains(PacketFlags::UNSEQUENCED));
        assert!(!flags.contains(PacketFlags::UNRELIABLE_FRAGMENT));
        assert!(PacketFlags::NONE.is_empty());
    }

    #[test]
    fn test_constructors() {
        assert!(Packet::reliable(vec![1]).flags().contains(PacketFlags::RELIABLE));
        assert!(Packet::unreliable(vec![1]).flags().is_empty());
        assert!(Packet::unsequenced(vec![1]).flags().contains(PacketFlags::UNSEQUENCED));
        assert!(Packet::unreliable_fragment(vec![1]).flags().contains(PacketFlags::UNRELIABLE_FRAGMENT));
    }

    #[test]
    fn test_cloning_shares_payload() {
        let packet = Packet::reliable(vec![1, 2, 3]);
        let copy = packet.clone();
        assert_eq!(packet.shared().reference_count(), 2);
        assert_eq!(copy.data(), packet.data());
    }
}
