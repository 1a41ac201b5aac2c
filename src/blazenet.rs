//! BlazeNet link layer framing.
//!
//! Every frame on air starts with a one byte PHY header holding the length of the rest of the
//! frame, followed by the [MacHeader]. If the security enabled flag is set, a [SecurityHeader] and
//! a key identifier follow. The remainder is the payload.
//!
//! All multi-byte fields are little endian.

use bitfield_struct::bitfield;

/// Version of the frame structures, as announced in the network beacon.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Maximum size of a frame, excluding the PHY header.
pub const MAX_PACKET_SIZE: usize = 255;

/// Length of the PHY header.
pub const PHY_HEADER_LENGTH: usize = 1;

/// A short (16-bit) device address, assigned on association.
pub type ShortAddress = u16;

/// The broadcast address.
pub const BROADCAST_ADDRESS: ShortAddress = 0xffff;
/// This value is never assigned to a device.
pub const UNASSIGNED_ADDRESS: ShortAddress = 0x0000;

/// Check if a short address may be used as the address of this device.
pub const fn is_valid_device_address(address: ShortAddress) -> bool {
    address != UNASSIGNED_ADDRESS && address != BROADCAST_ADDRESS
}

/// Endpoints a frame may be addressed to.
pub mod endpoint {
    /// Network control traffic.
    pub const NET_CONTROL: u8 = 0b000;
    /// Acknowledgement of a frame, which requested one. Carries no payload.
    pub const ACK_RESPONSE: u8 = 0b001;
    /// Data passed upwards to the user's stack.
    pub const USER_DATA: u8 = 0b010;
}

/// The flags byte of the [MacHeader].
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct HeaderFlags {
    /// A [SecurityHeader] follows the MAC header.
    pub security_enabled: bool,
    /// The source has more data buffered for the destination.
    pub data_pending: bool,
    /// The destination should acknowledge this frame.
    pub ack_request: bool,
    /// See [endpoint].
    #[bits(3)]
    pub endpoint: u8,
    #[bits(2)]
    __: u8,
}

/// The fixed header at the start of every frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MacHeader {
    pub flags: HeaderFlags,
    /// Used to correlate acknowledgements and replies.
    pub sequence: u8,
    pub source: ShortAddress,
    pub destination: ShortAddress,
}
impl MacHeader {
    /// Length of the header on air.
    pub const LENGTH: usize = 6;

    /// Parse the header from the start of a frame.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        let header: &[u8; Self::LENGTH] = frame.get(..Self::LENGTH)?.try_into().ok()?;
        Some(Self {
            flags: HeaderFlags::from_bits(header[0]),
            sequence: header[1],
            source: u16::from_le_bytes([header[2], header[3]]),
            destination: u16::from_le_bytes([header[4], header[5]]),
        })
    }
    /// Serialize the header.
    pub fn to_bytes(&self) -> [u8; Self::LENGTH] {
        let source = self.source.to_le_bytes();
        let destination = self.destination.to_le_bytes();
        [
            self.flags.into_bits(),
            self.sequence,
            source[0],
            source[1],
            destination[0],
            destination[1],
        ]
    }
    /// Check if we have to acknowledge this frame, when received with `local_address`.
    ///
    /// Acknowledgements and broadcasts are never acknowledged.
    pub fn wants_ack(&self, local_address: ShortAddress) -> bool {
        self.flags.ack_request()
            && self.flags.endpoint() != endpoint::ACK_RESPONSE
            && self.destination != BROADCAST_ADDRESS
            && self.destination == local_address
    }
    /// Build the header of the acknowledgement for `received`.
    ///
    /// The sequence number is copied and the addresses are swapped.
    pub fn ack_for(received: &Self) -> Self {
        Self {
            flags: HeaderFlags::new().with_endpoint(endpoint::ACK_RESPONSE),
            sequence: received.sequence,
            source: received.destination,
            destination: received.source,
        }
    }
}

/// Check if a received frame must be acknowledged.
pub fn ack_owed(frame: &[u8], local_address: ShortAddress) -> bool {
    MacHeader::parse(frame).is_some_and(|header| header.wants_ack(local_address))
}

/// Security schemes, which can protect a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SecurityScheme {
    /// Only replay protection through the frame counter.
    None,
    /// AES-CCM-128, with a 16 byte tag trailer.
    AesCcm128,
    /// AES-CTR-128, without authentication.
    AesCtr128,
    /// ChaCha20-Poly1305, with a 16 byte tag trailer.
    ChaCha20Poly1305,
    Unknown(u8),
}
impl SecurityScheme {
    pub const fn from_bits(value: u8) -> Self {
        match value {
            0x00 => Self::None,
            0x01 => Self::AesCcm128,
            0x02 => Self::AesCtr128,
            0x03 => Self::ChaCha20Poly1305,
            other => Self::Unknown(other),
        }
    }
    /// Check if a key identifier follows the [SecurityHeader].
    pub const fn requires_key(&self) -> bool {
        matches!(
            self,
            Self::AesCcm128 | Self::AesCtr128 | Self::ChaCha20Poly1305
        )
    }
    /// Length of the authentication tag at the end of the frame.
    pub const fn tag_length(&self) -> usize {
        match self {
            Self::AesCcm128 | Self::ChaCha20Poly1305 => 16,
            _ => 0,
        }
    }
}

/// Follows the [MacHeader], if security is enabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SecurityHeader {
    pub scheme: SecurityScheme,
    /// Monotonic frame counter, used for replay protection and as nonce.
    pub counter: u32,
}
impl SecurityHeader {
    pub const LENGTH: usize = 5;

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let header: &[u8; Self::LENGTH] = bytes.get(..Self::LENGTH)?.try_into().ok()?;
        Some(Self {
            scheme: SecurityScheme::from_bits(header[0]),
            counter: u32::from_le_bytes([header[1], header[2], header[3], header[4]]),
        })
    }
}

/// Identifies the key used to protect a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyId {
    /// The key of the association.
    Association(u8),
    /// An explicitly identified key.
    Long(u32),
}
impl KeyId {
    const LONG_FLAG: u8 = 0x80;

    /// Parse the key id, returning it together with its length on air.
    pub fn parse(bytes: &[u8]) -> Option<(Self, usize)> {
        let index = *bytes.first()?;
        if index & Self::LONG_FLAG == 0 {
            return Some((Self::Association(index), 1));
        }
        let key_id: [u8; 4] = bytes.get(1..5)?.try_into().ok()?;
        Some((Self::Long(u32::from_le_bytes(key_id)), 5))
    }
}

/// Returns the offset of the payload in `frame`.
///
/// This skips the MAC header and, if present, the security headers.
pub fn payload_offset(frame: &[u8]) -> Option<usize> {
    let header = MacHeader::parse(frame)?;
    if !header.flags.security_enabled() {
        return Some(MacHeader::LENGTH);
    }
    let mut offset = MacHeader::LENGTH;
    let security = SecurityHeader::parse(&frame[offset..])?;
    offset += SecurityHeader::LENGTH;
    if security.scheme.requires_key() {
        let (_, length) = KeyId::parse(&frame[offset..])?;
        offset += length;
    }
    Some(offset)
}
