//! Wire format of the host commands.
//!
//! Every exchange starts with a two byte [CommandHeader]. All multi-byte fields are little endian.

use bitfield_struct::bitfield;
use macro_bits::serializable_enum;

use crate::{
    irq::Interrupt,
    packet::{Priority, QueueCounters, QueueStatus},
    radio::RadioCounters,
};

/// Size of the transfer buffer, which bounds all payloads.
pub const MAX_PAYLOAD_SIZE: usize = 256;

serializable_enum! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    /// Identifiers of the host commands.
    pub enum CommandId: u8 {
        NoOp => 0x00,
        GetInfo => 0x01,
        RadioConfig => 0x02,
        GetStatus => 0x03,
        IrqConfig => 0x04,
        GetPacketQueueStatus => 0x05,
        ReadPacket => 0x06,
        TransmitPacket => 0x07,
        BeaconConfig => 0x08,
        GetCounters => 0x09,
        IrqStatus => 0x0a
    }
}
impl CommandId {
    /// Number of defined commands.
    pub const COUNT: usize = 11;
}

/// The header preceding every exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandHeader {
    /// Command identifier, without the direction bit.
    pub command: u8,
    /// The host reads a response, instead of writing a payload.
    pub is_read: bool,
    /// Number of payload bytes, in the direction indicated by [Self::is_read].
    pub payload_length: u8,
}
impl CommandHeader {
    pub const LENGTH: usize = 2;
    const READ_FLAG: u8 = 0x80;

    pub const fn from_bytes(bytes: [u8; Self::LENGTH]) -> Self {
        Self {
            command: bytes[0] & !Self::READ_FLAG,
            is_read: bytes[0] & Self::READ_FLAG != 0,
            payload_length: bytes[1],
        }
    }
    pub const fn to_bytes(&self) -> [u8; Self::LENGTH] {
        let direction = if self.is_read { Self::READ_FLAG } else { 0 };
        [self.command | direction, self.payload_length]
    }
}

/// Device and firmware information returned by GetInfo.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub firmware_major: u8,
    pub firmware_minor: u8,
    /// Build revision as ASCII, padded with zeroes.
    pub firmware_build: [u8; 8],
    pub hardware_revision: u8,
    /// The device has dedicated private storage.
    pub private_storage: bool,
    /// Serial number as ASCII, padded with zeroes.
    pub serial: [u8; 16],
    pub eui64: [u8; 8],
}
impl DeviceIdentity {
    /// Length of the GetInfo response.
    pub const INFO_LENGTH: usize = 38;
    const PRIVATE_STORAGE: u8 = 1 << 0;

    /// Encode the GetInfo response.
    pub fn to_info_bytes(&self, max_tx_power: u16) -> [u8; Self::INFO_LENGTH] {
        let mut info = [0u8; Self::INFO_LENGTH];
        info[0] = 1;
        info[1] = self.firmware_major;
        info[2] = self.firmware_minor;
        info[3..11].copy_from_slice(&self.firmware_build);
        info[11] = self.hardware_revision;
        info[12] = if self.private_storage {
            Self::PRIVATE_STORAGE
        } else {
            0
        };
        info[13..29].copy_from_slice(&self.serial);
        info[29..37].copy_from_slice(&self.eui64);
        info[37] = max_tx_power.min(u8::MAX as u16) as u8;
        info
    }
}

/// Payload of a RadioConfig write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RadioConfigRequest {
    pub channel: u16,
    /// Transmit power in deci-dBm.
    pub tx_power: u16,
    pub address: u16,
}
impl RadioConfigRequest {
    pub const LENGTH: usize = 6;

    pub fn parse(payload: &[u8]) -> Option<Self> {
        let payload: &[u8; Self::LENGTH] = payload.get(..Self::LENGTH)?.try_into().ok()?;
        Some(Self {
            channel: u16::from_le_bytes([payload[0], payload[1]]),
            tx_power: u16::from_le_bytes([payload[2], payload[3]]),
            address: u16::from_le_bytes([payload[4], payload[5]]),
        })
    }
}

/// Response to GetStatus.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct StatusFlags {
    /// A command failed since the last status read.
    pub error: bool,
    pub radio_active: bool,
    pub rx_queue_not_empty: bool,
    pub rx_queue_full: bool,
    pub rx_queue_overflow: bool,
    pub tx_queue_empty: bool,
    pub tx_queue_overflow: bool,
    #[bits(1)]
    __: u8,
}
impl StatusFlags {
    pub fn from_status(error: bool, radio_active: bool, queue: &QueueStatus) -> Self {
        Self::new()
            .with_error(error)
            .with_radio_active(radio_active)
            .with_rx_queue_not_empty(!queue.rx_empty)
            .with_rx_queue_full(queue.rx_full)
            .with_rx_queue_overflow(queue.rx_overflow)
            .with_tx_queue_empty(queue.tx_empty)
            .with_tx_queue_overflow(queue.tx_overflow)
    }
}

/// First byte of the GetPacketQueueStatus response.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct PacketQueueFlags {
    /// At least one received packet is waiting.
    pub rx_pending: bool,
    pub tx_queue_empty: bool,
    #[bits(6)]
    __: u8,
}

/// Encode the GetPacketQueueStatus response.
pub fn encode_packet_queue_status(status: &QueueStatus) -> [u8; 3] {
    let flags = PacketQueueFlags::new()
        .with_rx_pending(!status.rx_empty)
        .with_tx_queue_empty(status.tx_empty);
    let next_length = status.rx_next_length.unwrap_or(0) as u16;
    let next_length = next_length.to_le_bytes();
    [flags.into_bits(), next_length[0], next_length[1]]
}

/// First byte of a TransmitPacket write.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct TransmitFlags {
    #[bits(2)]
    pub priority: u8,
    #[bits(6)]
    __: u8,
}
impl TransmitFlags {
    pub const fn transmit_priority(&self) -> Priority {
        Priority::from_wire(self.priority())
    }
}

/// First byte of a BeaconConfig write.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct BeaconConfigFlags {
    /// Apply the enabled flag and interval.
    pub update_config: bool,
    pub enabled: bool,
    #[bits(6)]
    __: u8,
}

/// Payload of a BeaconConfig write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BeaconConfigRequest<'a> {
    pub flags: BeaconConfigFlags,
    pub interval_ms: u16,
    /// The new beacon frame, if not empty.
    pub frame: &'a [u8],
}
impl<'a> BeaconConfigRequest<'a> {
    /// Length of the fixed part.
    pub const HEADER_LENGTH: usize = 3;

    pub fn parse(payload: &'a [u8]) -> Option<Self> {
        if payload.len() < Self::HEADER_LENGTH {
            return None;
        }
        let (header, frame) = payload.split_at(Self::HEADER_LENGTH);
        Some(Self {
            flags: BeaconConfigFlags::from_bits(header[0]),
            interval_ms: u16::from_le_bytes([header[1], header[2]]),
            frame,
        })
    }
}

/// Length of the GetCounters response.
pub const COUNTERS_LENGTH: usize = 64;

/// Encode the GetCounters response.
pub fn encode_counters(
    ticks: u32,
    queue: &QueueCounters,
    radio: &RadioCounters,
) -> [u8; COUNTERS_LENGTH] {
    let fields = [
        ticks,
        queue.rx.queue_full,
        queue.rx.budget_exceeded,
        queue.rx.allocation_failed,
        queue.tx.queue_full,
        queue.tx.budget_exceeded,
        queue.tx.allocation_failed,
        radio.rx_frames,
        radio.rx_fifo_overflows,
        radio.rx_frame_errors,
        radio.tx_frames,
        radio.tx_channel_busy,
        radio.tx_dropped,
        radio.tx_fifo_short,
        radio.tx_aborted,
        radio.acks_sent,
    ];
    let mut bytes = [0u8; COUNTERS_LENGTH];
    for (chunk, field) in bytes.chunks_exact_mut(4).zip(fields) {
        chunk.copy_from_slice(&field.to_le_bytes());
    }
    bytes
}

/// Decode the interrupt bits of IrqConfig and IrqStatus.
pub fn parse_interrupts(payload: &[u8]) -> Option<Interrupt> {
    payload.first().copied().map(Interrupt::from_bits_truncate)
}
