use alloc::{sync::Arc, vec::Vec};
use core::mem::size_of;

use macro_bits::serializable_enum;

use super::{QueueError, QueueResult};

serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
    /// Transmit priority of a packet.
    ///
    /// Higher priorities always go first. There is no aging, so a saturated high priority queue
    /// starves the lower ones.
    pub enum Priority: u8 {
        Background => 0x00,
        #[default]
        Normal => 0x01,
        RealTime => 0x02,
        NetworkControl => 0x03
    }
}
impl Priority {
    /// Number of priority levels.
    pub const COUNT: usize = 4;
    /// All priorities, from highest to lowest.
    pub const DESCENDING: [Priority; Self::COUNT] = [
        Priority::NetworkControl,
        Priority::RealTime,
        Priority::Normal,
        Priority::Background,
    ];

    /// Decode the two priority bits from the host.
    pub const fn from_wire(bits: u8) -> Self {
        match bits & 0b11 {
            0x00 => Self::Background,
            0x01 => Self::Normal,
            0x02 => Self::RealTime,
            _ => Self::NetworkControl,
        }
    }
    /// Index of the queue for this priority.
    pub(crate) const fn index(&self) -> usize {
        (self.into_bits() & 0b11) as usize
    }
}

/// Copy `payload` into a freshly allocated vector, without aborting if the heap is exhausted.
fn try_copy(payload: &[u8]) -> QueueResult<Vec<u8>> {
    let mut data = Vec::new();
    data.try_reserve_exact(payload.len())
        .map_err(|_| QueueError::AllocationFailed)?;
    data.extend_from_slice(payload);
    Ok(data)
}

/// Signal information of a received frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RxInfo {
    /// Received signal strength in dBm.
    pub rssi: i8,
    /// Link quality, where 0 is the worst and 255 the best.
    pub lqi: u8,
    /// Our short address at the time of reception, used to decide if we owe an acknowledgement.
    pub local_address: u16,
}

/// A received packet, waiting to be read by the host.
#[derive(Debug)]
pub struct RxPacket {
    rssi: i8,
    lqi: u8,
    ack_owed: bool,
    data: Vec<u8>,
}
impl RxPacket {
    pub(crate) fn new(payload: &[u8], info: &RxInfo, ack_owed: bool) -> QueueResult<Self> {
        Ok(Self {
            rssi: info.rssi,
            lqi: info.lqi,
            ack_owed,
            data: try_copy(payload)?,
        })
    }
    /// Number of bytes charged against the receive budget for a packet of this length.
    pub(crate) const fn footprint(length: usize) -> usize {
        size_of::<Self>() + length
    }
    pub(crate) fn charged_bytes(&self) -> usize {
        Self::footprint(self.data.len())
    }
    /// The frame, starting at the MAC header.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    pub fn rssi(&self) -> i8 {
        self.rssi
    }
    pub fn lqi(&self) -> u8 {
        self.lqi
    }
    /// Check if the frame requested an acknowledgement addressed to us.
    pub fn ack_owed(&self) -> bool {
        self.ack_owed
    }
}

#[derive(Debug)]
struct TxPacketInner {
    sticky: bool,
    data: Vec<u8>,
}

/// A packet to be transmitted.
///
/// The payload is immutable after allocation. Cloning only clones the handle: this is how sticky
/// packets (like beacon frames) are submitted over and over again while their owner keeps them.
#[derive(Clone, Debug)]
pub struct TxPacket {
    inner: Arc<TxPacketInner>,
}
impl TxPacket {
    pub(crate) fn new(payload: &[u8], sticky: bool) -> QueueResult<Self> {
        Ok(Self {
            inner: Arc::new(TxPacketInner {
                sticky,
                data: try_copy(payload)?,
            }),
        })
    }
    pub(crate) const fn footprint(length: usize) -> usize {
        size_of::<TxPacketInner>() + length
    }
    pub(crate) fn charged_bytes(&self) -> usize {
        Self::footprint(self.inner.data.len())
    }
    /// The frame, starting at the MAC header.
    pub fn data(&self) -> &[u8] {
        &self.inner.data
    }
    pub fn len(&self) -> usize {
        self.inner.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.inner.data.is_empty()
    }
    /// Sticky packets survive transmission and are only released by a forced discard.
    pub fn is_sticky(&self) -> bool {
        self.inner.sticky
    }
    /// Check if both handles refer to the same buffer.
    pub fn same_buffer(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
