//! # Radio link
//! The radio link ties the transceiver to the packet queues.
//!
//! The transceiver is abstracted through the [RadioDriver] trait. Its interrupt handler only
//! reports what happened through [RadioMailbox::notify], all actual work happens in the
//! [RadioTask], which also receives transmit and acknowledgement requests through the mailbox.
//!
//! The host changes the link configuration through [RadioControl], which is implemented by
//! [RadioLink]. Changing the configuration idles the radio, flushes the FIFOs and restarts
//! reception. A transmission aborted by this is reported by the driver as
//! [RadioEvents::TX_ABORTED].

mod task;

use core::cell::RefCell;

use bitflags::bitflags;
use embassy_futures::select::{select, Either};
use embassy_sync::{
    blocking_mutex::{self, raw::CriticalSectionRawMutex},
    channel::{Channel, TrySendError},
};

pub use task::RadioTask;

use crate::{
    blazenet::{self, MacHeader, ShortAddress},
    packet::TxPacket,
    sync::NotifyBits,
    DefaultRawMutex,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RadioError {
    /// The transceiver doesn't support this channel.
    InvalidChannel,
    /// The transmit power exceeds the configured maximum.
    InvalidTxPower,
    /// The address is either unassigned or the broadcast address.
    InvalidAddress,
    /// The transceiver rejected the operation.
    Hardware,
}
pub type RadioResult<T> = Result<T, RadioError>;

/// Parameters of the CSMA/CA channel access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CsmaConfig {
    /// Minimum backoff exponent.
    pub min_backoff_exponent: u8,
    /// Maximum backoff exponent.
    pub max_backoff_exponent: u8,
    /// Number of clear channel assessments, before giving up.
    pub tries: u8,
    /// Energy level in dBm, above which the channel is considered busy.
    pub cca_threshold: i8,
    /// Length of one backoff period in µs.
    pub backoff_period: u16,
    /// How long the channel is sampled in µs.
    pub listen_duration: u16,
    /// Upper bound for the whole channel access in µs. Zero means no limit.
    pub timeout: u32,
}
impl Default for CsmaConfig {
    fn default() -> Self {
        Self {
            min_backoff_exponent: 3,
            max_backoff_exponent: 5,
            tries: 5,
            cca_threshold: -75,
            backoff_period: 320,
            listen_duration: 128,
            timeout: 0,
        }
    }
}

/// Configuration of the [RadioLink].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkConfig {
    /// Maximum transmit power in deci-dBm.
    pub max_tx_power: u16,
    /// How often the channel access may fail, before the packet is dropped.
    pub max_csma_retries: u8,
    /// Gate transmissions with CSMA/CA. Otherwise they are started unconditionally.
    pub use_csma: bool,
    pub csma: CsmaConfig,
}
impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_tx_power: 140,
            max_csma_retries: 3,
            use_csma: true,
            csma: CsmaConfig::default(),
        }
    }
}

/// Signal information of a frame read from the receive FIFO.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FrameInfo {
    /// Number of bytes written to the buffer, including the PHY header.
    pub length: usize,
    pub rssi: i8,
    pub lqi: u8,
}

/// The interface to the transceiver.
///
/// Implementations must not block for long. Completion of transmissions and reception of frames
/// is reported asynchronously through [RadioMailbox::notify].
pub trait RadioDriver {
    /// Move the oldest complete frame out of the receive FIFO.
    ///
    /// The frame is written to `buffer` starting with the PHY header. Returns [None] if no frame
    /// is available.
    fn read_frame(&mut self, buffer: &mut [u8]) -> Option<FrameInfo>;
    /// Write a frame, starting with the PHY header, to the transmit FIFO.
    ///
    /// Returns the number of bytes actually written.
    fn load_tx_fifo(&mut self, frame: &[u8]) -> usize;
    /// Start transmitting the contents of the transmit FIFO.
    ///
    /// If `csma` is set, the transmission is gated by channel access, which reports
    /// [RadioEvents::CHANNEL_BUSY] on failure.
    fn start_tx(&mut self, channel: u16, csma: Option<&CsmaConfig>) -> RadioResult<()>;
    /// Stop any ongoing operation.
    fn idle(&mut self);
    /// Flush the receive and transmit FIFOs.
    fn reset_fifos(&mut self);
    /// Start receiving on `channel`.
    fn start_rx(&mut self, channel: u16) -> RadioResult<()>;
    /// Set the transmit power in deci-dBm.
    fn set_tx_power(&mut self, deci_dbm: u16) -> RadioResult<()>;
    /// Set the address used for hardware frame filtering.
    fn set_address(&mut self, address: ShortAddress);
    /// Run the calibrations requested through [RadioEvents::CALIBRATION_NEEDED].
    fn calibrate(&mut self) -> RadioResult<()>;
    /// Check if `channel` exists in the current PHY configuration.
    fn is_valid_channel(&self, channel: u16) -> bool;
    /// Check if the transceiver is receiving or transmitting.
    fn is_active(&self) -> bool;
}

bitflags! {
    /// Events reported by the transceiver's interrupt handler.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct RadioEvents: u32 {
        /// At least one frame is waiting in the receive FIFO.
        const RX_READY = 1 << 0;
        /// The transmission finished.
        const TX_COMPLETE = 1 << 1;
        /// The transmission was aborted.
        const TX_ABORTED = 1 << 2;
        /// Channel access failed for the current attempt.
        const CHANNEL_BUSY = 1 << 3;
        /// The transceiver requests calibration.
        const CALIBRATION_NEEDED = 1 << 4;
        /// The receive FIFO overflowed and frames were lost.
        const RX_FIFO_OVERFLOW = 1 << 5;
        /// A frame was received with an invalid CRC.
        const RX_FRAME_ERROR = 1 << 6;
    }
}
#[cfg(feature = "defmt")]
impl defmt::Format for RadioEvents {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "RadioEvents({=u32:#x})", self.bits())
    }
}

/// Work handed to the radio task.
#[derive(Debug)]
pub enum RadioRequest {
    /// Transmit this packet, which is counted as pending by the queues.
    Transmit(TxPacket),
    /// Acknowledge the frame with this header.
    Acknowledge(MacHeader),
}

/// Depth of the request channel.
///
/// At most one transmit request is outstanding at any time, the rest is for acknowledgements.
pub const RADIO_MAILBOX_DEPTH: usize = 8;

/// What woke up the radio task.
pub enum Wakeup {
    Events(RadioEvents),
    Request(RadioRequest),
}

/// Mailbox of the radio task.
pub struct RadioMailbox {
    events: NotifyBits,
    requests: Channel<CriticalSectionRawMutex, RadioRequest, RADIO_MAILBOX_DEPTH>,
}
impl RadioMailbox {
    pub const fn new() -> Self {
        Self {
            events: NotifyBits::new(),
            requests: Channel::new(),
        }
    }
    /// Report events from the transceiver.
    ///
    /// This is safe to call from an ISR.
    pub fn notify(&self, events: RadioEvents) {
        self.events.signal(events.bits());
    }
    /// Take all events reported since the last call.
    pub fn take_events(&self) -> RadioEvents {
        RadioEvents::from_bits_truncate(self.events.take())
    }
    /// Post a request to the radio task, without waiting.
    ///
    /// If the mailbox is full, the request is returned.
    pub fn request(&self, request: RadioRequest) -> Result<(), RadioRequest> {
        self.requests.try_send(request).map_err(|err| match err {
            TrySendError::Full(request) => request,
        })
    }
    /// Take the oldest request, if any.
    pub fn try_take_request(&self) -> Option<RadioRequest> {
        self.requests.try_receive().ok()
    }
    /// Wait for either events or a request.
    ///
    /// Events take precedence, so completions are processed before new work.
    pub async fn wait(&self) -> Wakeup {
        match select(self.events.wait(), self.requests.receive()).await {
            Either::First(bits) => Wakeup::Events(RadioEvents::from_bits_truncate(bits)),
            Either::Second(request) => Wakeup::Request(request),
        }
    }
}
impl Default for RadioMailbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Performance counters of the radio link.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RadioCounters {
    pub rx_frames: u32,
    pub rx_fifo_overflows: u32,
    /// Frames with an invalid CRC or PHY header.
    pub rx_frame_errors: u32,
    pub tx_frames: u32,
    /// Channel access failures, including retried ones.
    pub tx_channel_busy: u32,
    /// Packets dropped after too many channel access failures.
    pub tx_dropped: u32,
    /// Packets that didn't completely fit into the transmit FIFO.
    pub tx_fifo_short: u32,
    pub tx_aborted: u32,
    pub acks_sent: u32,
}

/// Link configuration and statistics, as seen by the host.
pub trait RadioControl {
    /// Switch to `channel` and restart reception.
    fn set_channel(&self, channel: u16) -> RadioResult<()>;
    fn channel(&self) -> u16;
    /// Set the transmit power in deci-dBm.
    fn set_tx_power(&self, deci_dbm: u16) -> RadioResult<()>;
    fn tx_power(&self) -> u16;
    /// Highest transmit power the host may configure, in deci-dBm.
    fn max_tx_power(&self) -> u16;
    /// Set our short address and restart reception.
    fn set_address(&self, address: ShortAddress) -> RadioResult<()>;
    fn address(&self) -> ShortAddress;
    /// Check if the transceiver is receiving or transmitting.
    fn is_active(&self) -> bool;
    /// Returns the counters and resets them to zero.
    fn take_counters(&self) -> RadioCounters;
}

struct LinkState<D> {
    driver: D,
    channel: u16,
    tx_power: u16,
    address: ShortAddress,
    counters: RadioCounters,
}

/// Shared state of the radio link.
pub struct RadioLink<D: RadioDriver> {
    config: LinkConfig,
    state: blocking_mutex::Mutex<DefaultRawMutex, RefCell<LinkState<D>>>,
}
impl<D: RadioDriver> RadioLink<D> {
    /// Wrap the driver.
    ///
    /// Reception only starts once a valid address was configured by the host.
    pub fn new(driver: D, config: LinkConfig) -> Self {
        Self {
            config,
            state: blocking_mutex::Mutex::new(RefCell::new(LinkState {
                driver,
                channel: 0,
                tx_power: 0,
                address: blazenet::UNASSIGNED_ADDRESS,
                counters: RadioCounters::default(),
            })),
        }
    }
    fn with_state<R>(&self, f: impl FnOnce(&mut LinkState<D>) -> R) -> R {
        self.state.lock(|state| f(&mut state.borrow_mut()))
    }
    /// Run `f` with exclusive access to the driver.
    pub fn with_driver<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        self.with_state(|state| f(&mut state.driver))
    }
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }
    /// Update the counters.
    pub(crate) fn count(&self, f: impl FnOnce(&mut RadioCounters)) {
        self.with_state(|state| f(&mut state.counters));
    }
    /// Returns the counters without resetting them.
    pub fn counters(&self) -> RadioCounters {
        self.with_state(|state| state.counters)
    }
    /// Idle the transceiver, flush the FIFOs and start receiving again.
    fn restart_rx(state: &mut LinkState<D>) -> RadioResult<()> {
        state.driver.idle();
        state.driver.reset_fifos();
        if !blazenet::is_valid_device_address(state.address) {
            trace!("No address assigned yet, not receiving.");
            return Ok(());
        }
        state.driver.start_rx(state.channel)
    }
}
impl<D: RadioDriver> RadioControl for RadioLink<D> {
    fn set_channel(&self, channel: u16) -> RadioResult<()> {
        self.with_state(|state| {
            if !state.driver.is_valid_channel(channel) {
                return Err(RadioError::InvalidChannel);
            }
            trace!("Changing channel to {}.", channel);
            state.channel = channel;
            Self::restart_rx(state)
        })
    }
    fn channel(&self) -> u16 {
        self.with_state(|state| state.channel)
    }
    fn set_tx_power(&self, deci_dbm: u16) -> RadioResult<()> {
        if deci_dbm > self.config.max_tx_power {
            return Err(RadioError::InvalidTxPower);
        }
        self.with_state(|state| {
            state.driver.set_tx_power(deci_dbm)?;
            state.tx_power = deci_dbm;
            Ok(())
        })
    }
    fn tx_power(&self) -> u16 {
        self.with_state(|state| state.tx_power)
    }
    fn max_tx_power(&self) -> u16 {
        self.config.max_tx_power
    }
    fn set_address(&self, address: ShortAddress) -> RadioResult<()> {
        if !blazenet::is_valid_device_address(address) {
            return Err(RadioError::InvalidAddress);
        }
        self.with_state(|state| {
            trace!("Changing address to {:#x}.", address);
            state.address = address;
            state.driver.set_address(address);
            Self::restart_rx(state)
        })
    }
    fn address(&self) -> ShortAddress {
        self.with_state(|state| state.address)
    }
    fn is_active(&self) -> bool {
        self.with_state(|state| state.driver.is_active())
    }
    fn take_counters(&self) -> RadioCounters {
        self.with_state(|state| core::mem::take(&mut state.counters))
    }
}
