//! Periodic transmission of the network beacon.
//!
//! The host configures the beacon frame, which is kept in a sticky transmit buffer, and submits
//! it at [Priority::NetworkControl] every interval. While communication with the host is lost,
//! beaconing is suspended, since we can't answer to the devices it would attract anyway.

use core::cell::{Cell, RefCell};

use embassy_futures::select::{select, Either};
use embassy_sync::{
    blocking_mutex::{raw::CriticalSectionRawMutex, Mutex},
    signal::Signal,
};
use embassy_time::{Duration, Timer};

use crate::packet::{PacketQueue, Priority, QueueError, TxPacket};

/// Maximum size of a beacon frame.
pub const MAX_BEACON_SIZE: usize = 192;
/// Beacon interval used until the host configures one.
pub const DEFAULT_BEACON_INTERVAL_MS: u16 = 5000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BeaconError {
    /// The interval must not be zero.
    InvalidInterval,
    /// The frame is empty or larger than [MAX_BEACON_SIZE].
    InvalidLength,
    /// No beacon frame was configured yet.
    NoPayload,
    /// The packet queue rejected the frame.
    Queue(QueueError),
}
impl From<QueueError> for BeaconError {
    fn from(value: QueueError) -> Self {
        Self::Queue(value)
    }
}
pub type BeaconResult<T> = Result<T, BeaconError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct BeaconState {
    enabled: bool,
    suspended: bool,
    interval_ms: u16,
}
impl BeaconState {
    const fn timer_running(&self) -> bool {
        self.enabled && !self.suspended
    }
}

/// The beacon generator.
pub struct Beacon<'a> {
    queue: &'a PacketQueue<'a>,
    packet: Mutex<CriticalSectionRawMutex, RefCell<Option<TxPacket>>>,
    state: Mutex<CriticalSectionRawMutex, Cell<BeaconState>>,
    rearm: Signal<CriticalSectionRawMutex, ()>,
}
impl<'a> Beacon<'a> {
    /// Create a new beacon generator, which is disabled and suspended.
    ///
    /// It's resumed once communication with the host is established.
    pub fn new(queue: &'a PacketQueue<'a>) -> Self {
        Self {
            queue,
            packet: Mutex::new(RefCell::new(None)),
            state: Mutex::new(Cell::new(BeaconState {
                enabled: false,
                suspended: true,
                interval_ms: DEFAULT_BEACON_INTERVAL_MS,
            })),
            rearm: Signal::new(),
        }
    }
    fn update_state(&self, f: impl FnOnce(&mut BeaconState)) {
        let changed = self.state.lock(|state| {
            let mut new_state = state.get();
            f(&mut new_state);
            let changed = new_state != state.get();
            state.set(new_state);
            changed
        });
        if changed {
            self.rearm.signal(());
        }
    }
    fn state(&self) -> BeaconState {
        self.state.lock(Cell::get)
    }

    /// Enable or disable periodic beaconing.
    pub fn set_enabled(&self, enabled: bool) {
        self.update_state(|state| state.enabled = enabled);
    }
    pub fn is_enabled(&self) -> bool {
        self.state().enabled
    }
    /// Change the beacon interval.
    ///
    /// If the timer is running, it's restarted with the new interval.
    pub fn set_interval(&self, interval_ms: u16) -> BeaconResult<()> {
        if interval_ms == 0 {
            return Err(BeaconError::InvalidInterval);
        }
        self.update_state(|state| state.interval_ms = interval_ms);
        // Also restart the timer if the interval didn't change.
        if self.is_timer_running() {
            self.rearm.signal(());
        }
        Ok(())
    }
    /// Returns the beacon interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.state().interval_ms as u64)
    }
    /// Replace the beacon frame.
    ///
    /// The previous frame is released before the new one is allocated, so both never count
    /// against the transmit budget at the same time. If a transmission of the old frame is still
    /// pending, it completes normally.
    pub fn set_payload(&self, frame: &[u8]) -> BeaconResult<()> {
        if frame.is_empty() || frame.len() > MAX_BEACON_SIZE {
            return Err(BeaconError::InvalidLength);
        }
        self.packet.lock(|packet| {
            let mut packet = packet.borrow_mut();
            if let Some(old) = packet.take() {
                self.queue.discard_tx(old, true);
            }
            *packet = Some(self.queue.alloc_tx(frame, true)?);
            Ok(())
        })
    }
    /// Check if a beacon frame is configured.
    pub fn has_payload(&self) -> bool {
        self.packet.lock(|packet| packet.borrow().is_some())
    }
    /// Check if the beacon timer is currently running.
    pub fn is_timer_running(&self) -> bool {
        self.state().timer_running()
    }
    /// Suspend beaconing.
    pub fn comms_lost(&self) {
        self.update_state(|state| state.suspended = true);
    }
    /// Resume beaconing, if it's enabled.
    pub fn comms_regained(&self) {
        self.update_state(|state| state.suspended = false);
    }
    /// Submit the beacon frame for transmission.
    pub fn emit(&self) -> BeaconResult<()> {
        self.packet.lock(|packet| {
            let packet = packet.borrow();
            let Some(packet) = packet.as_ref() else {
                warn!("Beaconing is enabled, but no beacon frame was configured.");
                return Err(BeaconError::NoPayload);
            };
            self.queue
                .submit_tx(Priority::NetworkControl, packet.clone())?;
            trace!("Submitted beacon.");
            Ok(())
        })
    }
    /// Run the beacon timer.
    pub async fn run(&self) -> ! {
        loop {
            if !self.is_timer_running() {
                self.rearm.wait().await;
                continue;
            }
            match select(Timer::after(self.interval()), self.rearm.wait()).await {
                Either::First(_) => {
                    let _ = self.emit();
                }
                Either::Second(_) => trace!("Beacon timer rearmed."),
            }
        }
    }
}
