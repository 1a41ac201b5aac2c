//! Host communication watchdog.
//!
//! Every command from the host checks in with the watchdog. If no command arrives for a number of
//! intervals, communication is considered lost: beaconing is suspended and the attention
//! indicator starts blinking. Both are undone by the next command.
//!
//! Communication starts out lost, until the host sends its first command.

use core::cell::Cell;

use embassy_sync::blocking_mutex::{raw::CriticalSectionRawMutex, Mutex};
use embassy_time::{Duration, Ticker};

use crate::beacon::Beacon;

/// A visual indicator, used to draw attention to the device.
pub trait AttentionIndicator: Sync {
    fn blink_fast(&self);
    fn off(&self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchdogConfig {
    /// Period of the watchdog timer.
    pub interval: Duration,
    /// Number of intervals without a check in, after which communication is considered lost.
    pub threshold: u32,
}
impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(2500),
            threshold: 6,
        }
    }
}

#[derive(Clone, Copy)]
struct WatchdogState {
    missed: u32,
    lost: bool,
}

pub struct Watchdog<'a> {
    beacon: &'a Beacon<'a>,
    indicator: &'a dyn AttentionIndicator,
    config: WatchdogConfig,
    state: Mutex<CriticalSectionRawMutex, Cell<WatchdogState>>,
}
impl<'a> Watchdog<'a> {
    /// Create the watchdog, in the lost state.
    pub fn new(
        beacon: &'a Beacon<'a>,
        indicator: &'a dyn AttentionIndicator,
        config: WatchdogConfig,
    ) -> Self {
        let temp = Self {
            beacon,
            indicator,
            config,
            state: Mutex::new(Cell::new(WatchdogState {
                missed: 0,
                lost: true,
            })),
        };
        temp.handle_comms_lost();
        temp
    }
    fn handle_comms_lost(&self) {
        self.indicator.blink_fast();
        self.beacon.comms_lost();
    }
    fn handle_comms_regained(&self) {
        self.indicator.off();
        self.beacon.comms_regained();
        info!("Host comms regained.");
    }
    /// Record activity from the host.
    pub fn checkin(&self) {
        let was_lost = self.state.lock(|state| {
            let was_lost = state.get().lost;
            state.set(WatchdogState {
                missed: 0,
                lost: false,
            });
            was_lost
        });
        if was_lost {
            self.handle_comms_regained();
        }
    }
    /// Advance the watchdog by one interval.
    pub fn on_timer(&self) {
        let lost_now = self.state.lock(|state| {
            let mut current = state.get();
            current.missed = current.missed.saturating_add(1);
            let lost_now = current.missed > self.config.threshold && !current.lost;
            current.lost |= lost_now;
            state.set(current);
            lost_now
        });
        if lost_now {
            warn!("Host comms lost.");
            self.handle_comms_lost();
        }
    }
    pub fn is_comms_lost(&self) -> bool {
        self.state.lock(|state| state.get().lost)
    }
    /// Number of intervals since the last check in.
    pub fn missed_checkins(&self) -> u32 {
        self.state.lock(|state| state.get().missed)
    }
    /// Run the watchdog timer.
    pub async fn run(&self) -> ! {
        let mut ticker = Ticker::every(self.config.interval);
        loop {
            ticker.next().await;
            self.on_timer();
        }
    }
}
