//! Bring-up of the shared services.
//!
//! The interrupt manager, the radio mailbox, the packet queues, the beacon and the watchdog exist
//! exactly once and are shared by all tasks, so they're placed into static memory. The radio link
//! and the host interface are generic over the hardware and are created by the application on top
//! of the returned [Services].

use embassy_futures::join::join3;
use embassy_time::Duration;
use static_cell::StaticCell;

use crate::{
    beacon::Beacon,
    irq::{IrqConfig, IrqLine, IrqManager},
    packet::{PacketQueue, QueueConfig},
    radio::RadioMailbox,
    watchdog::{AttentionIndicator, Watchdog, WatchdogConfig},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServiceConfig {
    pub irq: IrqConfig,
    /// Period of the lost interrupt recovery tick.
    pub irq_tick: Duration,
    pub queue: QueueConfig,
    pub watchdog: WatchdogConfig,
}
impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            irq: IrqConfig::default(),
            irq_tick: Duration::from_millis(1),
            queue: QueueConfig::default(),
            watchdog: WatchdogConfig::default(),
        }
    }
}

/// References to the shared services.
#[derive(Clone, Copy)]
pub struct Services {
    pub irq: &'static IrqManager<'static>,
    pub mailbox: &'static RadioMailbox,
    pub queue: &'static PacketQueue<'static>,
    pub beacon: &'static Beacon<'static>,
    pub watchdog: &'static Watchdog<'static>,
    irq_tick: Duration,
}
impl Services {
    /// Create the shared services.
    ///
    /// # Panics
    /// This panics if called more than once.
    pub fn init(
        line: &'static dyn IrqLine,
        indicator: &'static dyn AttentionIndicator,
        config: ServiceConfig,
    ) -> Self {
        static IRQ: StaticCell<IrqManager<'static>> = StaticCell::new();
        static MAILBOX: StaticCell<RadioMailbox> = StaticCell::new();
        static QUEUE: StaticCell<PacketQueue<'static>> = StaticCell::new();
        static BEACON: StaticCell<Beacon<'static>> = StaticCell::new();
        static WATCHDOG: StaticCell<Watchdog<'static>> = StaticCell::new();

        let irq: &'static IrqManager<'static> = IRQ.init(IrqManager::new(line, config.irq));
        let mailbox: &'static RadioMailbox = MAILBOX.init(RadioMailbox::new());
        let queue: &'static PacketQueue<'static> =
            QUEUE.init(PacketQueue::new(irq, mailbox, config.queue));
        let beacon: &'static Beacon<'static> = BEACON.init(Beacon::new(queue));
        let watchdog: &'static Watchdog<'static> =
            WATCHDOG.init(Watchdog::new(beacon, indicator, config.watchdog));
        info!("Services initialized.");

        Self {
            irq,
            mailbox,
            queue,
            beacon,
            watchdog,
            irq_tick: config.irq_tick,
        }
    }
    /// Run the timer driven background jobs: interrupt recovery, beaconing and the watchdog.
    pub async fn run_background(&self) -> ! {
        let (never, _, _) = join3(
            self.irq.run_recovery(self.irq_tick),
            self.beacon.run(),
            self.watchdog.run(),
        )
        .await;
        never
    }
}
