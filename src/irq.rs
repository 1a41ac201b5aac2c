//! Host interrupt line management.
//!
//! Producers throughout the firmware set sticky interrupt flags, which are combined with the mask
//! configured by the host. Whenever the result is non-zero, the active low interrupt line to the
//! host is asserted.
//!
//! Since the host debounces its interrupt input, an edge can get lost if a flag is cleared and set
//! again in quick succession. To cover for that, the line is pulsed if the masked interrupts stay
//! pending for too long without the host acknowledging them.
//!
//! When changing state the host can read back through a command, always update that state
//! *before* calling into the [IrqManager]. Otherwise the host's interrupt handler may observe
//! stale data.

use core::cell::RefCell;

use bitflags::bitflags;
use embassy_sync::blocking_mutex::{raw::CriticalSectionRawMutex, Mutex};
use embassy_time::{Duration, Ticker};

bitflags! {
    /// Interrupt sources.
    ///
    /// The bit positions are identical to the ones used by the IrqConfig and IrqStatus commands.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Interrupt: u8 {
        /// A command failed. Cleared by reading the status register.
        const COMMAND_ERROR = 1 << 0;
        /// At least one packet is waiting in the receive queue.
        const PACKET_RECEIVED = 1 << 1;
        /// A packet was transmitted.
        const PACKET_TRANSMITTED = 1 << 2;
        /// There are no packets pending for transmission.
        const TX_QUEUE_EMPTY = 1 << 3;
    }
}
#[cfg(feature = "defmt")]
impl defmt::Format for Interrupt {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "Interrupt({=u8:#x})", self.bits())
    }
}

/// The physical interrupt output towards the host.
pub trait IrqLine: Sync {
    /// Drive the line. `true` means asserted, which is electrically low.
    fn set_asserted(&self, asserted: bool);
}

/// Tunables of the [IrqManager].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IrqConfig {
    /// Number of ticks the masked interrupts may stay pending, before the line is pulsed.
    pub recovery_threshold: u32,
}
impl Default for IrqConfig {
    fn default() -> Self {
        Self {
            recovery_threshold: 50,
        }
    }
}

/// Stage of the lost interrupt recovery.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RecoveryStage {
    /// Normal operation, counting how long interrupts are pending.
    #[default]
    Idle,
    /// The line was forcibly released.
    Deasserted,
    /// The line is held released for another tick.
    Holding,
    /// The line follows the masked interrupts again.
    Reasserted,
    /// Last tick before counting restarts.
    Settling,
}
impl RecoveryStage {
    /// Check if the line is being forced inactive in this stage.
    const fn forces_inactive(&self) -> bool {
        matches!(self, Self::Deasserted | Self::Holding)
    }
}

struct IrqState {
    active: Interrupt,
    mask: Interrupt,
    masked_active: Interrupt,
    pending_ticks: u32,
    stage: RecoveryStage,
    line_asserted: bool,
}
impl IrqState {
    /// Recompute the masked interrupts and drive the line accordingly.
    fn update(&mut self, line: &dyn IrqLine) {
        self.masked_active = self.active & self.mask;
        if self.masked_active.is_empty() {
            self.pending_ticks = 0;
        }
        if !self.stage.forces_inactive() {
            self.drive(line, !self.masked_active.is_empty());
        }
    }
    fn drive(&mut self, line: &dyn IrqLine, asserted: bool) {
        self.line_asserted = asserted;
        line.set_asserted(asserted);
    }
}

/// Manages the interrupt line to the host.
pub struct IrqManager<'a> {
    line: &'a dyn IrqLine,
    config: IrqConfig,
    // This is entered from ISR context, so it must be a real critical section.
    state: Mutex<CriticalSectionRawMutex, RefCell<IrqState>>,
}
impl<'a> IrqManager<'a> {
    /// Create a new manager with all interrupts masked and inactive.
    ///
    /// This also releases the line.
    pub fn new(line: &'a dyn IrqLine, config: IrqConfig) -> Self {
        line.set_asserted(false);
        Self {
            line,
            config,
            state: Mutex::new(RefCell::new(IrqState {
                active: Interrupt::empty(),
                mask: Interrupt::empty(),
                masked_active: Interrupt::empty(),
                pending_ticks: 0,
                stage: RecoveryStage::Idle,
                line_asserted: false,
            })),
        }
    }
    fn with_state<R>(&self, f: impl FnOnce(&mut IrqState) -> R) -> R {
        self.state.lock(|state| f(&mut state.borrow_mut()))
    }
    /// Mark the interrupts as active.
    pub fn assert(&self, which: Interrupt) {
        self.with_state(|state| {
            state.active |= which;
            state.update(self.line);
        });
    }
    /// Clear interrupts, because the condition causing them went away.
    ///
    /// Unlike [Self::acknowledge], this doesn't affect a recovery in progress.
    pub fn deassert(&self, which: Interrupt) {
        self.with_state(|state| {
            state.active &= !which;
            state.update(self.line);
        });
    }
    /// Clear interrupts on behalf of the host.
    ///
    /// Any lost interrupt recovery is cancelled.
    pub fn acknowledge(&self, which: Interrupt) {
        self.with_state(|state| {
            state.active &= !which;
            state.stage = RecoveryStage::Idle;
            state.pending_ticks = 0;
            state.update(self.line);
        });
    }
    /// Atomically read the pending (masked) interrupts and acknowledge them.
    pub fn take_pending(&self) -> Interrupt {
        self.with_state(|state| {
            let pending = state.masked_active;
            state.active &= !pending;
            state.stage = RecoveryStage::Idle;
            state.pending_ticks = 0;
            state.update(self.line);
            pending
        })
    }
    /// Replace the interrupt mask.
    pub fn set_mask(&self, mask: Interrupt) {
        self.with_state(|state| {
            state.mask = mask;
            state.update(self.line);
        });
    }
    /// Returns the interrupt mask.
    pub fn mask(&self) -> Interrupt {
        self.with_state(|state| state.mask)
    }
    /// Returns all active interrupts, regardless of the mask.
    pub fn active(&self) -> Interrupt {
        self.with_state(|state| state.active)
    }
    /// Returns the active interrupts, which aren't masked.
    pub fn pending(&self) -> Interrupt {
        self.with_state(|state| state.masked_active)
    }
    /// Check if the physical line is currently asserted.
    pub fn is_line_asserted(&self) -> bool {
        self.with_state(|state| state.line_asserted)
    }
    /// Returns the stage of the lost interrupt recovery.
    pub fn recovery_stage(&self) -> RecoveryStage {
        self.with_state(|state| state.stage)
    }
    /// Advance the lost interrupt recovery by one tick.
    pub fn tick(&self) {
        self.with_state(|state| match state.stage {
            RecoveryStage::Idle => {
                if state.masked_active.is_empty() {
                    state.pending_ticks = 0;
                    return;
                }
                state.pending_ticks += 1;
                if state.pending_ticks > self.config.recovery_threshold {
                    state.stage = RecoveryStage::Deasserted;
                    state.drive(self.line, false);
                }
            }
            RecoveryStage::Deasserted => state.stage = RecoveryStage::Holding,
            RecoveryStage::Holding => {
                state.stage = RecoveryStage::Reasserted;
                state.update(self.line);
            }
            RecoveryStage::Reasserted => state.stage = RecoveryStage::Settling,
            RecoveryStage::Settling => {
                state.stage = RecoveryStage::Idle;
                state.pending_ticks = 0;
            }
        });
    }
    /// Periodically drive the lost interrupt recovery.
    pub async fn run_recovery(&self, period: Duration) -> ! {
        let mut ticker = Ticker::every(period);
        loop {
            ticker.next().await;
            let stage = self.recovery_stage();
            self.tick();
            if stage == RecoveryStage::Idle && self.recovery_stage() == RecoveryStage::Deasserted
            {
                debug!("Host didn't acknowledge interrupts, pulsing line.");
            }
        }
    }
}
