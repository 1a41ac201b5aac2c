//! # `blazenet-rf`
//! This is the core of the BlazeNet radio coprocessor firmware. It sits between a host processor,
//! which talks to us over a byte oriented transport (usually SPI) and an interrupt line, and an
//! 802.15.4 style transceiver.
//!
//! ## Overview
//! The firmware is made up of a few services, which are shared by reference between the tasks.
//!
//! ### Packet queues
//! Received frames are buffered in a bounded FIFO until the host reads them, while frames to be
//! transmitted wait in four priority queues. Both directions are limited by a byte budget and,
//! once full, drop the newest packet instead of evicting older ones. See [PacketQueue].
//!
//! ### Interrupts
//! The [IrqManager] combines sticky interrupt flags with the mask configured by the host and
//! drives the interrupt line accordingly. Since the host debounces the line, pending interrupts
//! that stay unacknowledged for too long cause the line to be pulsed again.
//!
//! ### Host commands
//! Every exchange with the host starts with a two byte header, which selects one of a fixed
//! table of commands and the direction of the payload. The [host::Dispatcher] decodes these and
//! invokes the handlers, while the [HostInterface] moves the bytes.
//!
//! ### Radio
//! The transceiver is accessed through the [RadioDriver] trait. Its interrupt handler only posts
//! events to the [RadioMailbox], which are then processed by the [RadioTask]. The task moves
//! received frames into the queues, transmits queued frames one at a time using CSMA/CA and
//! sends acknowledgements for frames the host read.
//!
//! ### Watchdog and beacon
//! The host has to send a command every so often. If it doesn't, the [Watchdog] assumes it's gone,
//! starts blinking the attention indicator and suspends the [Beacon], until the host is back.
//!
//! ## Features
//! - `log` or `defmt`: Emit log messages through the respective crate.
//! - `critical_section`: Protect the state of the radio link with a critical section, instead of
//!   assuming that it's only accessed from a single executor.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub(crate) mod fmt;

pub mod beacon;
pub mod blazenet;
pub mod host;
pub mod irq;
pub mod packet;
pub mod radio;
mod services;
mod sync;
pub mod watchdog;

#[cfg(test)]
mod testing;

pub use beacon::{Beacon, BeaconError};
pub use host::{Dispatcher, HostContext, HostInterface, HostTransport};
pub use irq::{Interrupt, IrqConfig, IrqLine, IrqManager};
pub use packet::{PacketQueue, Priority, QueueConfig, QueueError};
pub use radio::{
    LinkConfig, RadioControl, RadioDriver, RadioEvents, RadioLink, RadioMailbox, RadioTask,
};
pub use services::{ServiceConfig, Services};
pub use sync::NotifyBits;
pub use watchdog::{AttentionIndicator, Watchdog, WatchdogConfig};

cfg_if::cfg_if! {
    if #[cfg(feature = "critical_section")] {
        type DefaultRawMutex = embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    } else {
        type DefaultRawMutex = embassy_sync::blocking_mutex::raw::NoopRawMutex;
    }
}
