//! The command handlers and the table they're dispatched through.

use core::cell::RefCell;

use bitflags::bitflags;
use embassy_sync::blocking_mutex;
use portable_atomic::{AtomicBool, Ordering};

use crate::{
    beacon::{Beacon, BeaconError},
    irq::{Interrupt, IrqManager},
    packet::{PacketQueue, QueueError, RxPacket},
    radio::{RadioControl, RadioError},
    watchdog::Watchdog,
    DefaultRawMutex,
};

use super::commands::{
    encode_counters, encode_packet_queue_status, parse_interrupts, BeaconConfigRequest,
    CommandId, DeviceIdentity, RadioConfigRequest, StatusFlags, TransmitFlags, COUNTERS_LENGTH,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HandlerError {
    /// The host wrote fewer bytes than the command requires.
    PayloadTooShort,
    /// The host requested fewer bytes than the response requires.
    ResponseTruncated,
    /// ReadPacket was issued, while the receive queue was empty.
    NoPacket,
    /// The handler produced a response, which doesn't fit the transfer buffer.
    ResponseTooLong,
    Radio(RadioError),
    Queue(QueueError),
    Beacon(BeaconError),
}
impl From<RadioError> for HandlerError {
    fn from(value: RadioError) -> Self {
        Self::Radio(value)
    }
}
impl From<QueueError> for HandlerError {
    fn from(value: QueueError) -> Self {
        Self::Queue(value)
    }
}
impl From<BeaconError> for HandlerError {
    fn from(value: BeaconError) -> Self {
        Self::Beacon(value)
    }
}
pub type HandlerResult<T> = Result<T, HandlerError>;

bitflags! {
    /// Capabilities of a [CommandHandler].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct HandlerFlags: u8 {
        /// The host may read a response.
        const SUPPORTS_READ = 1 << 0;
        /// The host may write a payload.
        const SUPPORTS_WRITE = 1 << 1;
        /// The post read callback is invoked once the response was transmitted.
        const WANTS_POST_READ = 1 << 2;
    }
}

/// Produce a response of at most `requested` bytes into the buffer, returning its length.
pub type ReadHandler = fn(&HostContext<'_>, u8, usize, &mut [u8]) -> HandlerResult<usize>;
/// Process a payload written by the host.
pub type WriteHandler = fn(&HostContext<'_>, u8, &[u8]) -> HandlerResult<()>;
/// Invoked after a read, with whether the response made it to the host.
pub type PostReadHandler = fn(&HostContext<'_>, bool);

pub struct CommandHandler {
    pub flags: HandlerFlags,
    pub read: Option<ReadHandler>,
    pub write: Option<WriteHandler>,
    pub post_read: Option<PostReadHandler>,
}
impl CommandHandler {
    const fn read_only(read: ReadHandler) -> Self {
        Self {
            flags: HandlerFlags::SUPPORTS_READ,
            read: Some(read),
            write: None,
            post_read: None,
        }
    }
    const fn write_only(write: WriteHandler) -> Self {
        Self {
            flags: HandlerFlags::SUPPORTS_WRITE,
            read: None,
            write: Some(write),
            post_read: None,
        }
    }
    const fn read_write(read: ReadHandler, write: WriteHandler) -> Self {
        Self {
            flags: HandlerFlags::SUPPORTS_READ.union(HandlerFlags::SUPPORTS_WRITE),
            read: Some(read),
            write: Some(write),
            post_read: None,
        }
    }
    /// Look up the handler for a command identifier.
    pub fn lookup(command: u8) -> Option<&'static Self> {
        HANDLERS.get(command as usize)
    }
    pub fn supports_read(&self) -> bool {
        self.flags.contains(HandlerFlags::SUPPORTS_READ) && self.read.is_some()
    }
    pub fn supports_write(&self) -> bool {
        self.flags.contains(HandlerFlags::SUPPORTS_WRITE) && self.write.is_some()
    }
    pub fn wants_post_read(&self) -> bool {
        self.flags.contains(HandlerFlags::WANTS_POST_READ) && self.post_read.is_some()
    }
}

/// Handlers indexed by [CommandId].
static HANDLERS: [CommandHandler; CommandId::COUNT] = [
    // NoOp
    CommandHandler::write_only(no_op),
    // GetInfo
    CommandHandler::read_only(get_info),
    // RadioConfig
    CommandHandler::write_only(radio_config),
    // GetStatus
    CommandHandler::read_only(get_status),
    // IrqConfig
    CommandHandler::read_write(read_irq_config, write_irq_config),
    // GetPacketQueueStatus
    CommandHandler::read_only(get_packet_queue_status),
    // ReadPacket
    CommandHandler {
        flags: HandlerFlags::SUPPORTS_READ.union(HandlerFlags::WANTS_POST_READ),
        read: Some(read_packet),
        write: None,
        post_read: Some(read_packet_complete),
    },
    // TransmitPacket
    CommandHandler::write_only(transmit_packet),
    // BeaconConfig
    CommandHandler::write_only(beacon_config),
    // GetCounters
    CommandHandler::read_only(get_counters),
    // IrqStatus
    CommandHandler::read_write(read_irq_status, write_irq_status),
];

/// Everything the command handlers operate on.
pub struct HostContext<'a> {
    pub irq: &'a IrqManager<'a>,
    pub queue: &'a PacketQueue<'a>,
    pub radio: &'a dyn RadioControl,
    pub beacon: &'a Beacon<'a>,
    pub watchdog: &'a Watchdog<'a>,
    pub identity: DeviceIdentity,
    error_flag: AtomicBool,
    /// The packet being read out by ReadPacket, until the response was transmitted.
    held_packet: blocking_mutex::Mutex<DefaultRawMutex, RefCell<Option<RxPacket>>>,
}
impl<'a> HostContext<'a> {
    pub fn new(
        irq: &'a IrqManager<'a>,
        queue: &'a PacketQueue<'a>,
        radio: &'a dyn RadioControl,
        beacon: &'a Beacon<'a>,
        watchdog: &'a Watchdog<'a>,
        identity: DeviceIdentity,
    ) -> Self {
        Self {
            irq,
            queue,
            radio,
            beacon,
            watchdog,
            identity,
            error_flag: AtomicBool::new(false),
            held_packet: blocking_mutex::Mutex::new(RefCell::new(None)),
        }
    }
    /// Record a failed command and notify the host.
    pub fn flag_error(&self) {
        self.error_flag.store(true, Ordering::Relaxed);
        self.irq.assert(Interrupt::COMMAND_ERROR);
    }
    /// Check if a command failed since the last status read.
    pub fn error_flag(&self) -> bool {
        self.error_flag.load(Ordering::Relaxed)
    }
    fn take_held_packet(&self) -> Option<RxPacket> {
        self.held_packet.lock(|held| held.borrow_mut().take())
    }
    fn hold_packet(&self, packet: RxPacket) {
        if let Some(stale) = self.held_packet.lock(|held| held.replace(Some(packet))) {
            self.queue.release_rx(stale, false);
        }
    }
}

/// Copy as much of `response` as the host requested.
fn respond(response: &[u8], requested: usize, buffer: &mut [u8]) -> usize {
    let length = response.len().min(requested).min(buffer.len());
    buffer[..length].copy_from_slice(&response[..length]);
    length
}

fn no_op(_: &HostContext<'_>, _: u8, _: &[u8]) -> HandlerResult<()> {
    Ok(())
}

fn get_info(
    context: &HostContext<'_>,
    _: u8,
    requested: usize,
    buffer: &mut [u8],
) -> HandlerResult<usize> {
    let info = context
        .identity
        .to_info_bytes(context.radio.max_tx_power());
    Ok(respond(&info, requested, buffer))
}

fn radio_config(context: &HostContext<'_>, _: u8, payload: &[u8]) -> HandlerResult<()> {
    let request = RadioConfigRequest::parse(payload).ok_or(HandlerError::PayloadTooShort)?;
    context.radio.set_channel(request.channel).inspect_err(|err| {
        warn!("RadioConfig: setting channel failed: {:?}", err);
    })?;
    context.radio.set_tx_power(request.tx_power).inspect_err(|err| {
        warn!("RadioConfig: setting TX power failed: {:?}", err);
    })?;
    context.radio.set_address(request.address).inspect_err(|err| {
        warn!("RadioConfig: setting address failed: {:?}", err);
    })?;
    debug!(
        "RadioConfig: channel {}, TX power {}, address {:#x}",
        request.channel,
        request.tx_power,
        request.address
    );
    Ok(())
}

fn get_status(
    context: &HostContext<'_>,
    _: u8,
    requested: usize,
    buffer: &mut [u8],
) -> HandlerResult<usize> {
    let error = context.error_flag.swap(false, Ordering::Relaxed);
    let queue = context.queue.take_status();
    let flags = StatusFlags::from_status(error, context.radio.is_active(), &queue);
    context.irq.acknowledge(Interrupt::COMMAND_ERROR);
    Ok(respond(&[flags.into_bits()], requested, buffer))
}

fn read_irq_config(
    context: &HostContext<'_>,
    _: u8,
    requested: usize,
    buffer: &mut [u8],
) -> HandlerResult<usize> {
    Ok(respond(&[context.irq.mask().bits()], requested, buffer))
}

fn write_irq_config(context: &HostContext<'_>, _: u8, payload: &[u8]) -> HandlerResult<()> {
    let mask = parse_interrupts(payload).ok_or(HandlerError::PayloadTooShort)?;
    context.irq.set_mask(mask);
    Ok(())
}

fn get_packet_queue_status(
    context: &HostContext<'_>,
    _: u8,
    requested: usize,
    buffer: &mut [u8],
) -> HandlerResult<usize> {
    let status = encode_packet_queue_status(&context.queue.status());
    Ok(respond(&status, requested, buffer))
}

fn read_packet(
    context: &HostContext<'_>,
    _: u8,
    requested: usize,
    buffer: &mut [u8],
) -> HandlerResult<usize> {
    let packet = context.queue.pop_rx().ok_or(HandlerError::NoPacket)?;
    let header = [packet.rssi() as u8, packet.lqi()];
    let mut length = respond(&header, requested, buffer);
    if length == header.len() {
        length += respond(packet.data(), requested - length, &mut buffer[length..]);
    }
    context.hold_packet(packet);
    Ok(length)
}

fn read_packet_complete(context: &HostContext<'_>, success: bool) {
    let Some(packet) = context.take_held_packet() else {
        return;
    };
    if !success {
        debug!("Packet read out failed, not acknowledging.");
    }
    context.queue.release_rx(packet, success);
}

fn transmit_packet(context: &HostContext<'_>, _: u8, payload: &[u8]) -> HandlerResult<()> {
    let (&flags, frame) = payload
        .split_first()
        .ok_or(HandlerError::PayloadTooShort)?;
    if frame.is_empty() {
        return Err(HandlerError::PayloadTooShort);
    }
    let priority = TransmitFlags::from_bits(flags).transmit_priority();
    let packet = context.queue.alloc_tx(frame, false)?;
    context.queue.submit_tx(priority, packet)?;
    Ok(())
}

fn beacon_config(context: &HostContext<'_>, _: u8, payload: &[u8]) -> HandlerResult<()> {
    let request = BeaconConfigRequest::parse(payload).ok_or(HandlerError::PayloadTooShort)?;
    if request.flags.update_config() {
        context.beacon.set_enabled(request.flags.enabled());
        context.beacon.set_interval(request.interval_ms)?;
        info!(
            "BeaconConfig: enabled {}, interval {} ms",
            request.flags.enabled(),
            request.interval_ms
        );
    }
    if !request.frame.is_empty() {
        context.beacon.set_payload(request.frame).inspect_err(|err| {
            warn!("BeaconConfig: setting payload failed: {:?}", err);
        })?;
        debug!("BeaconConfig: payload length {}", request.frame.len());
    }
    Ok(())
}

fn get_counters(
    context: &HostContext<'_>,
    _: u8,
    requested: usize,
    buffer: &mut [u8],
) -> HandlerResult<usize> {
    if requested < COUNTERS_LENGTH {
        return Err(HandlerError::ResponseTruncated);
    }
    let ticks = embassy_time::Instant::now().as_ticks() as u32;
    let counters = encode_counters(
        ticks,
        &context.queue.take_counters(),
        &context.radio.take_counters(),
    );
    Ok(respond(&counters, requested, buffer))
}

fn read_irq_status(
    context: &HostContext<'_>,
    _: u8,
    requested: usize,
    buffer: &mut [u8],
) -> HandlerResult<usize> {
    let pending = context.irq.take_pending();
    Ok(respond(&[pending.bits()], requested, buffer))
}

fn write_irq_status(context: &HostContext<'_>, _: u8, payload: &[u8]) -> HandlerResult<()> {
    let acknowledged = parse_interrupts(payload).ok_or(HandlerError::PayloadTooShort)?;
    context.irq.acknowledge(acknowledged);
    Ok(())
}
