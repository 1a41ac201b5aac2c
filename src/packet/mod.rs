//! # Packet queues
//! The packet queue engine buffers received packets until the host reads them, and schedules
//! packets for transmission.
//!
//! ## Receive
//! Received packets are copied into heap allocated [RxPacket]s and appended to a bounded FIFO.
//! The memory used by all buffered packets is limited by a byte budget, which is approximate,
//! since allocator overhead isn't accounted for. If either the FIFO or the budget is exhausted, the
//! *newest* packet is dropped, the oldest unread packets are never evicted.
//!
//! ## Transmit
//! There are four transmit FIFOs, one per [Priority]. A counter keeps track of all packets which
//! are queued or in flight. When a packet is submitted while that counter is zero, the radio is
//! idle, so the packet is handed to the radio task directly. Otherwise it is queued, and the radio
//! task pulls the next packet with the highest priority once the current transmission completes.
//!
//! Both directions raise interrupts towards the host through the [IrqManager].

mod buffer;

use core::cell::RefCell;

use embassy_sync::blocking_mutex::{raw::CriticalSectionRawMutex, Mutex};
use heapless::Deque;

pub use buffer::{Priority, RxInfo, RxPacket, TxPacket};

use crate::{
    blazenet,
    irq::{Interrupt, IrqManager},
    radio::{RadioMailbox, RadioRequest},
};

/// Maximum number of packets waiting for the host.
pub const RX_QUEUE_CAPACITY: usize = 64;
/// Maximum number of packets waiting for transmission, per priority.
pub const TX_QUEUE_CAPACITY: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum QueueError {
    /// The FIFO has no free slots.
    QueueFull,
    /// Allocating the buffer would exceed the byte budget.
    BudgetExceeded,
    /// The heap couldn't satisfy the allocation.
    AllocationFailed,
    /// The packet is empty or larger than a frame may be.
    InvalidLength,
    /// The radio task didn't accept the packet.
    RadioUnavailable,
}
pub type QueueResult<T> = Result<T, QueueError>;

/// Byte budgets of the packet queues.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum number of bytes used by buffered received packets.
    pub rx_budget: usize,
    /// Maximum number of bytes used by packets waiting for transmission.
    pub tx_budget: usize,
}
impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            rx_budget: 8 * 1024,
            tx_budget: 4 * 1024,
        }
    }
}

/// Discard counters of one direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DiscardCounters {
    /// Packets dropped, because the FIFO was full.
    pub queue_full: u32,
    /// Packets dropped, because the byte budget was exhausted.
    pub budget_exceeded: u32,
    /// Packets dropped, because the allocation failed.
    pub allocation_failed: u32,
}
impl DiscardCounters {
    fn count(&mut self, error: QueueError) {
        let counter = match error {
            QueueError::QueueFull | QueueError::RadioUnavailable => &mut self.queue_full,
            QueueError::BudgetExceeded => &mut self.budget_exceeded,
            QueueError::AllocationFailed => &mut self.allocation_failed,
            QueueError::InvalidLength => return,
        };
        *counter = counter.wrapping_add(1);
    }
}

/// Counters of the packet queues, as read out by the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct QueueCounters {
    pub rx: DiscardCounters,
    pub tx: DiscardCounters,
}

/// A snapshot of the queue state flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct QueueStatus {
    pub rx_empty: bool,
    pub rx_full: bool,
    /// Sticky, set when a received packet was dropped.
    pub rx_overflow: bool,
    /// Length of the oldest received packet, if any.
    pub rx_next_length: Option<usize>,
    /// No packets are queued or in flight.
    pub tx_empty: bool,
    /// Sticky, set when a packet for transmission was dropped.
    pub tx_overflow: bool,
    /// Number of packets queued or in flight.
    pub tx_pending: usize,
}

struct QueueState {
    rx_queue: Deque<RxPacket, RX_QUEUE_CAPACITY>,
    rx_bytes: usize,
    rx_overflow: bool,
    tx_queues: [Deque<TxPacket, TX_QUEUE_CAPACITY>; Priority::COUNT],
    tx_bytes: usize,
    tx_overflow: bool,
    tx_pending: usize,
    counters: QueueCounters,
}
impl QueueState {
    fn reject_rx(&mut self, error: QueueError) -> QueueError {
        self.rx_overflow = true;
        self.counters.rx.count(error);
        error
    }
    fn reject_tx(&mut self, error: QueueError) -> QueueError {
        self.tx_overflow = true;
        self.counters.tx.count(error);
        error
    }
    fn pop_highest_priority(&mut self) -> Option<TxPacket> {
        Priority::DESCENDING
            .iter()
            .find_map(|priority| self.tx_queues[priority.index()].pop_front())
    }
    fn status(&self) -> QueueStatus {
        QueueStatus {
            rx_empty: self.rx_queue.is_empty(),
            rx_full: self.rx_queue.is_full(),
            rx_overflow: self.rx_overflow,
            rx_next_length: self.rx_queue.front().map(RxPacket::len),
            tx_empty: self.tx_pending == 0,
            tx_overflow: self.tx_overflow,
            tx_pending: self.tx_pending,
        }
    }
    fn release_tx(&mut self, packet: TxPacket, force: bool) {
        if packet.is_sticky() && !force {
            return;
        }
        self.tx_bytes = self.tx_bytes.saturating_sub(packet.charged_bytes());
    }
}

/// The packet queue engine.
pub struct PacketQueue<'a> {
    irq: &'a IrqManager<'a>,
    radio: &'a RadioMailbox,
    config: QueueConfig,
    state: Mutex<CriticalSectionRawMutex, RefCell<QueueState>>,
}
impl<'a> PacketQueue<'a> {
    pub fn new(irq: &'a IrqManager<'a>, radio: &'a RadioMailbox, config: QueueConfig) -> Self {
        let temp = Self {
            irq,
            radio,
            config,
            state: Mutex::new(RefCell::new(QueueState {
                rx_queue: Deque::new(),
                rx_bytes: 0,
                rx_overflow: false,
                tx_queues: [Deque::new(), Deque::new(), Deque::new(), Deque::new()],
                tx_bytes: 0,
                tx_overflow: false,
                tx_pending: 0,
                counters: QueueCounters::default(),
            })),
        };
        temp.state.lock(|state| {
            let state = state.borrow();
            temp.update_rx_signals(&state);
            temp.update_tx_signals(&state);
        });
        temp
    }
    fn with_state<R>(&self, f: impl FnOnce(&mut QueueState) -> R) -> R {
        self.state.lock(|state| f(&mut state.borrow_mut()))
    }
    fn update_rx_signals(&self, state: &QueueState) {
        if state.rx_queue.is_empty() {
            self.irq.deassert(Interrupt::PACKET_RECEIVED);
        } else {
            self.irq.assert(Interrupt::PACKET_RECEIVED);
        }
    }
    fn update_tx_signals(&self, state: &QueueState) {
        if state.tx_pending == 0 {
            self.irq.assert(Interrupt::TX_QUEUE_EMPTY);
        } else {
            self.irq.deassert(Interrupt::TX_QUEUE_EMPTY);
        }
    }

    /// Buffer a received packet for the host.
    ///
    /// On failure the packet is dropped, the matching discard counter is incremented and the
    /// receive overflow flag is set. Payloads of invalid length are refused without touching
    /// either.
    pub fn enqueue_rx(&self, payload: &[u8], info: &RxInfo) -> QueueResult<()> {
        let result = self.with_state(|state| {
            if payload.is_empty() || payload.len() > blazenet::MAX_PACKET_SIZE {
                return Err(QueueError::InvalidLength);
            }
            if state.rx_queue.is_full() {
                return Err(state.reject_rx(QueueError::QueueFull));
            }
            let required = RxPacket::footprint(payload.len());
            if state.rx_bytes + required > self.config.rx_budget {
                return Err(state.reject_rx(QueueError::BudgetExceeded));
            }
            let ack_owed = blazenet::ack_owed(payload, info.local_address);
            let packet = match RxPacket::new(payload, info, ack_owed) {
                Ok(packet) => packet,
                Err(error) => return Err(state.reject_rx(error)),
            };
            state.rx_bytes += packet.charged_bytes();
            // We checked for space above.
            let _ = state.rx_queue.push_back(packet);
            trace!(
                "RX queue {}/{}, {} bytes used.",
                state.rx_queue.len(),
                RX_QUEUE_CAPACITY,
                state.rx_bytes
            );
            self.update_rx_signals(state);
            Ok(())
        });
        if let Err(error) = result {
            debug!("Dropped received packet: {:?}", error);
        }
        result
    }
    /// Run `f` on the oldest received packet, without removing it.
    pub fn peek_rx<R>(&self, f: impl FnOnce(&RxPacket) -> R) -> Option<R> {
        self.with_state(|state| state.rx_queue.front().map(f))
    }
    /// Remove the oldest received packet.
    ///
    /// The packet still counts against the budget, until it's passed to [Self::release_rx].
    pub fn pop_rx(&self) -> Option<RxPacket> {
        self.with_state(|state| {
            let packet = state.rx_queue.pop_front();
            self.update_rx_signals(state);
            packet
        })
    }
    /// Release a packet taken out with [Self::pop_rx].
    ///
    /// If `acknowledge` is set and the packet requested an acknowledgement from us, the radio task
    /// is asked to send one.
    pub fn release_rx(&self, packet: RxPacket, acknowledge: bool) {
        self.with_state(|state| {
            state.rx_bytes = state.rx_bytes.saturating_sub(packet.charged_bytes());
        });
        if !(acknowledge && packet.ack_owed()) {
            return;
        }
        let Some(header) = blazenet::MacHeader::parse(packet.data()) else {
            return;
        };
        if self
            .radio
            .request(RadioRequest::Acknowledge(header))
            .is_err()
        {
            warn!("Radio mailbox full, not acknowledging packet.");
        }
    }

    /// Allocate a packet for transmission.
    ///
    /// Payloads of invalid length are refused without setting the transmit overflow flag.
    pub fn alloc_tx(&self, payload: &[u8], sticky: bool) -> QueueResult<TxPacket> {
        let result = self.with_state(|state| {
            if payload.is_empty() || payload.len() > blazenet::MAX_PACKET_SIZE {
                return Err(QueueError::InvalidLength);
            }
            let required = TxPacket::footprint(payload.len());
            if state.tx_bytes + required > self.config.tx_budget {
                return Err(state.reject_tx(QueueError::BudgetExceeded));
            }
            let packet = TxPacket::new(payload, sticky).map_err(|error| state.reject_tx(error))?;
            state.tx_bytes += packet.charged_bytes();
            Ok(packet)
        });
        if let Err(error) = result {
            debug!("Failed to allocate TX packet: {:?}", error);
        }
        result
    }
    /// Submit a packet for transmission.
    ///
    /// If nothing is pending, the packet is passed to the radio task right away. Otherwise it's
    /// appended to the queue for `priority`. If that queue is full, the packet is released and the
    /// existing entries stay untouched.
    pub fn submit_tx(&self, priority: Priority, packet: TxPacket) -> QueueResult<()> {
        let result = self.with_state(|state| {
            let result = if state.tx_queues[priority.index()].is_full() {
                state.release_tx(packet, false);
                Err(state.reject_tx(QueueError::QueueFull))
            } else if state.tx_pending == 0 {
                match self.radio.request(RadioRequest::Transmit(packet)) {
                    Ok(()) => {
                        state.tx_pending = 1;
                        Ok(())
                    }
                    Err(RadioRequest::Transmit(packet)) => {
                        state.release_tx(packet, false);
                        Err(state.reject_tx(QueueError::RadioUnavailable))
                    }
                    Err(_) => Err(state.reject_tx(QueueError::RadioUnavailable)),
                }
            } else {
                // We checked for space above.
                let _ = state.tx_queues[priority.index()].push_back(packet);
                state.tx_pending += 1;
                Ok(())
            };
            self.update_tx_signals(state);
            result
        });
        if let Err(error) = result {
            debug!("Dropped packet for transmission: {:?}", error);
        }
        result
    }
    /// Take the next packet for transmission, from the highest priority non-empty queue.
    pub fn pop_tx(&self) -> Option<TxPacket> {
        self.with_state(|state| state.pop_highest_priority())
    }
    /// Release a packet for transmission.
    ///
    /// Sticky packets are only released if `force` is set. This never touches the pending count,
    /// which is only decremented by [Self::complete_tx].
    pub fn discard_tx(&self, packet: TxPacket, force: bool) {
        self.with_state(|state| state.release_tx(packet, force));
    }
    /// Finish the packet, that was in flight.
    ///
    /// This releases it (unless it's sticky), and returns the next packet to transmit, if any.
    pub fn complete_tx(&self, packet: TxPacket) -> Option<TxPacket> {
        self.with_state(|state| {
            state.release_tx(packet, false);
            state.tx_pending = state.tx_pending.saturating_sub(1);
            let next = if state.tx_pending > 0 {
                let next = state.pop_highest_priority();
                if next.is_none() {
                    // Can only happen if the counter got out of sync, so fix it up.
                    state.tx_pending = 0;
                }
                next
            } else {
                None
            };
            self.update_tx_signals(state);
            next
        })
    }

    /// Returns the current state flags.
    pub fn status(&self) -> QueueStatus {
        self.with_state(|state| state.status())
    }
    /// Returns the state flags and clears the sticky overflow flags.
    pub fn take_status(&self) -> QueueStatus {
        self.with_state(|state| {
            let status = state.status();
            state.rx_overflow = false;
            state.tx_overflow = false;
            status
        })
    }
    /// Returns the discard counters and resets them to zero.
    pub fn take_counters(&self) -> QueueCounters {
        self.with_state(|state| core::mem::take(&mut state.counters))
    }
    /// Number of bytes charged against the receive budget.
    pub fn rx_bytes(&self) -> usize {
        self.with_state(|state| state.rx_bytes)
    }
    /// Number of bytes charged against the transmit budget.
    pub fn tx_bytes(&self) -> usize {
        self.with_state(|state| state.tx_bytes)
    }
    /// Number of packets queued or in flight.
    pub fn tx_pending(&self) -> usize {
        self.with_state(|state| state.tx_pending)
    }
    /// Number of packets in the queue for `priority`.
    pub fn tx_queued(&self, priority: Priority) -> usize {
        self.with_state(|state| state.tx_queues[priority.index()].len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        irq::IrqConfig,
        radio::RadioRequest,
        testing::{unicast_frame, MockIrqLine},
    };

    fn info() -> RxInfo {
        RxInfo {
            rssi: -40,
            lqi: 200,
            local_address: 0x1234,
        }
    }

    macro_rules! setup {
        ($line:ident, $irq:ident, $mailbox:ident, $queue:ident, $config:expr) => {
            let $line = MockIrqLine::new();
            let $irq = IrqManager::new(&$line, IrqConfig::default());
            $irq.set_mask(Interrupt::all());
            let $mailbox = RadioMailbox::new();
            let $queue = PacketQueue::new(&$irq, &$mailbox, $config);
        };
    }

    fn take_transmit(mailbox: &RadioMailbox) -> TxPacket {
        match mailbox.try_take_request() {
            Some(RadioRequest::Transmit(packet)) => packet,
            _ => panic!("Expected a transmit request."),
        }
    }

    #[test]
    fn rx_fifo_order() {
        setup!(line, irq, mailbox, queue, QueueConfig::default());
        assert!(!irq.active().contains(Interrupt::PACKET_RECEIVED));

        queue.enqueue_rx(&[1], &info()).unwrap();
        queue.enqueue_rx(&[2, 2], &info()).unwrap();
        assert!(irq.active().contains(Interrupt::PACKET_RECEIVED));
        assert!(line.is_asserted());
        assert_eq!(queue.peek_rx(|packet| packet.len()), Some(1));

        let first = queue.pop_rx().unwrap();
        assert_eq!(first.data(), &[1]);
        assert_eq!(first.rssi(), -40);
        assert_eq!(first.lqi(), 200);
        assert!(irq.active().contains(Interrupt::PACKET_RECEIVED));
        queue.release_rx(first, true);

        let second = queue.pop_rx().unwrap();
        assert_eq!(second.data(), &[2, 2]);
        assert!(!irq.active().contains(Interrupt::PACKET_RECEIVED));
        queue.release_rx(second, false);
        assert_eq!(queue.rx_bytes(), 0);
        assert!(queue.pop_rx().is_none());
    }

    #[test]
    fn full_rx_queue_drops_newest() {
        setup!(_line, irq, mailbox, queue, QueueConfig::default());
        for i in 0..RX_QUEUE_CAPACITY {
            queue.enqueue_rx(&[i as u8, 0xaa], &info()).unwrap();
        }
        irq.acknowledge(Interrupt::all());
        assert!(!queue.status().rx_overflow);

        assert_eq!(
            queue.enqueue_rx(&[0xff, 0xff], &info()),
            Err(QueueError::QueueFull)
        );
        let status = queue.status();
        assert!(status.rx_full);
        assert!(status.rx_overflow);
        // Rejection doesn't raise the packet available interrupt.
        assert!(!irq.active().contains(Interrupt::PACKET_RECEIVED));

        let counters = queue.take_counters();
        assert_eq!(counters.rx.queue_full, 1);
        assert_eq!(counters.rx.budget_exceeded, 0);

        assert_eq!(queue.peek_rx(|packet| packet.data()[0]), Some(0));
        for i in 0..RX_QUEUE_CAPACITY {
            let packet = queue.pop_rx().unwrap();
            assert_eq!(packet.data(), &[i as u8, 0xaa]);
            queue.release_rx(packet, false);
        }
        assert!(queue.pop_rx().is_none());
    }

    #[test]
    fn rx_budget_is_enforced() {
        let budget = RxPacket::footprint(100) * 2;
        setup!(
            _line,
            irq,
            mailbox,
            queue,
            QueueConfig {
                rx_budget: budget,
                ..Default::default()
            }
        );
        queue.enqueue_rx(&[0; 100], &info()).unwrap();
        queue.enqueue_rx(&[1; 100], &info()).unwrap();
        assert_eq!(queue.rx_bytes(), budget);
        assert_eq!(
            queue.enqueue_rx(&[2; 1], &info()),
            Err(QueueError::BudgetExceeded)
        );
        assert!(queue.take_status().rx_overflow);
        assert!(!queue.status().rx_overflow);

        // Popping alone doesn't free the budget, releasing does.
        let packet = queue.pop_rx().unwrap();
        assert_eq!(
            queue.enqueue_rx(&[2; 1], &info()),
            Err(QueueError::BudgetExceeded)
        );
        queue.release_rx(packet, false);
        queue.enqueue_rx(&[2; 1], &info()).unwrap();

        let counters = queue.take_counters();
        assert_eq!(counters.rx.budget_exceeded, 2);
        assert_eq!(queue.take_counters(), QueueCounters::default());
    }

    #[test]
    fn invalid_rx_lengths_are_rejected() {
        setup!(_line, irq, mailbox, queue, QueueConfig::default());
        assert_eq!(
            queue.enqueue_rx(&[], &info()),
            Err(QueueError::InvalidLength)
        );
        assert_eq!(
            queue.enqueue_rx(&[0; 256], &info()),
            Err(QueueError::InvalidLength)
        );
        let status = queue.status();
        assert!(status.rx_empty);
        assert!(!status.rx_overflow);
        assert_eq!(queue.take_counters(), QueueCounters::default());
        assert_eq!(queue.rx_bytes(), 0);
    }

    #[test]
    fn invalid_tx_lengths_are_rejected() {
        setup!(_line, irq, mailbox, queue, QueueConfig::default());
        assert_eq!(
            queue.alloc_tx(&[], false).unwrap_err(),
            QueueError::InvalidLength
        );
        assert_eq!(
            queue.alloc_tx(&[0; 256], true).unwrap_err(),
            QueueError::InvalidLength
        );
        assert!(!queue.status().tx_overflow);
        assert_eq!(queue.take_counters(), QueueCounters::default());
        assert_eq!(queue.tx_bytes(), 0);
    }

    #[test]
    fn release_acknowledges_if_owed() {
        setup!(_line, irq, mailbox, queue, QueueConfig::default());
        let frame = unicast_frame(9, 0x0042, 0x1234, true, &[0xde, 0xad]);
        queue.enqueue_rx(&frame, &info()).unwrap();
        queue.enqueue_rx(&frame, &info()).unwrap();

        let packet = queue.pop_rx().unwrap();
        assert!(packet.ack_owed());
        queue.release_rx(packet, false);
        assert!(mailbox.try_take_request().is_none());

        let packet = queue.pop_rx().unwrap();
        queue.release_rx(packet, true);
        match mailbox.try_take_request() {
            Some(RadioRequest::Acknowledge(header)) => {
                assert_eq!(header.sequence, 9);
                assert_eq!(header.source, 0x0042);
                assert_eq!(header.destination, 0x1234);
            }
            _ => panic!("Expected an acknowledge request."),
        }
    }

    #[test]
    fn first_submission_goes_to_radio_directly() {
        setup!(_line, irq, mailbox, queue, QueueConfig::default());
        assert!(irq.active().contains(Interrupt::TX_QUEUE_EMPTY));

        let packet = queue.alloc_tx(&[0xaa, 0xbb], false).unwrap();
        queue.submit_tx(Priority::NetworkControl, packet).unwrap();
        assert_eq!(queue.tx_pending(), 1);
        assert_eq!(queue.tx_queued(Priority::NetworkControl), 0);
        assert!(!irq.active().contains(Interrupt::TX_QUEUE_EMPTY));

        let in_flight = take_transmit(&mailbox);
        assert_eq!(in_flight.data(), &[0xaa, 0xbb]);
        assert!(queue.complete_tx(in_flight).is_none());
        assert_eq!(queue.tx_pending(), 0);
        assert_eq!(queue.tx_bytes(), 0);
        assert!(irq.active().contains(Interrupt::TX_QUEUE_EMPTY));
    }

    #[test]
    fn highest_priority_is_transmitted_first() {
        setup!(_line, irq, mailbox, queue, QueueConfig::default());
        let first = queue.alloc_tx(&[0], false).unwrap();
        queue.submit_tx(Priority::Normal, first).unwrap();
        let in_flight = take_transmit(&mailbox);

        for (priority, byte) in [
            (Priority::Background, 1),
            (Priority::NetworkControl, 2),
            (Priority::Background, 3),
            (Priority::RealTime, 4),
        ] {
            let packet = queue.alloc_tx(&[byte], false).unwrap();
            queue.submit_tx(priority, packet).unwrap();
        }
        assert_eq!(queue.tx_pending(), 5);
        assert!(mailbox.try_take_request().is_none());

        let mut order = Vec::new();
        let mut next = queue.complete_tx(in_flight);
        while let Some(packet) = next {
            order.push(packet.data()[0]);
            next = queue.complete_tx(packet);
        }
        assert_eq!(order, [2, 4, 1, 3]);
        assert_eq!(queue.tx_pending(), 0);
    }

    #[test]
    fn pop_tx_prefers_network_control() {
        setup!(_line, irq, mailbox, queue, QueueConfig::default());
        let busy = queue.alloc_tx(&[0], false).unwrap();
        queue.submit_tx(Priority::Normal, busy).unwrap();

        let background = queue.alloc_tx(&[1], false).unwrap();
        queue.submit_tx(Priority::Background, background).unwrap();
        let control = queue.alloc_tx(&[2], false).unwrap();
        queue.submit_tx(Priority::NetworkControl, control).unwrap();

        assert_eq!(queue.pop_tx().unwrap().data(), &[2]);
        assert_eq!(queue.pop_tx().unwrap().data(), &[1]);
        assert!(queue.pop_tx().is_none());
    }

    #[test]
    fn full_tx_queue_drops_newest() {
        setup!(_line, irq, mailbox, queue, QueueConfig::default());
        let busy = queue.alloc_tx(&[0xff], false).unwrap();
        queue.submit_tx(Priority::Normal, busy).unwrap();

        for i in 0..TX_QUEUE_CAPACITY {
            let packet = queue.alloc_tx(&[i as u8], false).unwrap();
            queue.submit_tx(Priority::Background, packet).unwrap();
        }
        let bytes = queue.tx_bytes();
        for rejected in 0..3u32 {
            let packet = queue.alloc_tx(&[0xee], false).unwrap();
            assert_eq!(
                queue.submit_tx(Priority::Background, packet),
                Err(QueueError::QueueFull)
            );
            assert_eq!(queue.tx_bytes(), bytes);
            assert_eq!(queue.take_counters().tx.queue_full, 1, "rejection {}", rejected);
        }
        assert!(queue.status().tx_overflow);
        assert_eq!(queue.tx_pending(), TX_QUEUE_CAPACITY + 1);

        // Other priorities are unaffected.
        let packet = queue.alloc_tx(&[0xcc], false).unwrap();
        queue.submit_tx(Priority::RealTime, packet).unwrap();
        assert_eq!(queue.pop_tx().unwrap().data(), &[0xcc]);

        for i in 0..TX_QUEUE_CAPACITY {
            assert_eq!(queue.pop_tx().unwrap().data(), &[i as u8]);
        }
    }

    #[test]
    fn sticky_packets_need_a_forced_discard() {
        setup!(_line, irq, mailbox, queue, QueueConfig::default());
        let before = queue.tx_bytes();
        let packet = queue.alloc_tx(&[1, 2, 3, 4], true).unwrap();
        let allocated = queue.tx_bytes();
        assert!(allocated > before);

        queue.discard_tx(packet.clone(), false);
        assert_eq!(queue.tx_bytes(), allocated);
        assert_eq!(packet.data(), &[1, 2, 3, 4]);

        queue.discard_tx(packet, true);
        assert_eq!(queue.tx_bytes(), before);
    }

    #[test]
    fn discard_leaves_pending_count_alone() {
        setup!(_line, irq, mailbox, queue, QueueConfig::default());
        let busy = queue.alloc_tx(&[0], false).unwrap();
        queue.submit_tx(Priority::Normal, busy).unwrap();
        let in_flight = take_transmit(&mailbox);
        assert_eq!(queue.tx_pending(), 1);

        let unsent = queue.alloc_tx(&[1, 2], false).unwrap();
        queue.discard_tx(unsent, false);
        assert_eq!(queue.tx_pending(), 1);
        assert!(!irq.active().contains(Interrupt::TX_QUEUE_EMPTY));

        assert!(queue.complete_tx(in_flight).is_none());
        assert_eq!(queue.tx_pending(), 0);
        assert_eq!(queue.tx_bytes(), 0);
        assert!(irq.active().contains(Interrupt::TX_QUEUE_EMPTY));
    }

    #[test]
    fn sticky_packets_survive_transmission() {
        setup!(_line, irq, mailbox, queue, QueueConfig::default());
        let beacon = queue.alloc_tx(&[0xbe], true).unwrap();
        let allocated = queue.tx_bytes();
        for _ in 0..2 {
            queue
                .submit_tx(Priority::NetworkControl, beacon.clone())
                .unwrap();
            let in_flight = take_transmit(&mailbox);
            assert!(in_flight.same_buffer(&beacon));
            assert!(queue.complete_tx(in_flight).is_none());
            assert_eq!(queue.tx_bytes(), allocated);
        }
    }

    #[test]
    fn tx_budget_is_enforced() {
        let budget = TxPacket::footprint(10);
        setup!(
            _line,
            irq,
            mailbox,
            queue,
            QueueConfig {
                tx_budget: budget,
                ..Default::default()
            }
        );
        let packet = queue.alloc_tx(&[0; 10], false).unwrap();
        assert_eq!(
            queue.alloc_tx(&[0; 1], false).unwrap_err(),
            QueueError::BudgetExceeded
        );
        assert_eq!(queue.take_counters().tx.budget_exceeded, 1);
        queue.discard_tx(packet, false);
        assert!(queue.alloc_tx(&[0; 1], false).is_ok());
    }
}
