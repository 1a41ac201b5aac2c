use crate::{
    blazenet::{self, MacHeader},
    irq::{Interrupt, IrqManager},
    packet::{PacketQueue, Priority, RxInfo, TxPacket},
};

use super::{RadioControl, RadioDriver, RadioEvents, RadioLink, RadioMailbox, RadioRequest, Wakeup};

/// The packet currently owned by the transceiver.
struct InFlight {
    packet: TxPacket,
    csma_failures: u8,
}

/// Moves frames between the transceiver and the packet queues.
pub struct RadioTask<'a, D: RadioDriver> {
    link: &'a RadioLink<D>,
    mailbox: &'a RadioMailbox,
    queue: &'a PacketQueue<'a>,
    irq: &'a IrqManager<'a>,
    in_flight: Option<InFlight>,
    frame_buffer: [u8; blazenet::PHY_HEADER_LENGTH + blazenet::MAX_PACKET_SIZE],
}
impl<'a, D: RadioDriver> RadioTask<'a, D> {
    pub fn new(
        link: &'a RadioLink<D>,
        mailbox: &'a RadioMailbox,
        queue: &'a PacketQueue<'a>,
        irq: &'a IrqManager<'a>,
    ) -> Self {
        Self {
            link,
            mailbox,
            queue,
            irq,
            in_flight: None,
            frame_buffer: [0; blazenet::PHY_HEADER_LENGTH + blazenet::MAX_PACKET_SIZE],
        }
    }
    /// Check if a packet is currently being transmitted.
    pub fn is_transmitting(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Handle events reported by the transceiver.
    pub fn process_events(&mut self, events: RadioEvents) {
        trace!("Processing radio events {:?}.", events);
        if events.contains(RadioEvents::RX_FIFO_OVERFLOW) {
            self.link.count(|counters| {
                counters.rx_fifo_overflows = counters.rx_fifo_overflows.wrapping_add(1)
            });
        }
        if events.contains(RadioEvents::RX_FRAME_ERROR) {
            self.link.count(|counters| {
                counters.rx_frame_errors = counters.rx_frame_errors.wrapping_add(1)
            });
        }
        if events.contains(RadioEvents::RX_READY) {
            self.receive_frames();
        }
        if events.contains(RadioEvents::CALIBRATION_NEEDED) {
            // Nothing gets transmitted, until this is done.
            if let Err(err) = self.link.with_driver(|driver| driver.calibrate()) {
                warn!("Radio calibration failed: {:?}", err);
            }
        }
        if events.contains(RadioEvents::TX_COMPLETE) {
            self.link
                .count(|counters| counters.tx_frames = counters.tx_frames.wrapping_add(1));
            self.irq.assert(Interrupt::PACKET_TRANSMITTED);
            self.finish_in_flight();
        } else if events.contains(RadioEvents::TX_ABORTED) {
            self.link
                .count(|counters| counters.tx_aborted = counters.tx_aborted.wrapping_add(1));
            debug!("Transmission aborted.");
            self.finish_in_flight();
        } else if events.contains(RadioEvents::CHANNEL_BUSY) {
            self.handle_channel_busy();
        }
    }
    /// Handle a request from the packet queues.
    pub fn process_request(&mut self, request: RadioRequest) {
        match request {
            RadioRequest::Transmit(packet) => {
                if self.in_flight.is_some() {
                    error!("Transmit request while busy, dropping packet.");
                    self.queue.discard_tx(packet, false);
                    return;
                }
                self.transmit(packet);
            }
            RadioRequest::Acknowledge(header) => self.send_ack(&header),
        }
    }
    /// Process everything that is currently in the mailbox, without waiting.
    pub fn poll(&mut self) {
        loop {
            let events = self.mailbox.take_events();
            if !events.is_empty() {
                self.process_events(events);
                continue;
            }
            match self.mailbox.try_take_request() {
                Some(request) => self.process_request(request),
                None => break,
            }
        }
    }
    /// Run the radio task.
    pub async fn run(&mut self) -> ! {
        trace!("Radio task running.");
        loop {
            match self.mailbox.wait().await {
                Wakeup::Events(events) => self.process_events(events),
                Wakeup::Request(request) => self.process_request(request),
            }
        }
    }

    /// Drain the receive FIFO into the packet queue.
    fn receive_frames(&mut self) {
        let local_address = self.link.address();
        loop {
            let Some(frame) = self
                .link
                .with_driver(|driver| driver.read_frame(&mut self.frame_buffer))
            else {
                break;
            };
            let Some(payload) = Self::strip_phy_header(&self.frame_buffer, frame.length) else {
                debug!("Received frame with invalid PHY header.");
                self.link.count(|counters| {
                    counters.rx_frame_errors = counters.rx_frame_errors.wrapping_add(1)
                });
                continue;
            };
            self.link
                .count(|counters| counters.rx_frames = counters.rx_frames.wrapping_add(1));
            // Failures are accounted for by the queue.
            let _ = self.queue.enqueue_rx(
                payload,
                &RxInfo {
                    rssi: frame.rssi,
                    lqi: frame.lqi,
                    local_address,
                },
            );
        }
    }
    /// Check the PHY header against the number of bytes read and return the frame after it.
    fn strip_phy_header(buffer: &[u8], length: usize) -> Option<&[u8]> {
        let frame = buffer.get(..length)?;
        let (&phy_length, payload) = frame.split_first()?;
        (!payload.is_empty() && phy_length as usize == payload.len()).then_some(payload)
    }

    /// Start transmitting `packet`, moving on to the next one if that fails.
    fn transmit(&mut self, packet: TxPacket) {
        let mut next = Some(packet);
        while let Some(packet) = next.take() {
            if self.start_transmission(&packet) {
                self.in_flight = Some(InFlight {
                    packet,
                    csma_failures: 0,
                });
            } else {
                next = self.queue.complete_tx(packet);
            }
        }
    }
    /// Load the packet into the transmit FIFO and start transmission.
    fn start_transmission(&mut self, packet: &TxPacket) -> bool {
        let length = packet.len();
        let frame = &mut self.frame_buffer[..blazenet::PHY_HEADER_LENGTH + length];
        frame[0] = length as u8;
        frame[blazenet::PHY_HEADER_LENGTH..].copy_from_slice(packet.data());

        let config = self.link.config();
        let csma = config.use_csma.then_some(&config.csma);
        let channel = self.link.channel();
        let result = self.link.with_driver(|driver| {
            let written = driver.load_tx_fifo(frame);
            if written < frame.len() {
                return Err(written);
            }
            driver.start_tx(channel, csma).map_err(|_| written)
        });
        match result {
            Ok(()) => {
                trace!("Started transmission of {} bytes on channel {}.", length, channel);
                true
            }
            Err(written) if written < frame.len() => {
                warn!("TX FIFO only took {}/{} bytes.", written, frame.len());
                self.link.count(|counters| {
                    counters.tx_fifo_short = counters.tx_fifo_short.wrapping_add(1)
                });
                false
            }
            Err(_) => {
                warn!("Failed to start transmission.");
                self.link
                    .count(|counters| counters.tx_dropped = counters.tx_dropped.wrapping_add(1));
                false
            }
        }
    }
    /// Complete the current transmission and chain the next one.
    fn finish_in_flight(&mut self) {
        let Some(in_flight) = self.in_flight.take() else {
            debug!("Transmission event without packet in flight.");
            return;
        };
        if let Some(next) = self.queue.complete_tx(in_flight.packet) {
            self.transmit(next);
        }
    }
    /// Retry after a failed channel access, or drop the packet if there were too many.
    fn handle_channel_busy(&mut self) {
        self.link.count(|counters| {
            counters.tx_channel_busy = counters.tx_channel_busy.wrapping_add(1)
        });
        let max_retries = self.link.config().max_csma_retries;
        let Some(in_flight) = self.in_flight.as_mut() else {
            return;
        };
        in_flight.csma_failures = in_flight.csma_failures.saturating_add(1);
        if in_flight.csma_failures > max_retries {
            warn!(
                "Channel access failed {} times, dropping packet.",
                in_flight.csma_failures
            );
            self.link
                .count(|counters| counters.tx_dropped = counters.tx_dropped.wrapping_add(1));
            self.finish_in_flight();
            return;
        }
        debug!("Channel busy, retry {}.", in_flight.csma_failures);
        let packet = in_flight.packet.clone();
        if !self.start_transmission(&packet) {
            self.finish_in_flight();
        }
    }
    /// Queue an acknowledgement for the frame with `header`.
    fn send_ack(&mut self, header: &MacHeader) {
        let ack = MacHeader::ack_for(header).to_bytes();
        let Ok(packet) = self.queue.alloc_tx(&ack, false) else {
            return;
        };
        if self.queue.submit_tx(Priority::NetworkControl, packet).is_ok() {
            trace!("Queued acknowledgement for sequence {}.", header.sequence);
            self.link
                .count(|counters| counters.acks_sent = counters.acks_sent.wrapping_add(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        irq::IrqConfig,
        packet::QueueConfig,
        radio::{LinkConfig, RadioCounters},
        testing::{unicast_frame, MockIrqLine, MockRadio},
    };

    macro_rules! setup {
        ($irq:ident, $mailbox:ident, $queue:ident, $link:ident, $task:ident, $config:expr) => {
            let line = MockIrqLine::new();
            let $irq = IrqManager::new(&line, IrqConfig::default());
            $irq.set_mask(Interrupt::all());
            let $mailbox = RadioMailbox::new();
            let $queue = PacketQueue::new(&$irq, &$mailbox, QueueConfig::default());
            let $link = RadioLink::new(MockRadio::new(), $config);
            $link.set_channel(11).unwrap();
            $link.set_address(0x1234).unwrap();
            let mut $task = RadioTask::new(&$link, &$mailbox, &$queue, &$irq);
        };
    }

    #[test]
    fn received_frames_are_queued() {
        setup!(irq, mailbox, queue, link, task, LinkConfig::default());
        link.with_driver(|radio| {
            radio.push_frame(&[0x10, 1, 0, 0, 0, 0, 0xaa], -60, 180);
            radio.push_frame(&[0x10, 2, 0, 0, 0, 0, 0xbb], -70, 90);
        });
        mailbox.notify(RadioEvents::RX_READY);
        task.poll();

        assert!(irq.active().contains(Interrupt::PACKET_RECEIVED));
        let packet = queue.pop_rx().unwrap();
        assert_eq!(packet.data(), &[0x10, 1, 0, 0, 0, 0, 0xaa]);
        assert_eq!(packet.rssi(), -60);
        assert_eq!(packet.lqi(), 180);
        queue.release_rx(packet, true);
        assert_eq!(queue.pop_rx().unwrap().lqi(), 90);
        assert_eq!(link.take_counters().rx_frames, 2);
    }

    #[test]
    fn bad_phy_header_counts_as_frame_error() {
        setup!(irq, mailbox, queue, link, task, LinkConfig::default());
        link.with_driver(|radio| radio.push_raw_frame(&[5, 1, 2], 0, 0));
        mailbox.notify(RadioEvents::RX_READY | RadioEvents::RX_FIFO_OVERFLOW);
        task.poll();
        assert!(queue.pop_rx().is_none());
        let counters = link.take_counters();
        assert_eq!(counters.rx_frame_errors, 1);
        assert_eq!(counters.rx_fifo_overflows, 1);
        assert_eq!(counters.rx_frames, 0);
    }

    #[test]
    fn transmissions_are_chained() {
        setup!(irq, mailbox, queue, link, task, LinkConfig::default());
        let first = queue.alloc_tx(&[1], false).unwrap();
        queue.submit_tx(Priority::Normal, first).unwrap();
        let second = queue.alloc_tx(&[2, 2], false).unwrap();
        queue.submit_tx(Priority::Background, second).unwrap();
        task.poll();
        assert!(task.is_transmitting());
        link.with_driver(|radio| {
            assert_eq!(radio.transmitted, [vec![1, 1]]);
            assert_eq!(radio.tx_starts, [(11, true)]);
        });

        mailbox.notify(RadioEvents::TX_COMPLETE);
        task.poll();
        assert!(irq.active().contains(Interrupt::PACKET_TRANSMITTED));
        link.with_driver(|radio| assert_eq!(radio.transmitted[1], [2, 2, 2]));
        assert_eq!(queue.tx_pending(), 1);

        mailbox.notify(RadioEvents::TX_COMPLETE);
        task.poll();
        assert!(!task.is_transmitting());
        assert_eq!(queue.tx_pending(), 0);
        assert_eq!(queue.tx_bytes(), 0);
        assert!(irq.active().contains(Interrupt::TX_QUEUE_EMPTY));
        assert_eq!(link.take_counters().tx_frames, 2);
    }

    #[test]
    fn channel_busy_is_retried_then_dropped() {
        setup!(irq, mailbox, queue, link, task, LinkConfig::default());
        let packet = queue.alloc_tx(&[7; 4], false).unwrap();
        queue.submit_tx(Priority::RealTime, packet).unwrap();
        task.poll();

        for _ in 0..3 {
            mailbox.notify(RadioEvents::CHANNEL_BUSY);
            task.poll();
            assert!(task.is_transmitting());
        }
        link.with_driver(|radio| assert_eq!(radio.tx_starts.len(), 4));

        mailbox.notify(RadioEvents::CHANNEL_BUSY);
        task.poll();
        assert!(!task.is_transmitting());
        assert_eq!(queue.tx_pending(), 0);
        assert_eq!(queue.tx_bytes(), 0);
        let counters = link.take_counters();
        assert_eq!(counters.tx_channel_busy, 4);
        assert_eq!(counters.tx_dropped, 1);
        assert_eq!(counters.tx_frames, 0);
    }

    #[test]
    fn csma_can_be_disabled() {
        setup!(
            irq,
            mailbox,
            queue,
            link,
            task,
            LinkConfig {
                use_csma: false,
                ..Default::default()
            }
        );
        let packet = queue.alloc_tx(&[1], false).unwrap();
        queue.submit_tx(Priority::Normal, packet).unwrap();
        task.poll();
        link.with_driver(|radio| assert_eq!(radio.tx_starts, [(11, false)]));
    }

    #[test]
    fn short_fifo_write_drops_packet() {
        setup!(irq, mailbox, queue, link, task, LinkConfig::default());
        link.with_driver(|radio| radio.fifo_capacity = 4);
        let too_long = queue.alloc_tx(&[0; 8], false).unwrap();
        queue.submit_tx(Priority::Normal, too_long).unwrap();
        task.poll();
        assert!(!task.is_transmitting());
        assert_eq!(queue.tx_pending(), 0);
        assert_eq!(
            link.take_counters(),
            RadioCounters {
                tx_fifo_short: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn aborted_transmission_completes_packet() {
        setup!(irq, mailbox, queue, link, task, LinkConfig::default());
        let packet = queue.alloc_tx(&[1], false).unwrap();
        queue.submit_tx(Priority::Normal, packet).unwrap();
        task.poll();
        link.set_channel(12).unwrap();
        mailbox.notify(RadioEvents::TX_ABORTED);
        task.poll();
        assert!(!task.is_transmitting());
        assert_eq!(queue.tx_pending(), 0);
        assert!(!irq.active().contains(Interrupt::PACKET_TRANSMITTED));
        assert_eq!(link.take_counters().tx_aborted, 1);
    }

    #[test]
    fn calibration_runs_in_task() {
        setup!(irq, mailbox, queue, link, task, LinkConfig::default());
        mailbox.notify(RadioEvents::CALIBRATION_NEEDED);
        task.poll();
        link.with_driver(|radio| assert_eq!(radio.calibrations, 1));
    }

    #[test]
    fn owed_acknowledgement_is_transmitted() {
        setup!(irq, mailbox, queue, link, task, LinkConfig::default());
        let frame = unicast_frame(0x21, 0x0042, 0x1234, true, &[0xde, 0xad]);
        link.with_driver(|radio| radio.push_frame(&frame, -50, 255));
        mailbox.notify(RadioEvents::RX_READY);
        task.poll();

        let packet = queue.pop_rx().unwrap();
        queue.release_rx(packet, true);
        task.poll();
        assert!(task.is_transmitting());
        link.with_driver(|radio| {
            assert_eq!(
                radio.transmitted,
                [vec![6, 0b0000_1000, 0x21, 0x34, 0x12, 0x42, 0x00]]
            );
        });
        assert_eq!(link.take_counters().acks_sent, 1);
    }
}
