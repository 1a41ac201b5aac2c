//! Mocks for the hardware seams, used by the unit tests.

use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll, Waker},
};
use std::{
    cell::RefCell,
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::Wake,
    vec::Vec,
};

use embassy_time::{Duration, MockDriver};
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::{
    blazenet::{endpoint, HeaderFlags, MacHeader, ShortAddress},
    host::{HostTransport, TransportError, TransportResult},
    irq::IrqLine,
    radio::{CsmaConfig, FrameInfo, RadioDriver, RadioResult},
    watchdog::AttentionIndicator,
};

static CLOCK: Mutex<()> = Mutex::new(());

/// Exclusive access to the global mock time driver.
///
/// Tests advancing time hold this, so timers of concurrently running tests don't expire early.
pub struct MockClock {
    _guard: MutexGuard<'static, ()>,
}
impl MockClock {
    pub fn acquire() -> Self {
        Self {
            _guard: CLOCK.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }
    pub fn advance(&self, duration: Duration) {
        MockDriver::get().advance(duration);
    }
    pub fn advance_millis(&self, millis: u64) {
        self.advance(Duration::from_millis(millis));
    }
}

struct NoopWaker;
impl Wake for NoopWaker {
    fn wake(self: Arc<Self>) {}
}

/// Poll a future once. Timers are re-checked on every poll, so the waker isn't needed.
pub fn poll_once<F: Future>(future: Pin<&mut F>) -> Poll<F::Output> {
    let waker = Waker::from(Arc::new(NoopWaker));
    future.poll(&mut Context::from_waker(&waker))
}

/// Build a user data frame.
pub fn unicast_frame(
    sequence: u8,
    source: ShortAddress,
    destination: ShortAddress,
    ack_request: bool,
    payload: &[u8],
) -> Vec<u8> {
    let header = MacHeader {
        flags: HeaderFlags::new()
            .with_ack_request(ack_request)
            .with_endpoint(endpoint::USER_DATA),
        sequence,
        source,
        destination,
    };
    let mut frame = header.to_bytes().to_vec();
    frame.extend_from_slice(payload);
    frame
}

#[derive(Default)]
pub struct MockIrqLine {
    asserted: AtomicBool,
    edges: AtomicUsize,
}
impl MockIrqLine {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn is_asserted(&self) -> bool {
        self.asserted.load(Ordering::Relaxed)
    }
    /// Number of times the line changed state.
    pub fn edge_count(&self) -> usize {
        self.edges.load(Ordering::Relaxed)
    }
}
impl IrqLine for MockIrqLine {
    fn set_asserted(&self, asserted: bool) {
        if self.asserted.swap(asserted, Ordering::Relaxed) != asserted {
            self.edges.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[derive(Default)]
pub struct MockIndicator {
    blinking: AtomicBool,
}
impl MockIndicator {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn is_blinking(&self) -> bool {
        self.blinking.load(Ordering::Relaxed)
    }
}
impl AttentionIndicator for MockIndicator {
    fn blink_fast(&self) {
        self.blinking.store(true, Ordering::Relaxed);
    }
    fn off(&self) {
        self.blinking.store(false, Ordering::Relaxed);
    }
}

/// A transceiver, that records what it's asked to do.
pub struct MockRadio {
    rx_fifo: VecDeque<(Vec<u8>, i8, u8)>,
    tx_fifo: Vec<u8>,
    /// Contents of the transmit FIFO for every started transmission.
    pub transmitted: Vec<Vec<u8>>,
    /// Channel and CSMA flag of every started transmission.
    pub tx_starts: Vec<(u16, bool)>,
    pub fifo_capacity: usize,
    pub rx_channel: Option<u16>,
    pub tx_power: u16,
    pub address: ShortAddress,
    pub fifo_resets: usize,
    pub calibrations: usize,
    pub transmitting: bool,
}
impl MockRadio {
    pub fn new() -> Self {
        Self {
            rx_fifo: VecDeque::new(),
            tx_fifo: Vec::new(),
            transmitted: Vec::new(),
            tx_starts: Vec::new(),
            fifo_capacity: 512,
            rx_channel: None,
            tx_power: 0,
            address: 0,
            fifo_resets: 0,
            calibrations: 0,
            transmitting: false,
        }
    }
    /// Put a frame into the receive FIFO, prefixed with a correct PHY header.
    pub fn push_frame(&mut self, frame: &[u8], rssi: i8, lqi: u8) {
        let mut raw = vec![frame.len() as u8];
        raw.extend_from_slice(frame);
        self.rx_fifo.push_back((raw, rssi, lqi));
    }
    /// Put raw bytes into the receive FIFO.
    pub fn push_raw_frame(&mut self, raw: &[u8], rssi: i8, lqi: u8) {
        self.rx_fifo.push_back((raw.to_vec(), rssi, lqi));
    }
}
impl RadioDriver for MockRadio {
    fn read_frame(&mut self, buffer: &mut [u8]) -> Option<FrameInfo> {
        let (raw, rssi, lqi) = self.rx_fifo.pop_front()?;
        buffer[..raw.len()].copy_from_slice(&raw);
        Some(FrameInfo {
            length: raw.len(),
            rssi,
            lqi,
        })
    }
    fn load_tx_fifo(&mut self, frame: &[u8]) -> usize {
        let written = frame.len().min(self.fifo_capacity);
        self.tx_fifo.clear();
        self.tx_fifo.extend_from_slice(&frame[..written]);
        written
    }
    fn start_tx(&mut self, channel: u16, csma: Option<&CsmaConfig>) -> RadioResult<()> {
        self.transmitted.push(self.tx_fifo.clone());
        self.tx_starts.push((channel, csma.is_some()));
        self.transmitting = true;
        Ok(())
    }
    fn idle(&mut self) {
        self.rx_channel = None;
        self.transmitting = false;
    }
    fn reset_fifos(&mut self) {
        self.fifo_resets += 1;
        self.rx_fifo.clear();
        self.tx_fifo.clear();
    }
    fn start_rx(&mut self, channel: u16) -> RadioResult<()> {
        self.rx_channel = Some(channel);
        Ok(())
    }
    fn set_tx_power(&mut self, deci_dbm: u16) -> RadioResult<()> {
        self.tx_power = deci_dbm;
        Ok(())
    }
    fn set_address(&mut self, address: ShortAddress) {
        self.address = address;
    }
    fn calibrate(&mut self) -> RadioResult<()> {
        self.calibrations += 1;
        Ok(())
    }
    fn is_valid_channel(&self, channel: u16) -> bool {
        channel <= 20
    }
    fn is_active(&self) -> bool {
        self.rx_channel.is_some() || self.transmitting
    }
}

/// A host transport fed from a script of transfers.
#[derive(Default)]
pub struct MockTransport {
    incoming: RefCell<VecDeque<TransportResult<Vec<u8>>>>,
    /// Everything transmitted to the host.
    pub responses: RefCell<Vec<Vec<u8>>>,
    pub fail_transmit: bool,
}
impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }
    /// Queue a transfer from the host.
    pub fn push(&self, bytes: &[u8]) {
        self.incoming.borrow_mut().push_back(Ok(bytes.to_vec()));
    }
    /// Queue a failed transfer from the host.
    pub fn push_error(&self) {
        self.incoming
            .borrow_mut()
            .push_back(Err(TransportError::Framing));
    }
    pub fn is_drained(&self) -> bool {
        self.incoming.borrow().is_empty()
    }
}
impl HostTransport for MockTransport {
    async fn receive(&mut self, buffer: &mut [u8]) -> TransportResult<usize> {
        let transfer = self
            .incoming
            .borrow_mut()
            .pop_front()
            .unwrap_or(Err(TransportError::Closed))?;
        let length = transfer.len().min(buffer.len());
        buffer[..length].copy_from_slice(&transfer[..length]);
        Ok(length)
    }
    async fn transmit(&mut self, data: &[u8]) -> TransportResult<()> {
        if self.fail_transmit {
            return Err(TransportError::Framing);
        }
        self.responses.borrow_mut().push(data.to_vec());
        Ok(())
    }
}
