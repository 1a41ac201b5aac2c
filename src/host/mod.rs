//! # Host interface
//! The host talks to us through a byte oriented transport (usually SPI), using a simple
//! request/response protocol.
//!
//! Every exchange starts with the host sending a two byte [CommandHeader]. The high bit of the
//! command byte selects the direction:
//! - Clear: the host writes `payload_length` bytes of payload, which are then passed to the
//!   handler.
//! - Set: the handler is invoked to produce at most `payload_length` bytes of response, which the
//!   host then reads.
//!
//! A header without payload is always dispatched as a write with an empty payload.
//!
//! Invalid commands, or commands used in a direction they don't support, are dropped without a
//! response. Failing handlers set the error flag, which the host reads through GetStatus, and
//! raise [crate::irq::Interrupt::COMMAND_ERROR].
//!
//! The [Dispatcher] implements the protocol as a synchronous state machine, which is driven by
//! [HostInterface] over a [HostTransport].

mod commands;
mod handlers;

pub use commands::*;
pub use handlers::{
    CommandHandler, HandlerError, HandlerFlags, HandlerResult, HostContext, PostReadHandler,
    ReadHandler, WriteHandler,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// The transfer was aborted or garbled.
    Framing,
    /// The transport is gone.
    Closed,
}
pub type TransportResult<T> = Result<T, TransportError>;

/// The byte transport to the host.
#[allow(async_fn_in_trait)]
pub trait HostTransport {
    /// Receive up to `buffer.len()` bytes, returning the number of bytes received.
    async fn receive(&mut self, buffer: &mut [u8]) -> TransportResult<usize>;
    /// Transmit a response.
    async fn transmit(&mut self, data: &[u8]) -> TransportResult<()>;
}

/// State of the [Dispatcher].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DispatchState {
    /// Waiting for a header.
    #[default]
    Idle,
    /// A header was received and is being decoded.
    HeaderReceived,
    /// Waiting for the payload of a write.
    AwaitingPayload,
    /// The response of a read is being transmitted.
    DispatchingRead,
    /// A command without payload was dispatched.
    Dispatched,
}

/// What the transport should do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Step {
    /// Receive the next header.
    ReceiveHeader,
    /// Receive this many bytes of payload, into [Dispatcher::payload_buffer].
    ReceivePayload(usize),
    /// Transmit this many bytes of [Dispatcher::response].
    Transmit(usize),
}

/// The exchange in progress.
#[derive(Clone, Copy)]
struct Exchange {
    header: CommandHeader,
    /// Length of the response produced by the read handler.
    transferred: usize,
    handler: &'static CommandHandler,
}

/// Decodes command headers and dispatches them to the handlers.
pub struct Dispatcher<'a> {
    context: &'a HostContext<'a>,
    state: DispatchState,
    exchange: Option<Exchange>,
    buffer: [u8; MAX_PAYLOAD_SIZE],
}
impl<'a> Dispatcher<'a> {
    pub fn new(context: &'a HostContext<'a>) -> Self {
        Self {
            context,
            state: DispatchState::Idle,
            exchange: None,
            buffer: [0; MAX_PAYLOAD_SIZE],
        }
    }
    pub fn state(&self) -> DispatchState {
        self.state
    }
    /// Return to idle and wait for the next header.
    fn rearm(&mut self) -> Step {
        self.state = DispatchState::Idle;
        self.exchange = None;
        Step::ReceiveHeader
    }
    /// Look up the handler, checking that it supports the direction.
    fn resolve(header: &CommandHeader, is_read: bool) -> Option<&'static CommandHandler> {
        let Some(handler) = CommandHandler::lookup(header.command) else {
            warn!("Invalid command {:#x}.", header.command);
            return None;
        };
        let supported = if is_read {
            handler.supports_read()
        } else {
            handler.supports_write()
        };
        if !supported {
            warn!(
                "Command {:#x} doesn't support {}.",
                header.command,
                if is_read { "read" } else { "write" }
            );
            return None;
        }
        Some(handler)
    }
    /// Process a received header.
    ///
    /// `None` indicates, that the header transfer failed.
    pub fn header_received(&mut self, header: Option<[u8; CommandHeader::LENGTH]>) -> Step {
        let Some(header) = header else {
            debug!("Failed to receive command header.");
            return self.rearm();
        };
        let header = CommandHeader::from_bytes(header);
        self.state = DispatchState::HeaderReceived;
        self.context.watchdog.checkin();
        trace!(
            "Command {:#x}, read: {}, length: {}",
            header.command,
            header.is_read,
            header.payload_length
        );

        if header.payload_length == 0 {
            self.state = DispatchState::Dispatched;
            if let Some(handler) = Self::resolve(&header, false) {
                self.dispatch_write(header.command, handler, 0);
            }
            return self.rearm();
        }
        let Some(handler) = Self::resolve(&header, header.is_read) else {
            return self.rearm();
        };
        let mut exchange = Exchange {
            header,
            transferred: 0,
            handler,
        };
        if header.is_read {
            let Some(length) = self.dispatch_read(&exchange) else {
                return self.rearm();
            };
            exchange.transferred = length;
            self.exchange = Some(exchange);
            self.state = DispatchState::DispatchingRead;
            Step::Transmit(length)
        } else {
            self.exchange = Some(exchange);
            self.state = DispatchState::AwaitingPayload;
            Step::ReceivePayload(self.expected_payload_length())
        }
    }
    fn expected_payload_length(&self) -> usize {
        self.exchange.map_or(0, |exchange| {
            (exchange.header.payload_length as usize).min(MAX_PAYLOAD_SIZE)
        })
    }
    /// The buffer the payload of a write is received into.
    pub fn payload_buffer(&mut self) -> &mut [u8] {
        let length = self.expected_payload_length();
        &mut self.buffer[..length]
    }
    /// Process a received payload.
    ///
    /// `None` indicates, that the payload transfer failed.
    pub fn payload_received(&mut self, length: Option<usize>) -> Step {
        let expected = self.expected_payload_length();
        let Some(exchange) = self
            .exchange
            .filter(|_| self.state == DispatchState::AwaitingPayload)
        else {
            return self.rearm();
        };
        match length {
            Some(length) if length > 0 => {
                let length = length.min(expected);
                self.dispatch_write(exchange.header.command, exchange.handler, length);
            }
            _ => warn!("Failed to receive payload."),
        }
        self.rearm()
    }
    /// The response to transmit.
    pub fn response(&self) -> &[u8] {
        match self.exchange {
            Some(exchange) if self.state == DispatchState::DispatchingRead => {
                &self.buffer[..exchange.transferred]
            }
            _ => &[],
        }
    }
    /// Finish a read, once the response was transmitted.
    pub fn response_transmitted(&mut self, success: bool) -> Step {
        if let Some(exchange) = self
            .exchange
            .filter(|_| self.state == DispatchState::DispatchingRead)
        {
            if !success {
                warn!(
                    "Failed to transmit response to {:#x}.",
                    exchange.header.command
                );
            }
            self.post_read(exchange.handler, success);
        }
        self.rearm()
    }

    fn dispatch_write(&mut self, command: u8, handler: &'static CommandHandler, length: usize) {
        let Some(write) = handler.write else {
            return;
        };
        if let Err(err) = write(self.context, command, &self.buffer[..length]) {
            warn!("Command {:#x} write failed: {:?}", command, err);
            self.context.flag_error();
        }
    }
    /// Invoke the read handler, returning the length of the response.
    fn dispatch_read(&mut self, exchange: &Exchange) -> Option<usize> {
        let read = exchange.handler.read?;
        let command = exchange.header.command;
        let result = read(
            self.context,
            command,
            exchange.header.payload_length as usize,
            &mut self.buffer,
        )
        .and_then(|length| {
            if length < self.buffer.len() {
                Ok(length)
            } else {
                Err(HandlerError::ResponseTooLong)
            }
        });
        match result {
            Ok(length) => Some(length),
            Err(err) => {
                warn!("Command {:#x} read failed: {:?}", command, err);
                self.context.flag_error();
                self.post_read(exchange.handler, false);
                None
            }
        }
    }
    fn post_read(&self, handler: &CommandHandler, success: bool) {
        if !handler.wants_post_read() {
            return;
        }
        if let Some(post_read) = handler.post_read {
            post_read(self.context, success);
        }
    }
}

/// Serves host commands over a transport.
pub struct HostInterface<'a, T: HostTransport> {
    transport: T,
    dispatcher: Dispatcher<'a>,
}
impl<'a, T: HostTransport> HostInterface<'a, T> {
    pub fn new(transport: T, context: &'a HostContext<'a>) -> Self {
        Self {
            transport,
            dispatcher: Dispatcher::new(context),
        }
    }
    pub fn transport(&self) -> &T {
        &self.transport
    }
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
    /// Serve a single exchange, from header to the end of the payload or response.
    pub async fn serve_exchange(&mut self) -> TransportResult<()> {
        let mut header = [0u8; CommandHeader::LENGTH];
        let received = self.transport.receive(&mut header).await;
        if received == Err(TransportError::Closed) {
            return Err(TransportError::Closed);
        }
        let header = matches!(received, Ok(CommandHeader::LENGTH)).then_some(header);
        let mut step = self.dispatcher.header_received(header);
        loop {
            step = match step {
                Step::ReceiveHeader => return Ok(()),
                Step::ReceivePayload(_) => {
                    let received = self
                        .transport
                        .receive(self.dispatcher.payload_buffer())
                        .await;
                    self.dispatcher.payload_received(received.ok())
                }
                Step::Transmit(_) => {
                    let sent = self.transport.transmit(self.dispatcher.response()).await;
                    self.dispatcher.response_transmitted(sent.is_ok())
                }
            };
        }
    }
    /// Serve the host forever.
    pub async fn run(&mut self) -> ! {
        trace!("Host interface running.");
        loop {
            if let Err(err) = self.serve_exchange().await {
                error!("Host transport failed: {:?}", err);
            }
        }
    }
}
