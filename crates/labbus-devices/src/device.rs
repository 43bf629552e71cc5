/*!
 * Device facade.
 *
 * A `Device` is one instrument address on a controller. It builds transport
 * commands and offers two forms of every operation: an asynchronous form that
 * only queues the command and returns its `CommandId`, and a synchronous form
 * that waits, bounded by a timeout, for the command to complete.
 */
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use labbus_core::config::{BusConfig, ControllerConfig, InstrumentConfig};
use labbus_core::event::ListenerId;
use labbus_core::service::ServiceState;
use labbus_core::types::Id;

use crate::address::BusAddress;
use crate::command::{
    ChannelOp, CommandId, CommandKind, CommandResult, StatusByte, Terminator, TransportCommand,
};
use crate::controller::{Completion, Controller};
use crate::error::{BusError, Result};

/// Default response terminator
pub const DEFAULT_TERMINATOR: Terminator = Terminator::Lf;

/// Default limit for synchronous operations
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Removes a completion listener when dropped
struct ListenerGuard<'a> {
    controller: &'a Controller,
    id: ListenerId,
}

impl Drop for ListenerGuard<'_> {
    fn drop(&mut self) {
        self.controller.remove_listener(self.id);
    }
}

/// An instrument address on a controller
#[derive(Clone)]
pub struct Device {
    id: Id,
    controller: Controller,
    address: BusAddress,
    url: String,
    terminator: Terminator,
    timeout: Duration,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("url", &self.url)
            .field("address", &self.address)
            .field("terminator", &self.terminator)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Locator of a device on a named controller
pub fn device_url(controller: &str, address: BusAddress) -> String {
    match address.secondary() {
        Some(secondary) => format!("gpib://{}/{}/{}", controller, address.primary(), secondary),
        None => format!("gpib://{}/{}", controller, address.primary()),
    }
}

impl Device {
    /// Create a device with the default terminator and timeout
    pub fn new(controller: Controller, address: BusAddress) -> Self {
        let url = device_url(controller.name(), address);
        Self {
            id: Id::new(),
            controller,
            address,
            url,
            terminator: DEFAULT_TERMINATOR,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Create a device from an `[[instruments]]` entry
    pub fn from_config(
        controller: Controller,
        controller_config: &ControllerConfig,
        instrument: &InstrumentConfig,
        bus: &BusConfig,
    ) -> Result<Self> {
        let address = BusAddress::new(instrument.primary, instrument.secondary)?;
        let terminator = controller_config.terminator.parse::<Terminator>()?;
        Ok(Self::new(controller, address)
            .with_terminator(terminator)
            .with_timeout(bus.command_timeout()))
    }

    /// Use `terminator` for reads that do not name one
    pub fn with_terminator(mut self, terminator: Terminator) -> Self {
        self.terminator = terminator;
        self
    }

    /// Use `timeout` for synchronous operations
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Identifier of this handle, shared by its clones and tagged on its log records
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Bus address
    pub fn address(&self) -> BusAddress {
        self.address
    }

    /// Locator, e.g. `gpib://bridge0/5`
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Controller the device is attached to
    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    /// Default response terminator
    pub fn terminator(&self) -> Terminator {
        self.terminator
    }

    /// Default limit for synchronous operations
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start the controller unless it was started already
    pub async fn start(&self) -> Result<()> {
        self.controller.start().await
    }

    /// Lifecycle state, which is the controller's
    pub fn state(&self) -> ServiceState {
        self.controller.state()
    }

    /// Watch lifecycle changes
    pub fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
        self.controller.subscribe_state()
    }

    fn command<K: Into<CommandKind>>(&self, kind: K) -> TransportCommand {
        TransportCommand::addressed(self.address, kind)
    }

    /// Queue any command kind for this device
    pub fn submit<K: Into<CommandKind>>(&self, kind: K) -> Result<CommandId> {
        self.controller.submit(self.command(kind))
    }

    /// Queue a read with the default terminator
    pub fn read_async(&self) -> Result<CommandId> {
        self.submit(ChannelOp::Read { terminator: self.terminator })
    }

    /// Queue a line read with the default terminator
    pub fn readline_async(&self) -> Result<CommandId> {
        self.submit(ChannelOp::ReadLine { terminator: self.terminator })
    }

    /// Queue a fixed-length read
    pub fn read_n_async(&self, count: usize) -> Result<CommandId> {
        self.submit(ChannelOp::ReadN { count })
    }

    /// Queue a write
    pub fn write_async<B: Into<Bytes>>(&self, data: B) -> Result<CommandId> {
        self.submit(ChannelOp::Write { data: data.into() })
    }

    /// Queue a query returning bytes
    pub fn write_and_read_async<B: Into<Bytes>>(&self, data: B) -> Result<CommandId> {
        self.submit(ChannelOp::WriteRead {
            data: data.into(),
            terminator: self.terminator,
        })
    }

    /// Queue a query returning a line
    pub fn write_and_readline_async<B: Into<Bytes>>(&self, data: B) -> Result<CommandId> {
        self.submit(ChannelOp::WriteReadLine {
            data: data.into(),
            terminator: self.terminator,
        })
    }

    /// Queue a query returning `count` bytes
    pub fn write_and_read_n_async<B: Into<Bytes>>(&self, data: B, count: usize) -> Result<CommandId> {
        self.submit(ChannelOp::WriteReadN {
            data: data.into(),
            count,
        })
    }

    /// Submit a command and wait for its outcome
    ///
    /// The completion listener is registered before submission and removed on
    /// every exit path. When `timeout` expires the timeout becomes the
    /// command's outcome, so a worker that has not reached it yet skips it.
    /// A command already on the bus when the wait expires still runs to the
    /// end but keeps the timeout as its outcome.
    pub async fn call<K: Into<CommandKind>>(&self, kind: K, timeout: Duration) -> Result<CommandResult> {
        let command = Arc::new(self.command(kind));
        let id = command.id();

        let (tx, mut rx) = mpsc::channel(1);
        let listener = self.controller.add_listener(move |completion: &Completion| {
            if completion.command.id() == id {
                let _ = tx.try_send(completion.command.clone());
            }
        });
        let _guard = ListenerGuard {
            controller: &self.controller,
            id: listener,
        };

        self.controller.submit_shared(command.clone())?;

        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(command)) => command.result(),
            Ok(None) => Err(BusError::interrupted(format!("{} lost its completion", id))),
            Err(_) => {
                warn!(device = %self.url, device_id = %self.id, %id, "No completion within {:?}", timeout);
                command.complete(Err(BusError::timed_out_after(&id.to_string(), timeout)));
                command.result()
            }
        }
    }

    async fn call_default<K: Into<CommandKind>>(&self, kind: K) -> Result<CommandResult> {
        self.call(kind, self.timeout).await
    }

    /// Read until the default terminator
    pub async fn read(&self) -> Result<Vec<u8>> {
        self.call_default(ChannelOp::Read { terminator: self.terminator })
            .await?
            .into_bytes()
    }

    /// Read one line of text
    pub async fn readline(&self) -> Result<String> {
        self.call_default(ChannelOp::ReadLine { terminator: self.terminator })
            .await?
            .into_line()
    }

    /// Read exactly `count` bytes
    pub async fn read_n(&self, count: usize) -> Result<Vec<u8>> {
        self.call_default(ChannelOp::ReadN { count }).await?.into_bytes()
    }

    /// Write a payload verbatim
    pub async fn write<B: Into<Bytes>>(&self, data: B) -> Result<()> {
        self.call_default(ChannelOp::Write { data: data.into() })
            .await
            .map(|_| ())
    }

    /// Write a query and read the response bytes
    pub async fn write_and_read<B: Into<Bytes>>(&self, data: B) -> Result<Vec<u8>> {
        self.call_default(ChannelOp::WriteRead {
            data: data.into(),
            terminator: self.terminator,
        })
        .await?
        .into_bytes()
    }

    /// Write a query and read one line of text
    pub async fn write_and_readline<B: Into<Bytes>>(&self, data: B) -> Result<String> {
        self.call_default(ChannelOp::WriteReadLine {
            data: data.into(),
            terminator: self.terminator,
        })
        .await?
        .into_line()
    }

    /// Write a query and read exactly `count` bytes
    pub async fn write_and_read_n<B: Into<Bytes>>(&self, data: B, count: usize) -> Result<Vec<u8>> {
        self.call_default(ChannelOp::WriteReadN {
            data: data.into(),
            count,
        })
        .await?
        .into_bytes()
    }

    /// Serial-poll the device
    pub async fn serial_poll(&self) -> Result<StatusByte> {
        self.call_default(ChannelOp::SerialPoll)
            .await?
            .into_status_byte()
    }

    /// Run `ops` back-to-back with no other command on the bus in between
    pub async fn execute_sequence(&self, ops: Vec<ChannelOp>, timeout: Duration) -> Result<Vec<CommandResult>> {
        debug!(device = %self.url, device_id = %self.id, ops = ops.len(), "Executing sequence");
        self.call(CommandKind::Sequence(ops), timeout)
            .await?
            .into_sequence()
    }
}
