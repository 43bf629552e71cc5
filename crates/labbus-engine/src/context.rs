/*!
 * Context handed to instrument drivers.
 *
 * The context gives a driver synchronous access to its device, atomic
 * sequences and the instrument's channel-access permit, and lets it notice
 * that the instrument is shutting down.
 */
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use labbus_devices::command::{ChannelOp, CommandResult};
use labbus_devices::device::Device;

use crate::error::{Error, Result};
use crate::permit::{ChannelPermit, PermitSlot};

/// Shared handles of one instrument, as seen by its driver
#[derive(Debug, Clone)]
pub struct InstrumentContext {
    name: Arc<str>,
    device: Device,
    permit: Arc<PermitSlot>,
    cancel: CancellationToken,
}

impl InstrumentContext {
    pub(crate) fn new(
        name: Arc<str>,
        device: Device,
        permit: Arc<PermitSlot>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name,
            device,
            permit,
            cancel,
        }
    }

    /// Instrument name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The instrument's device
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Currently installed channel-access permit
    pub fn permit(&self) -> Option<ChannelPermit> {
        self.permit.current()
    }

    /// Whether the instrument is shutting down
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Write `message` and return the response line
    pub async fn query<B: Into<Bytes>>(&self, message: B) -> Result<String> {
        Ok(self.device.write_and_readline(message).await?)
    }

    /// Write `message`
    pub async fn send<B: Into<Bytes>>(&self, message: B) -> Result<()> {
        Ok(self.device.write(message).await?)
    }

    /// Run `ops` as one command, so no other command reaches the bus between them
    pub async fn atomic_sequence(&self, ops: Vec<ChannelOp>, timeout: Duration) -> Result<Vec<CommandResult>> {
        Ok(self.device.execute_sequence(ops, timeout).await?)
    }

    /// Like [`atomic_sequence`](Self::atomic_sequence), holding the permit throughout
    ///
    /// While the permit is held the interrupt collector skips its cycles, so
    /// no serial poll is queued for the duration. Without an installed permit
    /// this is a plain atomic sequence.
    pub async fn atomic_sequence_exclusive(
        &self,
        ops: Vec<ChannelOp>,
        timeout: Duration,
    ) -> Result<Vec<CommandResult>> {
        let _guard = match self.permit() {
            Some(permit) => {
                let guard = tokio::select! {
                    _ = self.cancel.cancelled() => {
                        return Err(Error::interrupted(format!("{} is stopping", self.name)));
                    }
                    guard = permit.acquire() => guard?,
                };
                trace!(instrument = %self.name, "Channel permit acquired");
                Some(guard)
            }
            None => None,
        };
        self.atomic_sequence(ops, timeout).await
    }
}
