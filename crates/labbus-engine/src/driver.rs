/*!
 * Instrument driver interface.
 *
 * The engine knows nothing about a particular instrument model. A driver
 * supplies the model-specific pieces (how to process a caller command, how to
 * read status, settings and readings, how to react to a service request) and
 * the engine runs them on its queues and loops.
 */
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;

use labbus_devices::command::StatusByte;

use crate::context::InstrumentContext;
use crate::error::{Error, Result};

/// Default period of the interrupt collector
pub const DEFAULT_INTERRUPT_PERIOD: Duration = Duration::from_millis(100);

/// Periods of the background loops; `None` disables a loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Periods {
    /// Status acquisition
    pub status: Option<Duration>,
    /// Settings acquisition
    pub settings: Option<Duration>,
    /// Reading acquisition
    pub reading: Option<Duration>,
    /// Interrupt collection
    pub interrupt: Option<Duration>,
}

impl Default for Periods {
    fn default() -> Self {
        Self {
            status: None,
            settings: None,
            reading: None,
            interrupt: Some(DEFAULT_INTERRUPT_PERIOD),
        }
    }
}

/// Model-specific behaviour plugged into an [`Instrument`](crate::instrument::Instrument)
#[async_trait]
pub trait InstrumentDriver: Send + Sync + 'static {
    /// Commands accepted by `add_command`
    type Command: Debug + Send + 'static;
    /// Decoded status
    type Status: Debug + Clone + Send + Sync + 'static;
    /// Decoded settings
    type Settings: Debug + Clone + Send + Sync + 'static;
    /// Decoded measurement
    type Reading: Debug + Clone + Send + Sync + 'static;

    /// Model name, for logs
    fn model(&self) -> &str;

    /// Loop periods used unless configuration overrides them
    fn default_periods(&self) -> Periods {
        Periods::default()
    }

    /// Carry out one caller command
    async fn process_command(&self, ctx: &InstrumentContext, command: Self::Command) -> Result<()>;

    /// React to a service request
    async fn on_interrupt(&self, _ctx: &InstrumentContext, _status: StatusByte) -> Result<()> {
        Ok(())
    }

    /// Acquire the current status
    async fn read_status(&self, _ctx: &InstrumentContext) -> Result<Self::Status> {
        Err(Error::unsupported(format!("{} has no status query", self.model())))
    }

    /// Acquire the current settings
    async fn read_settings(&self, _ctx: &InstrumentContext) -> Result<Self::Settings> {
        Err(Error::unsupported(format!("{} has no settings query", self.model())))
    }

    /// Acquire one reading
    async fn read_reading(&self, _ctx: &InstrumentContext) -> Result<Self::Reading> {
        Err(Error::unsupported(format!("{} has no reading query", self.model())))
    }
}
