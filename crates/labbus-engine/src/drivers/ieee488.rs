/*!
 * Generic IEEE 488.2 driver.
 *
 * Works with any instrument implementing the common commands: status comes
 * from `*STB?` and `*ESR?`, settings from the `*IDN?` identity, and an
 * optional model-specific query supplies readings.
 */
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{info, warn};

use labbus_devices::command::{ChannelOp, StatusByte};

use crate::context::InstrumentContext;
use crate::driver::{InstrumentDriver, Periods, DEFAULT_INTERRUPT_PERIOD};
use crate::error::{Error, Result};
use crate::instrument::Instrument;

const STB_QUERY: &str = "*STB?\n";
const ESR_QUERY: &str = "*ESR?\n";
const IDN_QUERY: &str = "*IDN?\n";

/// Commands understood by [`Ieee488Driver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ieee488Command {
    /// `*CLS`: clear status registers
    Clear,
    /// `*RST`: reset to power-on settings
    Reset,
    /// Any other message, sent verbatim
    Send(String),
}

impl Ieee488Command {
    fn message(&self) -> String {
        match self {
            Ieee488Command::Clear => "*CLS\n".to_string(),
            Ieee488Command::Reset => "*RST\n".to_string(),
            Ieee488Command::Send(message) => message.clone(),
        }
    }
}

/// Status byte together with the standard event status register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ieee488Status {
    /// `*STB?`
    pub status_byte: StatusByte,
    /// `*ESR?`
    pub event_status: u8,
}

impl Ieee488Status {
    /// ESR bit 0
    pub fn operation_complete(&self) -> bool {
        self.event_status & 0x01 != 0
    }

    /// ESR bit 2
    pub fn query_error(&self) -> bool {
        self.event_status & 0x04 != 0
    }

    /// ESR bit 3
    pub fn device_error(&self) -> bool {
        self.event_status & 0x08 != 0
    }

    /// ESR bit 4
    pub fn execution_error(&self) -> bool {
        self.event_status & 0x10 != 0
    }

    /// ESR bit 5
    pub fn command_error(&self) -> bool {
        self.event_status & 0x20 != 0
    }

    /// ESR bit 7
    pub fn power_on(&self) -> bool {
        self.event_status & 0x80 != 0
    }

    /// Whether any error bit is set
    pub fn has_errors(&self) -> bool {
        self.event_status & 0x3C != 0
    }
}

/// Parsed `*IDN?` response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Manufacturer
    pub manufacturer: String,
    /// Model
    pub model: String,
    /// Serial number
    pub serial: String,
    /// Firmware revision
    pub firmware: String,
}

impl FromStr for Identity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.trim().splitn(4, ',').map(str::trim).collect();
        match fields.as_slice() {
            [manufacturer, model, serial, firmware] => Ok(Identity {
                manufacturer: manufacturer.to_string(),
                model: model.to_string(),
                serial: serial.to_string(),
                firmware: firmware.to_string(),
            }),
            _ => Err(Error::decode(format!("Malformed identity: {:?}", s))),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({}, fw {})", self.manufacturer, self.model, self.serial, self.firmware)
    }
}

fn parse_register(name: &str, line: &str) -> Result<u8> {
    line.trim()
        .parse::<u8>()
        .map_err(|e| Error::decode(format!("Bad {} response {:?}: {}", name, line, e)))
}

/// Driver for instruments that speak IEEE 488.2 common commands
#[derive(Debug, Clone, Default)]
pub struct Ieee488Driver {
    reading_query: Option<String>,
}

impl Ieee488Driver {
    /// Driver without a reading query
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `query` (sent verbatim) to acquire readings
    pub fn with_reading_query<S: Into<String>>(mut self, query: S) -> Self {
        self.reading_query = Some(query.into());
        self
    }
}

#[async_trait]
impl InstrumentDriver for Ieee488Driver {
    type Command = Ieee488Command;
    type Status = Ieee488Status;
    type Settings = Identity;
    type Reading = String;

    fn model(&self) -> &str {
        "IEEE 488.2"
    }

    fn default_periods(&self) -> Periods {
        Periods {
            status: Some(Duration::from_secs(1)),
            settings: Some(Duration::from_secs(10)),
            reading: self.reading_query.as_ref().map(|_| Duration::from_secs(1)),
            interrupt: Some(DEFAULT_INTERRUPT_PERIOD),
        }
    }

    async fn process_command(&self, ctx: &InstrumentContext, command: Ieee488Command) -> Result<()> {
        ctx.send(command.message()).await
    }

    async fn on_interrupt(&self, ctx: &InstrumentContext, status: StatusByte) -> Result<()> {
        let event_status = parse_register("*ESR?", &ctx.query(ESR_QUERY).await?)?;
        let status = Ieee488Status {
            status_byte: status,
            event_status,
        };
        if status.has_errors() {
            warn!(instrument = ctx.name(), stb = %status.status_byte, esr = event_status, "Instrument reported an error");
        } else {
            info!(instrument = ctx.name(), stb = %status.status_byte, esr = event_status, "Service request");
        }
        Ok(())
    }

    async fn read_status(&self, ctx: &InstrumentContext) -> Result<Ieee488Status> {
        let terminator = ctx.device().terminator();
        let ops = vec![
            ChannelOp::WriteReadLine {
                data: Bytes::from_static(STB_QUERY.as_bytes()),
                terminator,
            },
            ChannelOp::WriteReadLine {
                data: Bytes::from_static(ESR_QUERY.as_bytes()),
                terminator,
            },
        ];
        let mut results = ctx
            .atomic_sequence(ops, ctx.device().timeout() * 2)
            .await?
            .into_iter();
        let mut next_line = |name: &str| -> Result<u8> {
            let result = results
                .next()
                .ok_or_else(|| Error::decode(format!("Missing {} response", name)))?;
            parse_register(name, &result.into_line()?)
        };
        let status_byte = StatusByte(next_line("*STB?")?);
        let event_status = next_line("*ESR?")?;
        Ok(Ieee488Status {
            status_byte,
            event_status,
        })
    }

    async fn read_settings(&self, ctx: &InstrumentContext) -> Result<Identity> {
        ctx.query(IDN_QUERY).await?.parse()
    }

    async fn read_reading(&self, ctx: &InstrumentContext) -> Result<String> {
        match &self.reading_query {
            Some(query) => Ok(ctx.query(query.clone()).await?.trim().to_string()),
            None => Err(Error::unsupported("No reading query configured")),
        }
    }
}

impl Instrument<Ieee488Driver> {
    /// Queue `*CLS`
    pub fn clear(&self) -> Result<()> {
        self.add_command(Ieee488Command::Clear)
    }

    /// Queue `*RST`
    pub fn reset(&self) -> Result<()> {
        self.add_command(Ieee488Command::Reset)
    }

    /// Queue a verbatim message
    pub fn send<S: Into<String>>(&self, message: S) -> Result<()> {
        self.add_command(Ieee488Command::Send(message.into()))
    }

    /// Last acquired identity
    pub fn identity(&self) -> Option<Identity> {
        self.settings().map(|sample| sample.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use labbus_core::service::ServiceState;
    use labbus_devices::address::BusAddress;
    use labbus_devices::controller::Controller;
    use labbus_devices::device::Device;
    use labbus_devices::mock::MockBus;

    use crate::instrument::InstrumentOptions;

    fn instrument(bus: &MockBus, driver: Ieee488Driver, periods: Periods) -> Instrument<Ieee488Driver> {
        let device = Device::new(
            Controller::new("bench", bus.connector()),
            BusAddress::primary_only(9).unwrap(),
        )
        .with_timeout(Duration::from_millis(500));
        Instrument::with_options("dmm", driver, device, InstrumentOptions::new(periods))
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..400 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        condition()
    }

    #[test]
    fn test_identity_parse() {
        let identity: Identity = "ACME Instruments, DMM-7, SN42, 1.2.3\n".parse().unwrap();
        assert_eq!(identity.manufacturer, "ACME Instruments");
        assert_eq!(identity.model, "DMM-7");
        assert_eq!(identity.serial, "SN42");
        assert_eq!(identity.firmware, "1.2.3");

        assert!("ACME,DMM-7".parse::<Identity>().is_err());
    }

    #[test]
    fn test_event_status_bits() {
        let status = Ieee488Status {
            status_byte: StatusByte(0x60),
            event_status: 0x21,
        };
        assert!(status.operation_complete());
        assert!(status.command_error());
        assert!(!status.power_on());
        assert!(status.has_errors());
    }

    #[test]
    fn test_default_periods() {
        assert_eq!(Ieee488Driver::new().default_periods().reading, None);
        let periods = Ieee488Driver::new().with_reading_query("READ?\n").default_periods();
        assert_eq!(periods.reading, Some(Duration::from_secs(1)));
        assert_eq!(periods.interrupt, Some(DEFAULT_INTERRUPT_PERIOD));
    }

    #[tokio::test]
    async fn test_status_settings_and_readings() {
        let bus = MockBus::new();
        bus.respond(9, STB_QUERY, "96\n")
            .respond(9, ESR_QUERY, "32\n")
            .respond(9, IDN_QUERY, "ACME,DMM-7,SN42,1.2\n")
            .respond(9, "READ?\n", " +1.25E-3\n");
        let periods = Periods {
            status: Some(Duration::from_millis(20)),
            settings: Some(Duration::from_millis(50)),
            reading: Some(Duration::from_millis(20)),
            interrupt: None,
        };
        let instrument = instrument(&bus, Ieee488Driver::new().with_reading_query("READ?\n"), periods);
        instrument.start().await.unwrap();

        assert!(wait_until(|| instrument.status().is_some() && instrument.identity().is_some()).await);
        let status = instrument.status().unwrap().value;
        assert_eq!(status.status_byte, StatusByte(96));
        assert!(status.command_error());
        assert_eq!(instrument.identity().unwrap().model, "DMM-7");

        assert!(wait_until(|| instrument.reading().is_some()).await);
        assert_eq!(instrument.reading().unwrap().value, "+1.25E-3");
        instrument.stop().await;
    }

    #[tokio::test]
    async fn test_typed_commands() {
        let bus = MockBus::new();
        let periods = Periods {
            status: None,
            settings: None,
            reading: None,
            interrupt: None,
        };
        let instrument = instrument(&bus, Ieee488Driver::new(), periods);
        instrument.reset().unwrap();
        instrument.clear().unwrap();
        instrument.send("VOLT 1.5\n").unwrap();
        instrument.start().await.unwrap();

        assert!(wait_until(|| bus.writes_to(9).len() == 3).await);
        assert_eq!(
            bus.writes_to(9),
            vec![b"*RST\n".to_vec(), b"*CLS\n".to_vec(), b"VOLT 1.5\n".to_vec()]
        );
        instrument.stop().await;
    }

    #[tokio::test]
    async fn test_interrupt_reads_event_status() {
        let bus = MockBus::new();
        bus.queue_polls(9, [0x60]).set_poll(9, 0x00).respond(9, ESR_QUERY, "32\n");
        let periods = Periods {
            status: None,
            settings: None,
            reading: None,
            interrupt: Some(Duration::from_millis(10)),
        };
        let instrument = instrument(&bus, Ieee488Driver::new(), periods);
        instrument.start().await.unwrap();

        assert!(wait_until(|| bus.writes_to(9) == vec![ESR_QUERY.as_bytes().to_vec()]).await);
        assert_eq!(instrument.state(), ServiceState::Active);
        instrument.stop().await;
    }

    #[tokio::test]
    async fn test_reading_without_query_is_unsupported() {
        let bus = MockBus::new();
        let ctx = instrument(&bus, Ieee488Driver::new(), Periods::default()).context();
        let err = Ieee488Driver::new().read_reading(&ctx).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
