/*!
 * Bus discovery for LabBus.
 *
 * This module finds the instruments present on a bus by serial-polling a
 * range of primary addresses through a running controller. Addresses that
 * do not answer within the scan timeout are reported as absent.
 */
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::address::{BusAddress, MAX_PRIMARY};
use crate::command::StatusByte;
use crate::controller::Controller;
use crate::device::Device;
use crate::error::{BusError, Result};

/// IEEE 488.2 identification query
pub const IDENTIFY_QUERY: &str = "*IDN?\n";

/// Scan options
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// First primary address to poll
    pub first: u8,
    /// Last primary address to poll, inclusive
    pub last: u8,
    /// Primary addresses to leave alone, such as the bridge's own
    pub skip: Vec<u8>,
    /// Query `*IDN?` on every address that answered
    pub identify: bool,
    /// Limit for each poll and identification query
    ///
    /// Should exceed the channel read timeout, otherwise a slow poll is
    /// reported as absent while it is still occupying the bus.
    pub timeout: Duration,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            first: 1,
            last: MAX_PRIMARY,
            skip: Vec::new(),
            identify: false,
            timeout: Duration::from_secs(2),
        }
    }
}

/// An instrument that answered the scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Its address
    pub address: BusAddress,
    /// Status byte returned by the poll
    pub status: StatusByte,
    /// `*IDN?` response, when identification was requested and answered
    pub identity: Option<String>,
}

/// Serial-poll every address in the configured range
///
/// A timeout marks an address as absent. Any other failure aborts the scan,
/// since it means the bus itself is unusable.
pub async fn scan_bus(controller: &Controller, options: &ScanOptions) -> Result<Vec<DiscoveredDevice>> {
    if options.first > options.last || options.last > MAX_PRIMARY {
        return Err(BusError::invalid_argument(format!(
            "Invalid scan range {}..={}",
            options.first, options.last
        )));
    }

    info!(
        controller = %controller.name(),
        first = options.first,
        last = options.last,
        "Scanning bus"
    );

    let mut found = Vec::new();
    for primary in options.first..=options.last {
        if options.skip.contains(&primary) {
            continue;
        }
        let address = BusAddress::primary_only(primary)?;
        let device = Device::new(controller.clone(), address).with_timeout(options.timeout);

        let status = match device.serial_poll().await {
            Ok(status) => status,
            Err(e) if e.is_timeout() => {
                debug!(%address, "No answer");
                continue;
            }
            Err(e) => return Err(e),
        };

        let identity = if options.identify {
            match device.write_and_readline(IDENTIFY_QUERY).await {
                Ok(identity) => Some(identity.trim().to_string()),
                Err(e) if e.is_timeout() => {
                    warn!(%address, "Device answered the poll but not *IDN?");
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        debug!(%address, %status, ?identity, "Found device");
        found.push(DiscoveredDevice {
            address,
            status,
            identity,
        });
    }

    info!(controller = %controller.name(), found = found.len(), "Scan complete");
    Ok(found)
}
