/*!
 * LabBus Devices
 *
 * This crate provides the bus transport layer of the LabBus system: bus
 * addresses, transport commands, the controller that serializes them onto a
 * channel, the network bridge binding and the device facade.
 */

#![warn(missing_docs)]

// Re-export core types
pub use labbus_core::prelude;

pub mod address;
pub mod channel;
pub mod command;
pub mod controller;
pub mod device;
pub mod discovery;
pub mod error;
pub mod mock;
pub mod protocols;
pub mod registry;

// Re-export the main types
pub use address::BusAddress;
pub use channel::{BusChannel, ChannelConnector};
pub use command::{
    ChannelOp, CommandId, CommandKind, CommandResult, StatusByte, Terminator, TransportCommand,
};
pub use controller::{Completion, Controller};
pub use device::Device;
pub use error::{BusError, ErrorKind, Result};
pub use registry::{BusRegistry, RegistryEvent};

/// LabBus devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device system
pub fn init() -> std::result::Result<(), labbus_core::error::Error> {
    tracing::info!("LabBus Devices {} initialized", VERSION);
    Ok(())
}

/// Names of the available bridge protocols
pub fn available_protocols() -> Vec<&'static str> {
    vec!["prologix"]
}
