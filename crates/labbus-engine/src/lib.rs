/*!
 * LabBus Engine
 *
 * This crate orchestrates instruments on top of the LabBus transport:
 * per-instrument command queues, periodic status, settings and reading
 * acquisition, service request collection and dispatch, and the
 * channel-access permit that keeps atomic sequences free of interleaved
 * serial polls.
 */

#![warn(missing_docs)]

// Re-export core types
pub use labbus_core::prelude;

pub mod context;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod instrument;
pub mod permit;

// Re-export main types for convenience
pub use context::InstrumentContext;
pub use driver::{InstrumentDriver, Periods};
pub use drivers::{Identity, Ieee488Command, Ieee488Driver, Ieee488Status};
pub use error::{Error, Result};
pub use instrument::{Instrument, InstrumentOptions, TaskKind, TaskState};
pub use permit::{ChannelPermit, PermitGuard, PermitPolicy};

/// LabBus engine crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the engine
pub fn init() -> Result<()> {
    tracing::info!("LabBus Engine {} initialized", VERSION);
    Ok(())
}
