/*!
 * LabBus Core
 *
 * This crate provides the shared foundation of the LabBus system:
 * error types, configuration, logging, the service lifecycle and
 * listener registries used by controllers, devices and instruments.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod prelude;
pub mod service;
pub mod types;
pub mod utils;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use anyhow;
    pub use chrono;
    pub use futures;
    pub use tokio;
    pub use tokio_util;
    pub use tracing;
    pub use uuid;
}

/// LabBus core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("LabBus Core {} initialized", VERSION);
    Ok(())
}
