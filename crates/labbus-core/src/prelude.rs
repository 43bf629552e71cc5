/*!
 * Prelude module for LabBus Core.
 *
 * This module re-exports commonly used types and functions from the LabBus Core crate
 * to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{Id, Sample};

// Re-export lifecycle and listener types
pub use crate::event::{Listener, ListenerId, ListenerSet};
pub use crate::service::{ServiceCell, ServiceState};

// Re-export config types
pub use crate::config::{
    BusConfig, Config, ConfigBuilder, ControllerConfig, InstrumentConfig, SharedConfig,
};

// Re-export utility functions
pub use crate::utils::{remaining_period, sleep_or_cancel, sleep_remaining};

pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
