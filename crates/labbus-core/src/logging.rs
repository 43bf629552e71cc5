/*!
 * Logging functionality for LabBus.
 *
 * This module provides tracing setup and span helpers so that controller
 * workers and instrument tasks log with consistent fields.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_filter("info")
}

/// Initialize the logging system with a specific filter
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "debug", "labbus_devices=trace")
pub fn init_with_filter(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .map_err(|e| Error::logging(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// Initialize the logging system from the `[logging]` configuration section
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let layer = fmt::layer()
        .with_target(config.with_target)
        .with_thread_names(config.with_thread_names);

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
        .map_err(|e| Error::logging(format!("Failed to initialize logging: {}", e)))
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a new span for a component (controller, device, instrument)
///
/// # Arguments
///
/// * `name` - The kind of component
/// * `id` - An optional instance name
pub fn component_span(name: &str, id: Option<&str>) -> Span {
    match id {
        Some(id) => tracing::info_span!("component", name = %name, id = %id),
        None => tracing::info_span!("component", name = %name),
    }
}

/// Create a new span for a background task of a component
///
/// # Arguments
///
/// * `name` - The task name (e.g. "worker", "interrupt-collector")
/// * `component` - The owning component instance
pub fn task_span(name: &str, component: &str) -> Span {
    tracing::info_span!("task", name = %name, component = %component)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init() {
        // A second initialization in the same process is allowed to fail
        let _ = init();
        assert!(init_with_filter("debug").is_err());
    }

    #[test]
    fn test_component_span() {
        let span = component_span("controller", Some("bridge0"));
        let _guard = span.enter();

        let span = component_span("controller", None);
        let _guard = span.enter();
    }

    #[test]
    fn test_task_span() {
        let span = task_span("worker", "bridge0");
        let _guard = span.enter();
    }
}
