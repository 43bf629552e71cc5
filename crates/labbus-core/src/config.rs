/*!
 * Configuration management for LabBus.
 *
 * This module provides functionality to load, validate, and access the
 * construction-time configuration of controllers and instruments: bridge
 * host and port, bus addresses, timeouts and acquisition periods.
 */
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Root configuration for LabBus
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Defaults shared by every controller and instrument
    #[serde(default)]
    pub bus: BusConfig,

    /// Network bridge controllers
    #[serde(default)]
    pub controllers: Vec<ControllerConfig>,

    /// Instruments attached to the controllers
    #[serde(default)]
    pub instruments: Vec<InstrumentConfig>,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Application environment (development, production, etc.)
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Include the event target in each line
    #[serde(default = "default_true")]
    pub with_target: bool,

    /// Include the thread name in each line
    #[serde(default)]
    pub with_thread_names: bool,
}

/// Defaults shared by every controller and instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Timeout for synchronous device calls in milliseconds
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Delay applied by polling loops after a failed cycle, in milliseconds
    #[serde(default = "default_error_penalty_ms")]
    pub error_penalty_ms: u64,

    /// Period of the interrupt collector in seconds
    #[serde(default = "default_interrupt_period")]
    pub interrupt_period: f64,
}

/// Configuration of one network bridge controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Unique controller name, referenced by instruments
    pub name: String,

    /// Bridge host name or IP address
    pub host: String,

    /// Bridge TCP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Timeout for a single channel read in milliseconds
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Connection attempts before the controller gives up
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Delay between connection attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Default response terminator ("cr", "lf", "crlf" or "lfcr")
    #[serde(default = "default_terminator")]
    pub terminator: String,
}

/// Configuration of one instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Unique instrument name
    pub name: String,

    /// Name of the controller the instrument is attached to
    pub controller: String,

    /// Primary bus address (0-30)
    pub primary: u8,

    /// Secondary bus address (0 for none, or 0x60-0x7E)
    #[serde(default)]
    pub secondary: u8,

    /// Status acquisition period in seconds; omitted uses the driver default
    #[serde(default)]
    pub status_period: Option<f64>,

    /// Settings acquisition period in seconds; omitted uses the driver default
    #[serde(default)]
    pub settings_period: Option<f64>,

    /// Reading acquisition period in seconds; omitted uses the driver default
    #[serde(default)]
    pub reading_period: Option<f64>,

    /// Interrupt collector period in seconds; omitted uses `bus.interrupt_period`
    #[serde(default)]
    pub interrupt_period: Option<f64>,

    /// Whether the interrupt collector and dispatcher run
    #[serde(default = "default_true")]
    pub interrupts: bool,

    /// Whether the channel-access permit may be replaced once installed
    #[serde(default)]
    pub replaceable_permit: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            environment: default_environment(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: true,
            with_thread_names: false,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: default_command_timeout_ms(),
            error_penalty_ms: default_error_penalty_ms(),
            interrupt_period: default_interrupt_period(),
        }
    }
}

impl BusConfig {
    /// Synchronous call timeout
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Penalty delay after a failed polling cycle
    pub fn error_penalty(&self) -> Duration {
        Duration::from_millis(self.error_penalty_ms)
    }
}

impl ControllerConfig {
    /// Create a controller configuration with default timeouts
    pub fn new<N: Into<String>, H: Into<String>>(name: N, host: H, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            connect_attempts: default_connect_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            terminator: default_terminator(),
        }
    }

    /// Connection timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Single read timeout
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Delay between connection attempts
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Bridge socket address as `host:port`
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl InstrumentConfig {
    /// Create an instrument configuration using driver default periods
    pub fn new<N: Into<String>, C: Into<String>>(name: N, controller: C, primary: u8) -> Self {
        Self {
            name: name.into(),
            controller: controller.into(),
            primary,
            secondary: 0,
            status_period: None,
            settings_period: None,
            reading_period: None,
            interrupt_period: None,
            interrupts: true,
            replaceable_permit: false,
        }
    }
}

/// Convert a period given in seconds into a [`Duration`]
///
/// The whole value is converted at once, so fractional periods such as
/// `0.1` keep their sub-millisecond precision.
pub fn period_from_secs(seconds: f64) -> Result<Duration> {
    if seconds <= 0.0 {
        return Err(Error::invalid_argument(format!(
            "Period must be positive, got {} s",
            seconds
        )));
    }
    Duration::try_from_secs_f64(seconds)
        .map_err(|e| Error::invalid_argument(format!("Invalid period {} s: {}", seconds, e)))
}

fn default_app_name() -> String {
    "labbus".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_command_timeout_ms() -> u64 {
    1000
}

fn default_error_penalty_ms() -> u64 {
    500
}

fn default_interrupt_period() -> f64 {
    0.1
}

fn default_port() -> u16 {
    1234
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_read_timeout_ms() -> u64 {
    1000
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_terminator() -> String {
    "lf".to_string()
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<Config>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: Config) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        if let Some(config) = self.override_with {
            config.validate()?;
            return Ok(config);
        }

        let mut config_builder = ConfigLib::builder();

        // Start with default values
        let default_config = Config::default();
        config_builder = config_builder.add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        config.validate()?;
        info!(
            controllers = config.controllers.len(),
            instruments = config.instruments.len(),
            "Configuration loaded successfully"
        );
        Ok(config)
    }
}

impl Config {
    /// Check cross-references and value ranges
    pub fn validate(&self) -> Result<()> {
        let mut names = std::collections::HashSet::new();
        for controller in &self.controllers {
            if !names.insert(controller.name.as_str()) {
                return Err(Error::config(format!(
                    "Duplicate controller name: {}",
                    controller.name
                )));
            }
            if controller.connect_attempts == 0 {
                return Err(Error::config(format!(
                    "Controller {} needs at least one connect attempt",
                    controller.name
                )));
            }
        }

        let mut instrument_names = std::collections::HashSet::new();
        for instrument in &self.instruments {
            if !instrument_names.insert(instrument.name.as_str()) {
                return Err(Error::config(format!(
                    "Duplicate instrument name: {}",
                    instrument.name
                )));
            }
            if !names.contains(instrument.controller.as_str()) {
                return Err(Error::config(format!(
                    "Instrument {} references unknown controller {}",
                    instrument.name, instrument.controller
                )));
            }
            for period in [
                instrument.status_period,
                instrument.settings_period,
                instrument.reading_period,
                instrument.interrupt_period,
            ]
            .into_iter()
            .flatten()
            {
                period_from_secs(period)
                    .map_err(|e| Error::config(format!("Instrument {}: {}", instrument.name, e)))?;
            }
        }

        period_from_secs(self.bus.interrupt_period)
            .map_err(|e| Error::config(format!("bus.interrupt_period: {}", e)))?;
        Ok(())
    }

    /// Look up a controller section by name
    pub fn controller(&self, name: &str) -> Option<&ControllerConfig> {
        self.controllers.iter().find(|c| c.name == name)
    }

    /// Render the configuration as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::config(format!("Failed to serialize configuration: {}", e)))
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}
