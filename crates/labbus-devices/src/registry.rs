/*!
 * Bus registry for LabBus.
 *
 * This module provides an explicit registry of the controllers and devices
 * of one application. It is built once, usually from configuration, and
 * passed to whoever needs to look up a controller by name or a device by url.
 */
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::broadcast;
use tracing::{debug, error, info};

use labbus_core::config::Config;

use crate::controller::Controller;
use crate::device::Device;
use crate::error::{BusError, Result};

/// Event types for the bus registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A controller was added
    ControllerAdded(String),
    /// A device was added
    DeviceAdded {
        /// Device url
        url: String,
        /// Controller name
        controller: String,
    },
    /// A device was removed
    DeviceRemoved(String),
}

/// Controllers by name and devices by url
#[derive(Debug)]
pub struct BusRegistry {
    /// The registered controllers
    controllers: RwLock<HashMap<String, Controller>>,
    /// The registered devices
    devices: RwLock<HashMap<String, Device>>,
    /// Instrument names from configuration, mapped to device urls
    names: RwLock<HashMap<String, String>>,
    /// Event sender for registry events
    event_sender: broadcast::Sender<RegistryEvent>,
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| BusError::io("Failed to acquire read lock on bus registry"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| BusError::io("Failed to acquire write lock on bus registry"))
}

impl BusRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            controllers: RwLock::new(HashMap::new()),
            devices: RwLock::new(HashMap::new()),
            names: RwLock::new(HashMap::new()),
            event_sender,
        }
    }

    /// Build network controllers and devices from configuration
    ///
    /// Nothing is started; call [`BusRegistry::start_all`] when ready.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let registry = Self::new();

        for controller_config in &config.controllers {
            registry.register_controller(Controller::network(controller_config))?;
        }

        for instrument in &config.instruments {
            let controller_config = config.controller(&instrument.controller).ok_or_else(|| {
                BusError::invalid_argument(format!(
                    "Instrument {} references unknown controller {}",
                    instrument.name, instrument.controller
                ))
            })?;
            let controller = registry.controller(&instrument.controller)?;
            let device = Device::from_config(controller, controller_config, instrument, &config.bus)?;
            let url = device.url().to_string();
            registry.register_device(device)?;
            write(&registry.names)?.insert(instrument.name.clone(), url);
        }

        info!(
            controllers = config.controllers.len(),
            devices = config.instruments.len(),
            "Bus registry built from configuration"
        );
        Ok(registry)
    }

    /// Register a controller under its name
    pub fn register_controller(&self, controller: Controller) -> Result<()> {
        let name = controller.name().to_string();
        let mut controllers = write(&self.controllers)?;
        if controllers.contains_key(&name) {
            return Err(BusError::invalid_argument(format!(
                "Controller {} already registered",
                name
            )));
        }
        controllers.insert(name.clone(), controller);
        let _ = self.event_sender.send(RegistryEvent::ControllerAdded(name.clone()));
        debug!("Registered controller {}", name);
        Ok(())
    }

    /// Register a device under its url
    pub fn register_device(&self, device: Device) -> Result<()> {
        let url = device.url().to_string();
        let controller = device.controller().name().to_string();
        let mut devices = write(&self.devices)?;
        if devices.contains_key(&url) {
            return Err(BusError::invalid_argument(format!(
                "Device {} already registered",
                url
            )));
        }
        devices.insert(url.clone(), device);
        let _ = self.event_sender.send(RegistryEvent::DeviceAdded {
            url: url.clone(),
            controller,
        });
        debug!("Registered device {}", url);
        Ok(())
    }

    /// Unregister a device
    pub fn unregister_device(&self, url: &str) -> Result<Device> {
        let device = write(&self.devices)?
            .remove(url)
            .ok_or_else(|| BusError::invalid_argument(format!("Device {} not registered", url)))?;
        write(&self.names)?.retain(|_, mapped| mapped != url);
        let _ = self.event_sender.send(RegistryEvent::DeviceRemoved(url.to_string()));
        debug!("Unregistered device {}", url);
        Ok(device)
    }

    /// Get a controller by name
    pub fn controller(&self, name: &str) -> Result<Controller> {
        read(&self.controllers)?
            .get(name)
            .cloned()
            .ok_or_else(|| BusError::invalid_argument(format!("Controller {} not found", name)))
    }

    /// Get a device by url
    pub fn device(&self, url: &str) -> Result<Device> {
        read(&self.devices)?
            .get(url)
            .cloned()
            .ok_or_else(|| BusError::invalid_argument(format!("Device {} not found", url)))
    }

    /// Get a device by its configured instrument name
    pub fn device_named(&self, name: &str) -> Result<Device> {
        let url = read(&self.names)?
            .get(name)
            .cloned()
            .ok_or_else(|| BusError::invalid_argument(format!("Instrument {} not found", name)))?;
        self.device(&url)
    }

    /// Devices attached to the named controller
    pub fn devices_on(&self, controller: &str) -> Result<Vec<Device>> {
        Ok(read(&self.devices)?
            .values()
            .filter(|device| device.controller().name() == controller)
            .cloned()
            .collect())
    }

    /// Names of all controllers, sorted
    pub fn controller_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = read(&self.controllers)?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Urls of all devices, sorted
    pub fn device_urls(&self) -> Result<Vec<String>> {
        let mut urls: Vec<String> = read(&self.devices)?.keys().cloned().collect();
        urls.sort();
        Ok(urls)
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    fn all_controllers(&self) -> Result<Vec<Controller>> {
        Ok(read(&self.controllers)?.values().cloned().collect())
    }

    /// Start every controller
    ///
    /// All controllers are attempted; the first failure is returned.
    pub async fn start_all(&self) -> Result<()> {
        let mut first_error = None;
        for controller in self.all_controllers()? {
            debug!("Starting controller {}", controller.name());
            if let Err(e) = controller.start().await {
                error!("Failed to start controller {}: {}", controller.name(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop every controller
    pub async fn stop_all(&self) -> Result<()> {
        for controller in self.all_controllers()? {
            controller.stop().await;
        }
        info!("All controllers stopped");
        Ok(())
    }
}

impl Default for BusRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labbus_core::config::{ControllerConfig, InstrumentConfig};
    use labbus_core::service::ServiceState;

    use crate::address::BusAddress;
    use crate::mock::MockBus;

    fn sample_config() -> Config {
        let mut config = Config::default();
        config.controllers.push(ControllerConfig::new("bench", "127.0.0.1", 1234));
        config.instruments.push(InstrumentConfig::new("dmm", "bench", 22));
        config.instruments.push(InstrumentConfig::new("psu", "bench", 5));
        config
    }

    #[test]
    fn test_from_config() {
        let registry = BusRegistry::from_config(&sample_config()).unwrap();
        assert_eq!(registry.controller_names().unwrap(), vec!["bench"]);
        assert_eq!(
            registry.device_urls().unwrap(),
            vec!["gpib://bench/22", "gpib://bench/5"]
        );
        assert_eq!(registry.device_named("psu").unwrap().url(), "gpib://bench/5");
        assert_eq!(registry.devices_on("bench").unwrap().len(), 2);
        assert!(registry.device_named("scope").is_err());
    }

    #[test]
    fn test_duplicates_and_events() {
        let registry = BusRegistry::new();
        let mut events = registry.subscribe();
        let bus = MockBus::new();
        let controller = Controller::new("mock", bus.connector());

        registry.register_controller(controller.clone()).unwrap();
        assert!(registry.register_controller(controller.clone()).is_err());

        let device = Device::new(controller, BusAddress::primary_only(9).unwrap());
        registry.register_device(device.clone()).unwrap();
        assert!(registry.register_device(device).is_err());

        registry.unregister_device("gpib://mock/9").unwrap();
        assert!(registry.device("gpib://mock/9").is_err());

        assert_eq!(events.try_recv().unwrap(), RegistryEvent::ControllerAdded("mock".into()));
        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::DeviceAdded {
                url: "gpib://mock/9".into(),
                controller: "mock".into()
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::DeviceRemoved("gpib://mock/9".into())
        );
    }

    #[tokio::test]
    async fn test_start_and_stop_all() {
        let registry = BusRegistry::new();
        let good = MockBus::new();
        let bad = MockBus::new();
        bad.fail_connect(BusError::io("refused"));
        registry.register_controller(Controller::new("good", good.connector())).unwrap();
        registry.register_controller(Controller::new("bad", bad.connector())).unwrap();

        assert!(registry.start_all().await.is_err());
        assert_eq!(registry.controller("good").unwrap().state(), ServiceState::Active);
        assert_eq!(registry.controller("bad").unwrap().state(), ServiceState::Error);

        registry.stop_all().await.unwrap();
        assert_eq!(registry.controller("good").unwrap().state(), ServiceState::Stopped);
    }
}
