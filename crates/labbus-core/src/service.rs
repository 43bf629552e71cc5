/*!
 * Service lifecycle shared by controllers, devices and instruments.
 *
 * Every stateful unit moves through `STOPPED -> ACTIVE -> (ERROR | STOPPED)`.
 * A unit is started at most once; `ERROR` and a stop after activation are both
 * terminal for its background tasks.
 */
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::{Error, Result};

/// Lifecycle state of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceState {
    /// Not running; either never started or stopped gracefully
    Stopped,
    /// Background tasks are running
    Active,
    /// An unrecoverable failure stopped the background tasks
    Error,
}

impl ServiceState {
    /// Get the state as an upper-case string
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Stopped => "STOPPED",
            ServiceState::Active => "ACTIVE",
            ServiceState::Error => "ERROR",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for ServiceState {
    fn default() -> Self {
        ServiceState::Stopped
    }
}

/// Observable state holder used by every service implementation
#[derive(Debug)]
pub struct ServiceCell {
    name: String,
    state: watch::Sender<ServiceState>,
    started: AtomicBool,
}

impl ServiceCell {
    /// Create a new cell in the `STOPPED` state
    pub fn new<S: Into<String>>(name: S) -> Self {
        let (state, _) = watch::channel(ServiceState::Stopped);
        Self {
            name: name.into(),
            state,
            started: AtomicBool::new(false),
        }
    }

    /// Name of the owning service
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state
    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    /// Whether the service is currently active
    pub fn is_active(&self) -> bool {
        self.state() == ServiceState::Active
    }

    /// Whether `begin_start` has ever succeeded
    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    /// Claim the one start this service instance is allowed
    pub fn begin_start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::lifecycle(
                self.state(),
                format!("{} has already been started; create a new instance", self.name),
            ));
        }
        Ok(())
    }

    /// Move `STOPPED -> ACTIVE`
    pub fn activate(&self) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state == ServiceState::Stopped {
                *state = ServiceState::Active;
                true
            } else {
                false
            }
        });
        if changed {
            info!(service = %self.name, "Service is ACTIVE");
        }
        changed
    }

    /// Move `ACTIVE -> STOPPED`; a service in `ERROR` stays there
    pub fn stop(&self) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state == ServiceState::Active {
                *state = ServiceState::Stopped;
                true
            } else {
                false
            }
        });
        if changed {
            info!(service = %self.name, "Service is STOPPED");
        }
        changed
    }

    /// Move to `ERROR`; returns `false` when already there
    pub fn fail<S: AsRef<str>>(&self, reason: S) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state == ServiceState::Error {
                false
            } else {
                *state = ServiceState::Error;
                true
            }
        });
        if changed {
            error!(service = %self.name, reason = %reason.as_ref(), "Service entered ERROR");
        } else {
            debug!(service = %self.name, reason = %reason.as_ref(), "Service already in ERROR");
        }
        changed
    }

    /// Wait until the service reaches `target`
    pub async fn wait_for(&self, target: ServiceState) -> ServiceState {
        let mut rx = self.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if current == target {
                return current;
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_lifecycle_transitions() {
        let cell = ServiceCell::new("controller");
        assert_eq!(cell.state(), ServiceState::Stopped);

        assert_ok!(cell.begin_start());
        assert!(cell.activate());
        assert_eq!(cell.state(), ServiceState::Active);

        assert!(cell.stop());
        assert_eq!(cell.state(), ServiceState::Stopped);
        assert_err!(cell.begin_start());
    }

    #[test]
    fn test_start_only_once() {
        let cell = ServiceCell::new("instrument");
        assert_ok!(cell.begin_start());
        assert!(matches!(cell.begin_start(), Err(Error::Lifecycle { .. })));
    }

    #[test]
    fn test_error_is_sticky() {
        let cell = ServiceCell::new("device");
        cell.begin_start().unwrap();
        cell.activate();

        assert!(cell.fail("socket closed"));
        assert!(!cell.fail("again"));
        assert!(!cell.stop());
        assert_eq!(cell.state(), ServiceState::Error);
    }

    #[test]
    fn test_display() {
        assert_eq!(ServiceState::Active.to_string(), "ACTIVE");
        assert_eq!(format!("{}", ServiceState::Error), "ERROR");
    }

    #[test_log::test(tokio::test)]
    async fn test_wait_for_state() {
        let cell = std::sync::Arc::new(ServiceCell::new("waiter"));
        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.wait_for(ServiceState::Error).await })
        };

        cell.activate();
        cell.fail("boom");

        assert_eq!(waiter.await.unwrap(), ServiceState::Error);
    }
}
