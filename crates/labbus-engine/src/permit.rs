/*!
 * Channel-access permit.
 *
 * A permit marks a stretch of bus traffic that the interrupt collector must
 * not interleave with. The collector only ever tries to take it and skips its
 * cycle when it is held; exclusive sequences wait for it. Several instruments
 * on one bus may share a permit.
 */
use std::sync::{Arc, RwLock};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use labbus_devices::error::BusError;

use crate::error::{Error, Result};

/// Held permit; released when dropped
pub type PermitGuard = OwnedSemaphorePermit;

/// Whether an instrument's permit may be swapped after installation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermitPolicy {
    /// The first installed permit stays for the instrument's lifetime
    #[default]
    InstallOnce,
    /// A later installation replaces the current permit
    Replaceable,
}

impl PermitPolicy {
    /// Policy for the `replaceable_permit` configuration flag
    pub fn from_replaceable(replaceable: bool) -> Self {
        if replaceable {
            PermitPolicy::Replaceable
        } else {
            PermitPolicy::InstallOnce
        }
    }
}

/// A single-holder permit, cheap to clone and share
#[derive(Debug, Clone)]
pub struct ChannelPermit {
    semaphore: Arc<Semaphore>,
}

impl ChannelPermit {
    /// Create a free permit
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    /// Take the permit if nobody holds it
    pub fn try_acquire(&self) -> Option<PermitGuard> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    /// Wait for the permit
    pub async fn acquire(&self) -> Result<PermitGuard> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::interrupted("channel permit closed"))
    }

    /// Whether the permit is currently held
    pub fn is_held(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    /// Whether both handles refer to the same permit
    pub fn same_as(&self, other: &ChannelPermit) -> bool {
        Arc::ptr_eq(&self.semaphore, &other.semaphore)
    }
}

impl Default for ChannelPermit {
    fn default() -> Self {
        Self::new()
    }
}

/// Installation point for an instrument's permit
#[derive(Debug)]
pub struct PermitSlot {
    policy: PermitPolicy,
    current: RwLock<Option<ChannelPermit>>,
}

impl PermitSlot {
    /// Create an empty slot
    pub fn new(policy: PermitPolicy) -> Self {
        Self {
            policy,
            current: RwLock::new(None),
        }
    }

    /// Installation policy
    pub fn policy(&self) -> PermitPolicy {
        self.policy
    }

    /// Install `permit`, subject to the policy
    pub fn install(&self, permit: ChannelPermit) -> Result<()> {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if current.is_some() && self.policy == PermitPolicy::InstallOnce {
            return Err(Error::from(BusError::invalid_argument(
                "A channel permit is already installed and cannot be replaced",
            )));
        }
        debug!(replaced = current.is_some(), "Channel permit installed");
        *current = Some(permit);
        Ok(())
    }

    /// Currently installed permit
    pub fn current(&self) -> Option<ChannelPermit> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
