use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::TopologyError;
use crate::model::{MultipathDevice, ScsiDevice, TopologySnapshot};
use crate::platform::TopologyProvider;
use crate::process::{run_with_deadline, ProcessSpec, RescanProcess};

const DEFAULT_RESCAN_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Platform enumeration for systems without a target-level scanner.
pub trait DeviceInventory: Send + Sync {
    fn scsi_block_devices(&self) -> Result<Vec<ScsiDevice>, TopologyError>;
    fn scsi_controllers(&self) -> Result<Vec<ScsiDevice>, TopologyError>;
    fn multipath_devices(&self) -> Result<Vec<MultipathDevice>, TopologyError>;
}

/// Inventory captured ahead of time, typically exported as JSON by a
/// platform tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticInventory {
    #[serde(default)]
    pub scsi_block_devices: Vec<ScsiDevice>,
    #[serde(default)]
    pub scsi_controllers: Vec<ScsiDevice>,
    #[serde(default)]
    pub multipath_devices: Vec<MultipathDevice>,
}

impl DeviceInventory for StaticInventory {
    fn scsi_block_devices(&self) -> Result<Vec<ScsiDevice>, TopologyError> {
        Ok(self.scsi_block_devices.clone())
    }

    fn scsi_controllers(&self) -> Result<Vec<ScsiDevice>, TopologyError> {
        Ok(self.scsi_controllers.clone())
    }

    fn multipath_devices(&self) -> Result<Vec<MultipathDevice>, TopologyError> {
        Ok(self.multipath_devices.clone())
    }
}

/// A single OS-level "rescan everything" command plus an inventory.
pub struct GenericProvider {
    inventory: Arc<dyn DeviceInventory>,
    rescan_command: Option<ProcessSpec>,
    rescan_timeout: Duration,
    terminate_timeout: Duration,
    in_flight: Mutex<Option<RescanProcess>>,
}

impl GenericProvider {
    pub fn new(inventory: Arc<dyn DeviceInventory>) -> Self {
        Self {
            inventory,
            rescan_command: None,
            rescan_timeout: DEFAULT_RESCAN_TIMEOUT,
            terminate_timeout: DEFAULT_TERMINATE_TIMEOUT,
            in_flight: Mutex::new(None),
        }
    }

    pub fn with_rescan_command(mut self, command: Option<ProcessSpec>) -> Self {
        self.rescan_command = command;
        self
    }

    pub fn with_timeouts(
        mut self,
        rescan_timeout: Duration,
        terminate_timeout: Duration,
    ) -> Self {
        self.rescan_timeout = rescan_timeout;
        self.terminate_timeout = terminate_timeout;
        self
    }

    /// Clears the in-flight slot before a new rescan. Returns `true` when a
    /// background rescan still inside its time budget was kept, in which case
    /// a non-blocking caller must not start another one.
    fn settle_in_flight(&self, slot: &mut Option<RescanProcess>, wait: bool) -> bool {
        let Some(mut process) = slot.take() else {
            return false;
        };
        let finished = process.try_finished().unwrap_or_else(|err| {
            warn!("{}", err);
            None
        });
        match finished {
            Some(status) if status.success() => {
                debug!("background rescan {} finished", process.label())
            }
            Some(status) => {
                warn!("background rescan {} exited with {}", process.label(), status)
            }
            None if !wait && process.elapsed() < self.rescan_timeout => {
                debug!("background rescan {} still running", process.label());
                *slot = Some(process);
                return true;
            }
            None => {
                info!(
                    "terminating rescan {} still running after {:?}",
                    process.label(),
                    process.elapsed()
                );
                process.terminate(self.terminate_timeout);
            }
        }
        false
    }

    fn lock_in_flight(&self) -> Result<MutexGuard<'_, Option<RescanProcess>>, TopologyError> {
        self.in_flight
            .lock()
            .map_err(|_| TopologyError::Rescan("rescan process lock poisoned".to_string()))
    }
}

impl Drop for GenericProvider {
    fn drop(&mut self) {
        let process = match self.in_flight.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(process) = process {
            process.terminate(self.terminate_timeout);
        }
    }
}

impl TopologyProvider for GenericProvider {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn enumerate(&self) -> Result<TopologySnapshot, TopologyError> {
        Ok(TopologySnapshot::new(
            self.inventory.scsi_block_devices()?,
            self.inventory.scsi_controllers()?,
            self.inventory.multipath_devices()?,
        ))
    }

    fn initiate_rescan(&self, wait: bool) -> Result<(), TopologyError> {
        let Some(command) = &self.rescan_command else {
            debug!("no rescan command configured for this platform");
            return Ok(());
        };
        let mut slot = self.lock_in_flight()?;
        if self.settle_in_flight(&mut slot, wait) {
            return Ok(());
        }

        if wait {
            info!("running {}", command.describe());
            return run_with_deadline(command, self.rescan_timeout, self.terminate_timeout);
        }
        *slot = Some(RescanProcess::spawn(command)?);
        Ok(())
    }

    fn retry_rescan(&self) -> Result<(), TopologyError> {
        self.initiate_rescan(false)
    }
}
