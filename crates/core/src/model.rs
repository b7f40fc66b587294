use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::command::{
    read_capacity, standard_inquiry, unit_serial_number, InquiryData, ScsiExecutor,
};
use crate::error::ScsiError;
use crate::filters::filter_non_multipath_scsi_block_devices;
use crate::hctl::Hctl;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeripheralType {
    Disk,
    StorageController,
    Other(u8),
}

impl PeripheralType {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => PeripheralType::Disk,
            0x0c => PeripheralType::StorageController,
            other => PeripheralType::Other(other),
        }
    }
}

/// Attributes the kernel already exposes for a device, read at enumeration
/// time without issuing any SCSI command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAttributes {
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub state: Option<String>,
}

/// One raw SCSI-addressable entity.
///
/// Derived properties (inquiry, serial number, capacity) cost one collaborator
/// call each. They are memoized on the instance, failures included, and go
/// away with it; a fresh snapshot starts with an empty cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScsiDevice {
    pub hctl: Hctl,
    pub display_name: String,
    pub access_path: PathBuf,
    #[serde(default)]
    pub generic_path: Option<PathBuf>,
    pub peripheral_type: PeripheralType,
    #[serde(default)]
    pub attributes: DeviceAttributes,
    #[serde(skip)]
    cache: PropertyCache,
}

#[derive(Debug, Clone, Default)]
struct PropertyCache {
    inquiry: OnceCell<Result<InquiryData, ScsiError>>,
    serial_number: OnceCell<Result<String, ScsiError>>,
    capacity_bytes: OnceCell<Result<u64, ScsiError>>,
}

impl ScsiDevice {
    pub fn new(
        hctl: Hctl,
        display_name: impl Into<String>,
        access_path: impl Into<PathBuf>,
        peripheral_type: PeripheralType,
    ) -> Self {
        Self {
            hctl,
            display_name: display_name.into(),
            access_path: access_path.into(),
            generic_path: None,
            peripheral_type,
            attributes: DeviceAttributes::default(),
            cache: PropertyCache::default(),
        }
    }

    /// Handle SCSI commands are sent to: the generic device when there is
    /// one, the access path otherwise.
    pub fn command_path(&self) -> &Path {
        self.generic_path.as_deref().unwrap_or(&self.access_path)
    }

    pub fn inquiry(&self, executor: &dyn ScsiExecutor) -> Result<&InquiryData, ScsiError> {
        self.cache
            .inquiry
            .get_or_init(|| {
                debug!("probing inquiry for {} ({})", self.display_name, self.hctl);
                standard_inquiry(executor, self.command_path())
            })
            .as_ref()
            .map_err(Clone::clone)
    }

    pub fn serial_number(&self, executor: &dyn ScsiExecutor) -> Result<&str, ScsiError> {
        self.cache
            .serial_number
            .get_or_init(|| unit_serial_number(executor, self.command_path()))
            .as_ref()
            .map(String::as_str)
            .map_err(Clone::clone)
    }

    pub fn capacity_bytes(&self, executor: &dyn ScsiExecutor) -> Result<u64, ScsiError> {
        self.cache
            .capacity_bytes
            .get_or_init(|| {
                read_capacity(executor, self.command_path()).map(|data| data.capacity_bytes())
            })
            .clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathState {
    Up,
    Down,
}

/// One I/O path of a multipath device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipathPath {
    pub hctl: Hctl,
    pub path_id: String,
    pub state: PathState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancePolicy {
    FailoverOnly,
    RoundRobin,
    WeightedPaths,
    LeastQueueDepth,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipathDevice {
    pub name: String,
    pub display_name: String,
    pub access_path: PathBuf,
    #[serde(default)]
    pub policy: LoadBalancePolicy,
    pub paths: Vec<MultipathPath>,
}

impl MultipathDevice {
    pub fn is_live(&self) -> bool {
        self.paths.iter().any(|path| path.state == PathState::Up)
    }

    pub fn up_paths(&self) -> impl Iterator<Item = &MultipathPath> {
        self.paths
            .iter()
            .filter(|path| path.state == PathState::Up)
    }

    pub fn owns(&self, hctl: &Hctl) -> bool {
        self.paths.iter().any(|path| path.hctl == *hctl)
    }
}

/// Immutable view of the SCSI and multipath layers at one point in time.
///
/// `scsi_block_devices` is the raw, unfiltered list; paths of multipath
/// devices show up there too. Use [`TopologySnapshot::non_multipath_block_devices`]
/// for the deduplicated view.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TopologySnapshot {
    scsi_block_devices: Vec<ScsiDevice>,
    scsi_controllers: Vec<ScsiDevice>,
    multipath_devices: Vec<MultipathDevice>,
}

impl TopologySnapshot {
    /// Builds a snapshot, dropping multipath devices with no path up.
    pub fn new(
        mut scsi_block_devices: Vec<ScsiDevice>,
        mut scsi_controllers: Vec<ScsiDevice>,
        multipath_devices: Vec<MultipathDevice>,
    ) -> Self {
        scsi_block_devices.sort_by(|a, b| a.hctl.cmp(&b.hctl));
        scsi_controllers.sort_by(|a, b| a.hctl.cmp(&b.hctl));
        let multipath_devices = multipath_devices
            .into_iter()
            .filter(|device| {
                let live = device.is_live();
                if !live {
                    debug!("skipping multipath device {} with no path up", device.name);
                }
                live
            })
            .collect();
        Self {
            scsi_block_devices,
            scsi_controllers,
            multipath_devices,
        }
    }

    pub fn scsi_block_devices(&self) -> &[ScsiDevice] {
        &self.scsi_block_devices
    }

    pub fn scsi_controllers(&self) -> &[ScsiDevice] {
        &self.scsi_controllers
    }

    pub fn multipath_devices(&self) -> &[MultipathDevice] {
        &self.multipath_devices
    }

    pub fn non_multipath_block_devices(&self) -> Vec<ScsiDevice> {
        filter_non_multipath_scsi_block_devices(&self.scsi_block_devices, &self.multipath_devices)
    }

    pub fn block_device(&self, hctl: &Hctl) -> Option<&ScsiDevice> {
        self.scsi_block_devices
            .iter()
            .find(|device| device.hctl == *hctl)
    }

    pub fn multipath_device_for_path(&self, hctl: &Hctl) -> Option<&MultipathDevice> {
        self.multipath_devices
            .iter()
            .find(|device| device.owns(hctl))
    }

    pub fn is_empty(&self) -> bool {
        self.scsi_block_devices.is_empty()
            && self.scsi_controllers.is_empty()
            && self.multipath_devices.is_empty()
    }
}

/// Tri-state answer of a predicate over a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateResult {
    True,
    False,
    Indeterminate,
}

impl From<bool> for PredicateResult {
    fn from(value: bool) -> Self {
        if value {
            PredicateResult::True
        } else {
            PredicateResult::False
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RescanOutcome {
    pub converged: bool,
    pub elapsed_nanos: u64,
    pub iterations: u32,
    pub last_predicate_result: PredicateResult,
}

impl RescanOutcome {
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_nanos)
    }
}
