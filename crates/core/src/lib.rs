pub mod command;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod filters;
pub mod generic;
pub mod hctl;
pub mod linux;
pub mod model;
pub mod platform;
pub mod predicates;
pub mod process;
pub mod scanner;
pub mod service;
pub mod sg3;
pub mod sysfs;

pub use command::{
    is_lun_online, read_capacity, report_luns, standard_inquiry, test_unit_ready,
    unit_serial_number, CapacityData, InquiryData, ScsiCommand, ScsiExecutor, ScsiResponse,
    SelectReport,
};
pub use config::{PlatformKind, RescanIsolation, RescanOptions, TopologyConfig, WaitTimeout};
pub use coordinator::RescanCoordinator;
pub use error::{RescanError, ScsiError, TopologyError, UnitAttentionReason};
pub use filters::{filter_non_multipath_scsi_block_devices, filter_vendor_specific};
pub use generic::{DeviceInventory, GenericProvider, StaticInventory};
pub use hctl::{Hctl, TargetAddress};
pub use linux::{DmsetupPolicies, LinuxProvider, MultipathPolicySource};
pub use model::{
    DeviceAttributes, LoadBalancePolicy, MultipathDevice, MultipathPath, PathState,
    PeripheralType, PredicateResult, RescanOutcome, ScsiDevice, TopologySnapshot,
};
pub use platform::{build_provider, TopologyProvider};
pub use predicates::{
    predicate_fn, AllOf, DeviceExists, DeviceGone, DeviceSelector, DevicesReady, LunMapping,
    MappingExists, MappingGone, Predicate,
};
pub use process::{ProcessSpec, RescanProcess};
pub use scanner::{
    HostScanReport, LinuxBusScanner, LunDiff, ScanDepth, TargetOutcome, TargetScanReport,
};
pub use service::TopologyService;
pub use sg3::Sg3UtilsExecutor;
pub use sysfs::{ScsiBus, Sysfs};
