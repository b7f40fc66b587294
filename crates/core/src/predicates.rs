use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::command::{test_unit_ready, ScsiExecutor};
use crate::error::{ScsiError, TopologyError};
use crate::filters::multipath_path_hctls;
use crate::hctl::Hctl;
use crate::model::{MultipathDevice, PredicateResult, ScsiDevice, TopologySnapshot};

/// A condition over one topology snapshot. Implementations must not build
/// their own snapshot; every predicate checked in one poll iteration sees the
/// same instance.
pub trait Predicate: fmt::Display + Send + Sync {
    fn evaluate(
        &self,
        snapshot: &TopologySnapshot,
        executor: &dyn ScsiExecutor,
    ) -> Result<PredicateResult, TopologyError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "by", content = "value")]
pub enum DeviceSelector {
    ByHctl(Hctl),
    BySerial(String),
    /// Display name or access path, of a SCSI device or a multipath device.
    ByName(String),
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::ByHctl(hctl) => write!(f, "device {hctl}"),
            DeviceSelector::BySerial(serial) => write!(f, "device with serial {serial}"),
            DeviceSelector::ByName(name) => write!(f, "device {name}"),
        }
    }
}

#[derive(Default)]
struct Matches<'a> {
    devices: Vec<&'a ScsiDevice>,
    multipath: Vec<&'a MultipathDevice>,
    /// Some candidate could not be probed for a recoverable reason.
    undecided: bool,
}

impl Matches<'_> {
    fn found(&self) -> bool {
        !self.devices.is_empty() || !self.multipath.is_empty()
    }

    fn presence(&self) -> PredicateResult {
        if self.found() {
            PredicateResult::True
        } else if self.undecided {
            PredicateResult::Indeterminate
        } else {
            PredicateResult::False
        }
    }
}

impl DeviceSelector {
    fn resolve<'a>(
        &self,
        snapshot: &'a TopologySnapshot,
        executor: &dyn ScsiExecutor,
    ) -> Result<Matches<'a>, TopologyError> {
        let mut matches = Matches::default();
        match self {
            DeviceSelector::ByHctl(hctl) => {
                matches.devices.extend(snapshot.block_device(hctl));
            }
            DeviceSelector::ByName(name) => {
                let path = Path::new(name);
                matches.devices = snapshot
                    .scsi_block_devices()
                    .iter()
                    .filter(|device| device.display_name == *name || device.access_path == path)
                    .collect();
                matches.multipath = snapshot
                    .multipath_devices()
                    .iter()
                    .filter(|device| {
                        device.name == *name
                            || device.display_name == *name
                            || device.access_path == path
                    })
                    .collect();
            }
            DeviceSelector::BySerial(serial) => {
                let serial = serial.trim();
                let claimed = multipath_path_hctls(snapshot.multipath_devices());
                for device in snapshot
                    .scsi_block_devices()
                    .iter()
                    .filter(|device| !claimed.contains(&device.hctl))
                {
                    match serial_matches(device, serial, executor)? {
                        Some(true) => matches.devices.push(device),
                        Some(false) => {}
                        None => matches.undecided = true,
                    }
                }
                for multipath in snapshot.multipath_devices() {
                    let Some(path_device) = multipath
                        .up_paths()
                        .find_map(|path| snapshot.block_device(&path.hctl))
                    else {
                        continue;
                    };
                    match serial_matches(path_device, serial, executor)? {
                        Some(true) => matches.multipath.push(multipath),
                        Some(false) => {}
                        None => matches.undecided = true,
                    }
                }
            }
        }
        Ok(matches)
    }
}

/// `None` when the serial could not be read for a recoverable reason.
fn serial_matches(
    device: &ScsiDevice,
    serial: &str,
    executor: &dyn ScsiExecutor,
) -> Result<Option<bool>, TopologyError> {
    match device.serial_number(executor) {
        Ok(found) => Ok(Some(found.trim() == serial)),
        Err(err) if err.is_recoverable() => {
            debug!("serial of {} unavailable: {}", device.display_name, err);
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceExists(pub DeviceSelector);

impl fmt::Display for DeviceExists {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to appear", self.0)
    }
}

impl Predicate for DeviceExists {
    fn evaluate(
        &self,
        snapshot: &TopologySnapshot,
        executor: &dyn ScsiExecutor,
    ) -> Result<PredicateResult, TopologyError> {
        Ok(self.0.resolve(snapshot, executor)?.presence())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceGone(pub DeviceSelector);

impl fmt::Display for DeviceGone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to disappear", self.0)
    }
}

impl Predicate for DeviceGone {
    fn evaluate(
        &self,
        snapshot: &TopologySnapshot,
        executor: &dyn ScsiExecutor,
    ) -> Result<PredicateResult, TopologyError> {
        Ok(match self.0.resolve(snapshot, executor)?.presence() {
            PredicateResult::True => PredicateResult::False,
            PredicateResult::False => PredicateResult::True,
            PredicateResult::Indeterminate => PredicateResult::Indeterminate,
        })
    }
}

/// A LUN of a storage target as seen through one host, or through any host
/// when `host` is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LunMapping {
    pub host: Option<u32>,
    pub channel: u32,
    pub target: u32,
    pub lun: u64,
}

impl LunMapping {
    fn matches(&self, hctl: &Hctl) -> bool {
        self.host.map_or(true, |host| host == hctl.host)
            && hctl.channel == self.channel
            && hctl.target == self.target
            && hctl.lun == self.lun
    }

    fn is_visible(&self, snapshot: &TopologySnapshot) -> bool {
        snapshot
            .scsi_block_devices()
            .iter()
            .any(|device| self.matches(&device.hctl))
    }
}

impl fmt::Display for LunMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host {
            Some(host) => write!(
                f,
                "LUN {} of {}:{}:{}",
                self.lun, host, self.channel, self.target
            ),
            None => write!(
                f,
                "LUN {} of *:{}:{}",
                self.lun, self.channel, self.target
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingExists(pub LunMapping);

impl fmt::Display for MappingExists {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to be mapped", self.0)
    }
}

impl Predicate for MappingExists {
    fn evaluate(
        &self,
        snapshot: &TopologySnapshot,
        _executor: &dyn ScsiExecutor,
    ) -> Result<PredicateResult, TopologyError> {
        Ok(self.0.is_visible(snapshot).into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingGone(pub LunMapping);

impl fmt::Display for MappingGone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to be unmapped", self.0)
    }
}

impl Predicate for MappingGone {
    fn evaluate(
        &self,
        snapshot: &TopologySnapshot,
        _executor: &dyn ScsiExecutor,
    ) -> Result<PredicateResult, TopologyError> {
        Ok((!self.0.is_visible(snapshot)).into())
    }
}

/// Every selected device exists and answers TEST UNIT READY. Multipath
/// devices are ready when all their up paths are. With no selectors, every
/// standalone SCSI block device and every up multipath path is checked.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DevicesReady(pub Vec<DeviceSelector>);

impl fmt::Display for DevicesReady {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "all devices to be ready");
        }
        let selectors = self
            .0
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "{selectors} to be ready")
    }
}

impl Predicate for DevicesReady {
    fn evaluate(
        &self,
        snapshot: &TopologySnapshot,
        executor: &dyn ScsiExecutor,
    ) -> Result<PredicateResult, TopologyError> {
        let mut devices: Vec<&ScsiDevice> = Vec::new();
        if self.0.is_empty() {
            let claimed = multipath_path_hctls(snapshot.multipath_devices());
            devices.extend(
                snapshot
                    .scsi_block_devices()
                    .iter()
                    .filter(|device| !claimed.contains(&device.hctl)),
            );
            for multipath in snapshot.multipath_devices() {
                devices.extend(
                    multipath
                        .up_paths()
                        .filter_map(|path| snapshot.block_device(&path.hctl)),
                );
            }
        }
        for selector in &self.0 {
            let matches = selector.resolve(snapshot, executor)?;
            if !matches.found() {
                return Ok(if matches.undecided {
                    PredicateResult::Indeterminate
                } else {
                    PredicateResult::False
                });
            }
            devices.extend(matches.devices);
            for multipath in matches.multipath {
                devices.extend(
                    multipath
                        .up_paths()
                        .filter_map(|path| snapshot.block_device(&path.hctl)),
                );
            }
        }

        let mut result = PredicateResult::True;
        for device in devices {
            match test_unit_ready(executor, device.command_path()) {
                Ok(()) => {}
                Err(ScsiError::NotReady) => {
                    debug!("{} is not ready", device.display_name);
                    return Ok(PredicateResult::False);
                }
                Err(err) if err.is_recoverable() => {
                    debug!("{} readiness unknown: {}", device.display_name, err);
                    result = PredicateResult::Indeterminate;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(result)
    }
}

/// Conjunction over one shared snapshot. A false child wins over an
/// indeterminate one; a recoverable child error counts as indeterminate.
pub struct AllOf(pub Vec<Box<dyn Predicate>>);

impl fmt::Display for AllOf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self
            .0
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" and ");
        write!(f, "{parts}")
    }
}

impl Predicate for AllOf {
    fn evaluate(
        &self,
        snapshot: &TopologySnapshot,
        executor: &dyn ScsiExecutor,
    ) -> Result<PredicateResult, TopologyError> {
        let mut result = PredicateResult::True;
        for predicate in &self.0 {
            match predicate.evaluate(snapshot, executor) {
                Ok(PredicateResult::True) => {}
                Ok(PredicateResult::False) => return Ok(PredicateResult::False),
                Ok(PredicateResult::Indeterminate) => result = PredicateResult::Indeterminate,
                Err(err) if err.is_recoverable() => {
                    debug!("{} is indeterminate: {}", predicate, err);
                    result = PredicateResult::Indeterminate;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(result)
    }
}

/// Wraps a closure as a predicate with a fixed description.
pub struct FnPredicate<F> {
    description: String,
    check: F,
}

pub fn predicate_fn<F>(description: impl Into<String>, check: F) -> FnPredicate<F>
where
    F: Fn(&TopologySnapshot, &dyn ScsiExecutor) -> Result<PredicateResult, TopologyError>
        + Send
        + Sync,
{
    FnPredicate {
        description: description.into(),
        check,
    }
}

impl<F> fmt::Display for FnPredicate<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

impl<F> Predicate for FnPredicate<F>
where
    F: Fn(&TopologySnapshot, &dyn ScsiExecutor) -> Result<PredicateResult, TopologyError>
        + Send
        + Sync,
{
    fn evaluate(
        &self,
        snapshot: &TopologySnapshot,
        executor: &dyn ScsiExecutor,
    ) -> Result<PredicateResult, TopologyError> {
        (self.check)(snapshot, executor)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        predicate_fn, AllOf, DeviceExists, DeviceGone, DeviceSelector, DevicesReady, LunMapping,
        MappingExists, MappingGone, Predicate,
    };
    use crate::command::testing::ScriptedExecutor;
    use crate::command::{ScsiCommand, ScsiResponse};
    use crate::error::{ScsiError, TopologyError, UnitAttentionReason};
    use crate::hctl::Hctl;
    use crate::model::{
        LoadBalancePolicy, MultipathDevice, MultipathPath, PathState, PeripheralType,
        PredicateResult, ScsiDevice, TopologySnapshot,
    };

    fn disk(hctl: Hctl, name: &str) -> ScsiDevice {
        ScsiDevice::new(hctl, format!("/dev/{name}"), format!("/dev/{name}"), PeripheralType::Disk)
    }

    /// sda standalone, sdb and sdc as two paths of mpatha.
    fn snapshot() -> TopologySnapshot {
        TopologySnapshot::new(
            vec![
                disk(Hctl::new(0, 0, 0, 1), "sda"),
                disk(Hctl::new(1, 0, 2, 5), "sdb"),
                disk(Hctl::new(2, 0, 2, 5), "sdc"),
            ],
            Vec::new(),
            vec![MultipathDevice {
                name: "mpatha".to_string(),
                display_name: "/dev/mapper/mpatha".to_string(),
                access_path: "/dev/mapper/mpatha".into(),
                policy: LoadBalancePolicy::RoundRobin,
                paths: vec![
                    MultipathPath {
                        hctl: Hctl::new(1, 0, 2, 5),
                        path_id: "sdb".to_string(),
                        state: PathState::Up,
                    },
                    MultipathPath {
                        hctl: Hctl::new(2, 0, 2, 5),
                        path_id: "sdc".to_string(),
                        state: PathState::Down,
                    },
                ],
            }],
        )
    }

    fn serials() -> ScriptedExecutor {
        ScriptedExecutor::default()
            .on(
                "/dev/sda",
                ScsiCommand::UnitSerialNumber,
                Ok(ScsiResponse::UnitSerialNumber("SERIAL-A".to_string())),
            )
            .on(
                "/dev/sdb",
                ScsiCommand::UnitSerialNumber,
                Ok(ScsiResponse::UnitSerialNumber("  SERIAL-MP  ".to_string())),
            )
    }

    #[test]
    fn device_exists_by_hctl_and_name() {
        let snapshot = snapshot();
        let executor = ScriptedExecutor::default();

        let by_hctl = DeviceExists(DeviceSelector::ByHctl(Hctl::new(0, 0, 0, 1)));
        assert_eq!(
            by_hctl.evaluate(&snapshot, &executor).expect("evaluate"),
            PredicateResult::True
        );
        let missing = DeviceExists(DeviceSelector::ByHctl(Hctl::new(0, 0, 0, 9)));
        assert_eq!(
            missing.evaluate(&snapshot, &executor).expect("evaluate"),
            PredicateResult::False
        );
        let by_name = DeviceExists(DeviceSelector::ByName("mpatha".to_string()));
        assert_eq!(
            by_name.evaluate(&snapshot, &executor).expect("evaluate"),
            PredicateResult::True
        );
        let gone = DeviceGone(DeviceSelector::ByName("/dev/sdz".to_string()));
        assert_eq!(
            gone.evaluate(&snapshot, &executor).expect("evaluate"),
            PredicateResult::True
        );
        assert_eq!(by_hctl.to_string(), "device 0:0:0:1 to appear");
    }

    #[test]
    fn serial_lookup_uses_multipath_up_path() {
        let snapshot = snapshot();
        let executor = serials();

        let multipath = DeviceExists(DeviceSelector::BySerial("SERIAL-MP".to_string()));
        assert_eq!(
            multipath.evaluate(&snapshot, &executor).expect("evaluate"),
            PredicateResult::True
        );
        let standalone = DeviceExists(DeviceSelector::BySerial("SERIAL-A".to_string()));
        assert_eq!(
            standalone.evaluate(&snapshot, &executor).expect("evaluate"),
            PredicateResult::True
        );
        // sdc is a down path and must never be probed.
        assert_eq!(executor.call_count(&ScsiCommand::UnitSerialNumber), 2);
    }

    #[test]
    fn recoverable_serial_failure_is_indeterminate() {
        let snapshot = snapshot();
        let executor = ScriptedExecutor::default()
            .on(
                "/dev/sda",
                ScsiCommand::UnitSerialNumber,
                Err(ScsiError::UnitAttention(UnitAttentionReason::BusReset)),
            )
            .on(
                "/dev/sdb",
                ScsiCommand::UnitSerialNumber,
                Ok(ScsiResponse::UnitSerialNumber("OTHER".to_string())),
            );

        let exists = DeviceExists(DeviceSelector::BySerial("SERIAL-A".to_string()));
        assert_eq!(
            exists.evaluate(&snapshot, &executor).expect("evaluate"),
            PredicateResult::Indeterminate
        );
        let gone = DeviceGone(DeviceSelector::BySerial("SERIAL-A".to_string()));
        assert_eq!(
            gone.evaluate(&snapshot, &executor).expect("evaluate"),
            PredicateResult::Indeterminate
        );
    }

    #[test]
    fn fatal_serial_failure_propagates() {
        let snapshot = snapshot();
        let executor = ScriptedExecutor::default().on(
            "/dev/sda",
            ScsiCommand::UnitSerialNumber,
            Err(ScsiError::ReservationConflict),
        );
        let exists = DeviceExists(DeviceSelector::BySerial("SERIAL-A".to_string()));
        let err = exists
            .evaluate(&snapshot, &executor)
            .expect_err("reservation conflict is fatal");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn mapping_on_any_host_or_specific_host() {
        let snapshot = snapshot();
        let executor = ScriptedExecutor::default();
        let any_host = LunMapping {
            host: None,
            channel: 0,
            target: 2,
            lun: 5,
        };
        let host_three = LunMapping {
            host: Some(3),
            ..any_host
        };

        assert_eq!(
            MappingExists(any_host)
                .evaluate(&snapshot, &executor)
                .expect("evaluate"),
            PredicateResult::True
        );
        assert_eq!(
            MappingExists(host_three)
                .evaluate(&snapshot, &executor)
                .expect("evaluate"),
            PredicateResult::False
        );
        assert_eq!(
            MappingGone(host_three)
                .evaluate(&snapshot, &executor)
                .expect("evaluate"),
            PredicateResult::True
        );
        assert_eq!(MappingGone(host_three).to_string(), "LUN 5 of 3:0:2 to be unmapped");
    }

    #[test]
    fn devices_ready_checks_test_unit_ready() {
        let snapshot = snapshot();
        let ready = ScriptedExecutor::default()
            .on("/dev/sda", ScsiCommand::TestUnitReady, Ok(ScsiResponse::Ready))
            .on("/dev/sdb", ScsiCommand::TestUnitReady, Ok(ScsiResponse::Ready));
        let selectors = DevicesReady(vec![
            DeviceSelector::ByName("/dev/sda".to_string()),
            DeviceSelector::ByName("mpatha".to_string()),
        ]);
        assert_eq!(
            selectors.evaluate(&snapshot, &ready).expect("evaluate"),
            PredicateResult::True
        );

        let not_ready = ScriptedExecutor::default()
            .on("/dev/sda", ScsiCommand::TestUnitReady, Err(ScsiError::NotReady))
            .on("/dev/sdb", ScsiCommand::TestUnitReady, Ok(ScsiResponse::Ready));
        assert_eq!(
            selectors.evaluate(&snapshot, &not_ready).expect("evaluate"),
            PredicateResult::False
        );

        let absent = DevicesReady(vec![DeviceSelector::ByHctl(Hctl::new(7, 0, 0, 0))]);
        assert_eq!(
            absent.evaluate(&snapshot, &ready).expect("evaluate"),
            PredicateResult::False
        );
    }

    #[test]
    fn all_devices_ready_skips_down_multipath_paths() {
        let snapshot = snapshot();
        let all = DevicesReady::default();

        // sdc is the down path of mpatha; an unscripted TUR would be fatal.
        let healthy = ScriptedExecutor::default()
            .on("/dev/sda", ScsiCommand::TestUnitReady, Ok(ScsiResponse::Ready))
            .on("/dev/sdb", ScsiCommand::TestUnitReady, Ok(ScsiResponse::Ready));
        assert_eq!(
            all.evaluate(&snapshot, &healthy).expect("evaluate"),
            PredicateResult::True
        );

        let dead_path_not_ready = ScriptedExecutor::default()
            .on("/dev/sda", ScsiCommand::TestUnitReady, Ok(ScsiResponse::Ready))
            .on("/dev/sdb", ScsiCommand::TestUnitReady, Ok(ScsiResponse::Ready))
            .on("/dev/sdc", ScsiCommand::TestUnitReady, Err(ScsiError::NotReady));
        assert_eq!(
            all.evaluate(&snapshot, &dead_path_not_ready).expect("evaluate"),
            PredicateResult::True
        );

        let up_path_not_ready = ScriptedExecutor::default()
            .on("/dev/sda", ScsiCommand::TestUnitReady, Ok(ScsiResponse::Ready))
            .on("/dev/sdb", ScsiCommand::TestUnitReady, Err(ScsiError::NotReady));
        assert_eq!(
            all.evaluate(&snapshot, &up_path_not_ready).expect("evaluate"),
            PredicateResult::False
        );
    }

    #[test]
    fn all_of_combines_children() {
        let snapshot = snapshot();
        let executor = ScriptedExecutor::default();
        let all = AllOf(vec![
            Box::new(DeviceExists(DeviceSelector::ByHctl(Hctl::new(0, 0, 0, 1)))),
            Box::new(predicate_fn("unit ready", |_, _| {
                Err(TopologyError::Scsi(ScsiError::NotReady))
            })),
        ]);
        assert_eq!(
            all.evaluate(&snapshot, &executor).expect("evaluate"),
            PredicateResult::Indeterminate
        );

        let with_false = AllOf(vec![
            Box::new(predicate_fn("never", |_, _| Ok(PredicateResult::False))),
            Box::new(predicate_fn("broken", |_, _| {
                Err(TopologyError::Rescan("unreachable".to_string()))
            })),
        ]);
        assert_eq!(
            with_false.evaluate(&snapshot, &executor).expect("evaluate"),
            PredicateResult::False
        );
        assert_eq!(with_false.to_string(), "never and broken");
    }
}
