use std::collections::HashMap;
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::command::ScsiExecutor;
use crate::error::TopologyError;
use crate::hctl::Hctl;
use crate::model::{
    LoadBalancePolicy, MultipathDevice, MultipathPath, PathState, PeripheralType, ScsiDevice,
    TopologySnapshot,
};
use crate::platform::TopologyProvider;
use crate::scanner::{HostScanReport, LinuxBusScanner, ScanDepth};
use crate::sysfs::{ScsiBus, SysfsDevice};

/// Source of multipath load-balance policies keyed by map name.
pub trait MultipathPolicySource: Send + Sync {
    fn policies(&self) -> HashMap<String, LoadBalancePolicy>;
}

/// Reads `dmsetup table --target multipath`. Any failure yields no policies.
#[derive(Debug, Clone, Copy, Default)]
pub struct DmsetupPolicies;

impl MultipathPolicySource for DmsetupPolicies {
    fn policies(&self) -> HashMap<String, LoadBalancePolicy> {
        let output = match Command::new("dmsetup")
            .args(["table", "--target", "multipath"])
            .output()
        {
            Ok(output) => output,
            Err(err) => {
                debug!("dmsetup unavailable: {}", err);
                return HashMap::new();
            }
        };
        if !output.status.success() {
            debug!("dmsetup table exited with {}", output.status);
            return HashMap::new();
        }
        parse_multipath_table(&String::from_utf8_lossy(&output.stdout))
    }
}

pub fn parse_multipath_table(table: &str) -> HashMap<String, LoadBalancePolicy> {
    table
        .lines()
        .filter_map(parse_multipath_table_line)
        .collect()
}

/// Parses one `name: start length multipath ...` line into the map name and
/// the policy implied by its path groups.
pub fn parse_multipath_table_line(line: &str) -> Option<(String, LoadBalancePolicy)> {
    let (name, rest) = line.split_once(':')?;
    let mut tokens = rest.split_whitespace();
    tokens.next()?;
    tokens.next()?;
    if tokens.next()? != "multipath" {
        return None;
    }
    // features, then hardware handler
    skip_counted(&mut tokens)?;
    skip_counted(&mut tokens)?;

    let group_count: usize = tokens.next()?.parse().ok()?;
    tokens.next()?;
    let mut groups = Vec::with_capacity(group_count);
    for _ in 0..group_count {
        let selector = tokens.next()?.to_string();
        skip_counted(&mut tokens)?;
        let path_count: usize = tokens.next()?.parse().ok()?;
        let path_args: usize = tokens.next()?.parse().ok()?;
        for _ in 0..path_count * (1 + path_args) {
            tokens.next()?;
        }
        groups.push((selector, path_count));
    }

    Some((name.trim().to_string(), policy_from_groups(&groups)))
}

fn skip_counted<'a>(tokens: &mut impl Iterator<Item = &'a str>) -> Option<()> {
    let count: usize = tokens.next()?.parse().ok()?;
    for _ in 0..count {
        tokens.next()?;
    }
    Some(())
}

fn policy_from_groups(groups: &[(String, usize)]) -> LoadBalancePolicy {
    if groups.len() > 1 && groups.iter().all(|(_, paths)| *paths == 1) {
        return LoadBalancePolicy::FailoverOnly;
    }
    match groups.first().map(|(selector, _)| selector.as_str()) {
        Some("round-robin") => LoadBalancePolicy::RoundRobin,
        Some("queue-length") => LoadBalancePolicy::LeastQueueDepth,
        Some("service-time") => LoadBalancePolicy::WeightedPaths,
        _ => LoadBalancePolicy::Unknown,
    }
}

/// Linux topology: sysfs enumeration, device-mapper multipath, and target
/// reconciliation through [`LinuxBusScanner`].
pub struct LinuxProvider {
    bus: Arc<dyn ScsiBus>,
    executor: Arc<dyn ScsiExecutor>,
    scanner: Arc<LinuxBusScanner>,
    policies: Option<Box<dyn MultipathPolicySource>>,
    in_flight: Mutex<Option<JoinHandle<()>>>,
}

impl LinuxProvider {
    pub fn new(bus: Arc<dyn ScsiBus>, executor: Arc<dyn ScsiExecutor>) -> Self {
        let scanner = Arc::new(LinuxBusScanner::new(
            Arc::clone(&bus),
            Arc::clone(&executor),
        ));
        Self {
            bus,
            executor,
            scanner,
            policies: None,
            in_flight: Mutex::new(None),
        }
    }

    pub fn with_async_scan(mut self, async_scan_populates_sysfs: bool) -> Self {
        self.scanner = Arc::new(
            LinuxBusScanner::new(Arc::clone(&self.bus), Arc::clone(&self.executor))
                .with_async_scan(async_scan_populates_sysfs),
        );
        self
    }

    pub fn with_policy_source(mut self, source: Box<dyn MultipathPolicySource>) -> Self {
        self.policies = Some(source);
        self
    }

    pub fn scanner(&self) -> &LinuxBusScanner {
        &self.scanner
    }

    fn scan(&self, depth: ScanDepth, wait: bool) -> Result<(), TopologyError> {
        if wait {
            let previous = self.lock_in_flight()?.take();
            join_background(previous);
            let reports = self.scanner.rescan_all_hosts(depth)?;
            log_summary(&reports);
            return Ok(());
        }

        let mut slot = self.lock_in_flight()?;
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("background rescan still running, not starting another");
            return Ok(());
        }
        join_background(slot.take());

        let scanner = Arc::clone(&self.scanner);
        let handle = thread::Builder::new()
            .name("scsi-rescan".to_string())
            .spawn(move || match scanner.rescan_all_hosts(depth) {
                Ok(reports) => log_summary(&reports),
                Err(err) => warn!("background rescan failed: {}", err),
            })
            .map_err(|err| TopologyError::Rescan(format!("failed to start rescan thread: {err}")))?;
        *slot = Some(handle);
        Ok(())
    }

    fn lock_in_flight(&self) -> Result<MutexGuard<'_, Option<JoinHandle<()>>>, TopologyError> {
        self.in_flight
            .lock()
            .map_err(|_| TopologyError::Rescan("background rescan lock poisoned".to_string()))
    }
}

fn join_background(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        if handle.join().is_err() {
            warn!("background rescan thread panicked");
        }
    }
}

fn log_summary(reports: &[HostScanReport]) {
    let targets = reports
        .iter()
        .map(|report| report.targets.len())
        .sum::<usize>();
    let failed = reports
        .iter()
        .map(|report| report.failed_targets().len())
        .sum::<usize>();
    info!(
        "rescanned {} hosts, {} targets ({} failed)",
        reports.len(),
        targets,
        failed
    );
}

impl TopologyProvider for LinuxProvider {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn enumerate(&self) -> Result<TopologySnapshot, TopologyError> {
        let devices = self.bus.devices()?;
        let mut block_devices = Vec::new();
        let mut controllers = Vec::new();
        let mut paths_by_block_name: HashMap<String, (Hctl, PathState)> = HashMap::new();

        for device in devices {
            let peripheral_type = PeripheralType::from_code(device.peripheral_type);
            match (peripheral_type, device.block_name.clone()) {
                (PeripheralType::Disk, Some(block_name)) => {
                    paths_by_block_name
                        .insert(block_name.clone(), (device.hctl, path_state(&device)));
                    block_devices.push(self.scsi_device(device, &block_name, peripheral_type));
                }
                (PeripheralType::StorageController, _) => {
                    let Some(generic_name) = device.generic_name.clone() else {
                        debug!("controller {} has no generic device, skipping", device.hctl);
                        continue;
                    };
                    controllers.push(self.scsi_device(device, &generic_name, peripheral_type));
                }
                _ => {}
            }
        }

        let policies = self
            .policies
            .as_ref()
            .map(|source| source.policies())
            .unwrap_or_default();

        let mut multipath_devices = Vec::new();
        for map in self.bus.multipath_maps()? {
            if !map.is_multipath() {
                continue;
            }
            let paths = map
                .slaves
                .iter()
                .filter_map(|slave| {
                    paths_by_block_name
                        .get(slave)
                        .map(|(hctl, state)| MultipathPath {
                            hctl: *hctl,
                            path_id: slave.clone(),
                            state: *state,
                        })
                })
                .collect::<Vec<_>>();
            if paths.is_empty() {
                debug!("multipath map {} has no SCSI paths", map.name);
                continue;
            }
            let access_path = self.bus.device_node(&format!("mapper/{}", map.name));
            multipath_devices.push(MultipathDevice {
                display_name: access_path.display().to_string(),
                access_path,
                policy: policies.get(&map.name).copied().unwrap_or_default(),
                name: map.name,
                paths,
            });
        }

        Ok(TopologySnapshot::new(
            block_devices,
            controllers,
            multipath_devices,
        ))
    }

    fn initiate_rescan(&self, wait: bool) -> Result<(), TopologyError> {
        self.scan(ScanDepth::Full, wait)
    }

    fn retry_rescan(&self) -> Result<(), TopologyError> {
        self.scan(ScanDepth::Quick, false)
    }

    fn retry_rescan_and_wait(&self) -> Result<(), TopologyError> {
        self.scan(ScanDepth::Quick, true)
    }
}

impl LinuxProvider {
    fn scsi_device(
        &self,
        device: SysfsDevice,
        node_name: &str,
        peripheral_type: PeripheralType,
    ) -> ScsiDevice {
        let access_path = self.bus.device_node(node_name);
        let mut scsi_device = ScsiDevice::new(
            device.hctl,
            access_path.display().to_string(),
            access_path,
            peripheral_type,
        );
        scsi_device.generic_path = device
            .generic_name
            .as_deref()
            .map(|name| self.bus.device_node(name));
        scsi_device.attributes = device.attributes;
        scsi_device
    }
}

fn path_state(device: &SysfsDevice) -> PathState {
    match device.attributes.state.as_deref() {
        Some("running") => PathState::Up,
        _ => PathState::Down,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use super::{
        parse_multipath_table, parse_multipath_table_line, LinuxProvider, MultipathPolicySource,
    };
    use crate::command::testing::ScriptedExecutor;
    use crate::hctl::Hctl;
    use crate::model::{LoadBalancePolicy, PathState};
    use crate::platform::TopologyProvider;
    use crate::sysfs::testing::{write, FakeSysfsTree};

    struct FixedPolicies;

    impl MultipathPolicySource for FixedPolicies {
        fn policies(&self) -> HashMap<String, LoadBalancePolicy> {
            HashMap::from([("mpatha".to_string(), LoadBalancePolicy::RoundRobin)])
        }
    }

    #[test]
    fn parses_dmsetup_selectors() {
        let table = "\
mpatha: 0 2097152 multipath 1 queue_if_no_path 1 alua 1 1 round-robin 0 2 1 8:16 1 8:32 1
mpathb: 0 2097152 multipath 0 0 1 1 service-time 0 2 2 8:48 1 1 8:64 1 1
mpathc: 0 2097152 multipath 0 0 2 1 round-robin 0 1 1 8:80 1 round-robin 0 1 1 8:96 1
mpathd: 0 2097152 multipath 0 0 1 1 queue-length 0 1 1 8:112 1
mpathe: 0 2097152 multipath 0 0 1 1 historical-service-time 0 1 1 8:128 1
";
        let policies = parse_multipath_table(table);
        assert_eq!(policies["mpatha"], LoadBalancePolicy::RoundRobin);
        assert_eq!(policies["mpathb"], LoadBalancePolicy::WeightedPaths);
        assert_eq!(policies["mpathc"], LoadBalancePolicy::FailoverOnly);
        assert_eq!(policies["mpathd"], LoadBalancePolicy::LeastQueueDepth);
        assert_eq!(policies["mpathe"], LoadBalancePolicy::Unknown);
    }

    #[test]
    fn ignores_malformed_table_lines() {
        assert!(parse_multipath_table_line("No devices found").is_none());
        assert!(parse_multipath_table_line("vg-root: 0 1024 linear 8:2 2048").is_none());
        assert!(parse_multipath_table_line(
            "mpatha: 0 1024 multipath 0 0 1 1 round-robin 0 2 1 8:16"
        )
        .is_none());
    }

    #[test]
    fn enumerates_block_devices_controllers_and_multipath() {
        let tree = FakeSysfsTree::new();
        tree.add_lun(Hctl::new(0, 0, 0, 0), 0, Some("sda"), Some("sg0"));
        tree.add_lun(Hctl::new(1, 0, 0, 1), 0, Some("sdb"), Some("sg1"));
        let down = tree.add_lun(Hctl::new(2, 0, 0, 1), 0, Some("sdc"), Some("sg2"));
        write(&down.join("state"), "offline\n");
        tree.add_lun(Hctl::new(1, 0, 0, 0), 0x0c, None, Some("sg3"));
        tree.add_lun(Hctl::new(1, 0, 0, 5), 5, None, Some("sg4"));
        tree.add_multipath("dm-0", "mpatha", "mpath-3600a", &["sdb", "sdc"]);
        tree.add_multipath("dm-1", "vg-root", "LVM-xyz", &["sda"]);

        let provider = LinuxProvider::new(
            Arc::new(tree.sysfs()),
            Arc::new(ScriptedExecutor::default()),
        )
        .with_policy_source(Box::new(FixedPolicies));
        let snapshot = provider.enumerate().expect("enumerate");

        let block = snapshot
            .scsi_block_devices()
            .iter()
            .map(|device| device.hctl)
            .collect::<Vec<_>>();
        assert_eq!(
            block,
            vec![
                Hctl::new(0, 0, 0, 0),
                Hctl::new(1, 0, 0, 1),
                Hctl::new(2, 0, 0, 1)
            ]
        );
        let sda = &snapshot.scsi_block_devices()[0];
        assert_eq!(sda.access_path, tree.dev().join("sda"));
        assert_eq!(sda.generic_path, Some(tree.dev().join("sg0")));
        assert_eq!(sda.attributes.vendor.as_deref(), Some("NFINIDAT"));

        assert_eq!(snapshot.scsi_controllers().len(), 1);
        assert_eq!(snapshot.scsi_controllers()[0].hctl, Hctl::new(1, 0, 0, 0));

        let multipath = snapshot.multipath_devices();
        assert_eq!(multipath.len(), 1);
        assert_eq!(multipath[0].name, "mpatha");
        assert_eq!(multipath[0].access_path, tree.dev().join("mapper/mpatha"));
        assert_eq!(multipath[0].policy, LoadBalancePolicy::RoundRobin);
        let states = multipath[0]
            .paths
            .iter()
            .map(|path| (path.path_id.as_str(), path.state))
            .collect::<Vec<_>>();
        assert_eq!(states, vec![("sdb", PathState::Up), ("sdc", PathState::Down)]);

        let visible = snapshot
            .non_multipath_block_devices()
            .iter()
            .map(|device| device.hctl)
            .collect::<Vec<_>>();
        assert_eq!(visible, vec![Hctl::new(0, 0, 0, 0)]);
    }

    #[test]
    fn multipath_with_every_path_down_is_dropped() {
        let tree = FakeSysfsTree::new();
        let dir = tree.add_lun(Hctl::new(3, 0, 0, 1), 0, Some("sdd"), None);
        write(&dir.join("state"), "offline");
        tree.add_multipath("dm-2", "mpathz", "mpath-3600b", &["sdd"]);

        let provider = LinuxProvider::new(
            Arc::new(tree.sysfs()),
            Arc::new(ScriptedExecutor::default()),
        );
        let snapshot = provider.enumerate().expect("enumerate");
        assert!(snapshot.multipath_devices().is_empty());
        assert_eq!(snapshot.non_multipath_block_devices().len(), 1);
    }

    #[test]
    fn background_retry_rescan_completes() {
        let tree = FakeSysfsTree::new();
        let host = tree.add_host(0);
        let provider = LinuxProvider::new(
            Arc::new(tree.sysfs()),
            Arc::new(ScriptedExecutor::default()),
        );

        provider.retry_rescan().expect("retry");
        provider.retry_rescan().expect("second retry while first may be running");
        provider.initiate_rescan(true).expect("blocking rescan joins the background one");

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if std::fs::read_to_string(host.join("scan")).expect("scan") == "- - -" {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("host scan was never requested");
    }
}
