use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::command::{self, is_lun_online, ScsiExecutor, SelectReport};
use crate::error::TopologyError;
use crate::hctl::TargetAddress;
use crate::sysfs::ScsiBus;

/// `Full` re-probes LUNs that are already present; `Quick` only reconciles
/// set membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScanDepth {
    #[default]
    Full,
    Quick,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LunDiff {
    pub missing: BTreeSet<u64>,
    pub unmapped: BTreeSet<u64>,
    pub existing: BTreeSet<u64>,
}

impl LunDiff {
    pub fn compute(expected: &BTreeSet<u64>, actual: &BTreeSet<u64>) -> Self {
        Self {
            missing: expected.difference(actual).copied().collect(),
            unmapped: actual.difference(expected).copied().collect(),
            existing: actual.intersection(expected).copied().collect(),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.missing.is_empty() && self.unmapped.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSkipReason {
    /// LUNs are present but the target reports none.
    TargetRemoved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LunProbe {
    pub lun: u64,
    pub online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetScanReport {
    pub target: TargetAddress,
    pub expected: BTreeSet<u64>,
    pub actual: BTreeSet<u64>,
    pub diff: LunDiff,
    pub added: Vec<u64>,
    pub add_failures: Vec<u64>,
    pub host_scan_requested: bool,
    pub removed: Vec<u64>,
    pub removal_failures: Vec<u64>,
    pub reprobed: Vec<LunProbe>,
    pub skipped: Option<TargetSkipReason>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum TargetOutcome {
    Scanned(TargetScanReport),
    Failed { target: TargetAddress, error: String },
}

impl TargetOutcome {
    pub fn target(&self) -> TargetAddress {
        match self {
            TargetOutcome::Scanned(report) => report.target,
            TargetOutcome::Failed { target, .. } => *target,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostScanReport {
    pub host: u32,
    pub host_scan_triggered: bool,
    pub targets: Vec<TargetOutcome>,
    pub error: Option<String>,
}

impl HostScanReport {
    fn new(host: u32) -> Self {
        Self {
            host,
            host_scan_triggered: false,
            targets: Vec::new(),
            error: None,
        }
    }

    pub fn failed_targets(&self) -> Vec<TargetAddress> {
        self.targets
            .iter()
            .filter(|outcome| matches!(outcome, TargetOutcome::Failed { .. }))
            .map(TargetOutcome::target)
            .collect()
    }
}

/// Target-level reconciliation of the Linux SCSI midlayer against what each
/// target reports through REPORT LUNS.
pub struct LinuxBusScanner {
    bus: Arc<dyn ScsiBus>,
    executor: Arc<dyn ScsiExecutor>,
    async_scan_populates_sysfs: bool,
}

impl LinuxBusScanner {
    pub fn new(bus: Arc<dyn ScsiBus>, executor: Arc<dyn ScsiExecutor>) -> Self {
        Self {
            bus,
            executor,
            async_scan_populates_sysfs: false,
        }
    }

    /// When the kernel populates sysfs asynchronously after a host scan,
    /// missing LUNs are requested with one host-wide scan instead of one
    /// add-single-device per LUN.
    pub fn with_async_scan(mut self, async_scan_populates_sysfs: bool) -> Self {
        self.async_scan_populates_sysfs = async_scan_populates_sysfs;
        self
    }

    pub fn rescan_all_hosts(&self, depth: ScanDepth) -> Result<Vec<HostScanReport>, TopologyError> {
        let hosts = self.bus.hosts()?;
        Ok(self.rescan_hosts(&hosts, depth))
    }

    pub fn rescan_hosts(&self, hosts: &[u32], depth: ScanDepth) -> Vec<HostScanReport> {
        hosts
            .iter()
            .map(|host| self.rescan_host(*host, depth))
            .collect()
    }

    /// Never fails: per-target errors are logged and recorded in the report,
    /// and scanning moves on to the next target.
    pub fn rescan_host(&self, host: u32, depth: ScanDepth) -> HostScanReport {
        info!("rescanning SCSI host {} ({:?})", host, depth);
        let mut report = HostScanReport::new(host);

        let channels = match self.channels_or_scan(host, &mut report) {
            Ok(channels) => channels,
            Err(err) => {
                warn!("failed to enumerate channels of host {}: {}", host, err);
                report.error = Some(err.to_string());
                return report;
            }
        };

        for channel in channels {
            let targets = match self.bus.targets(host, channel) {
                Ok(targets) => targets,
                Err(err) => {
                    warn!(
                        "failed to enumerate targets of host {} channel {}: {}",
                        host, channel, err
                    );
                    continue;
                }
            };

            for target in targets {
                let address = TargetAddress::new(host, channel, target);
                match self.target_scan(address, depth) {
                    Ok(target_report) => report.targets.push(TargetOutcome::Scanned(target_report)),
                    Err(err) => {
                        warn!("scan of target {} failed: {}", address, err);
                        report.targets.push(TargetOutcome::Failed {
                            target: address,
                            error: err.to_string(),
                        });
                    }
                }
            }
        }

        report
    }

    fn channels_or_scan(
        &self,
        host: u32,
        report: &mut HostScanReport,
    ) -> Result<Vec<u32>, TopologyError> {
        let channels = self.bus.channels(host)?;
        if !channels.is_empty() {
            return Ok(channels);
        }
        debug!("host {} exposes no channels yet, triggering a host scan", host);
        self.bus.scan_host(host)?;
        report.host_scan_triggered = true;
        self.bus.channels(host)
    }

    pub fn target_scan(
        &self,
        target: TargetAddress,
        depth: ScanDepth,
    ) -> Result<TargetScanReport, TopologyError> {
        let expected = self.report_luns(target)?;
        let actual = self.bus.luns(target)?.into_iter().collect::<BTreeSet<_>>();
        let diff = LunDiff::compute(&expected, &actual);
        debug!(
            "target {}: expected {:?} actual {:?} missing {:?} unmapped {:?}",
            target, expected, actual, diff.missing, diff.unmapped
        );

        let mut report = TargetScanReport {
            target,
            expected: expected.clone(),
            actual: actual.clone(),
            diff: diff.clone(),
            added: Vec::new(),
            add_failures: Vec::new(),
            host_scan_requested: false,
            removed: Vec::new(),
            removal_failures: Vec::new(),
            reprobed: Vec::new(),
            skipped: None,
        };

        // Known gap: a target that vanished as a whole keeps its stale
        // devices; only individually unmapped LUNs are removed.
        if !actual.is_empty() && expected.is_empty() {
            info!(
                "target {} reports no LUNs while {} are present; leaving them in place",
                target,
                actual.len()
            );
            report.skipped = Some(TargetSkipReason::TargetRemoved);
            return Ok(report);
        }

        if !diff.missing.is_empty() {
            if self.async_scan_populates_sysfs {
                self.bus.scan_host(target.host)?;
                report.host_scan_requested = true;
            } else {
                for lun in &diff.missing {
                    let hctl = target.lun(*lun);
                    match self.bus.add_device(hctl) {
                        Ok(()) => report.added.push(*lun),
                        Err(err) => {
                            warn!("failed to add mapped device {}: {}", hctl, err);
                            report.add_failures.push(*lun);
                        }
                    }
                }
            }
        }

        for lun in &diff.unmapped {
            let hctl = target.lun(*lun);
            match self.bus.remove_device(hctl) {
                Ok(()) => report.removed.push(*lun),
                Err(err) => {
                    warn!("failed to remove unmapped device {}: {}", hctl, err);
                    report.removal_failures.push(*lun);
                }
            }
        }

        if depth == ScanDepth::Full {
            for lun in &diff.existing {
                let hctl = target.lun(*lun);
                let generic = self.bus.generic_device(hctl)?;
                let online = is_lun_online(self.executor.as_ref(), generic.as_deref());
                debug!("re-probed {}: online={}", hctl, online);
                report.reprobed.push(LunProbe { lun: *lun, online });
            }
        }

        Ok(report)
    }

    /// LUNs the target reports through REPORT LUNS on LUN 0, or none when
    /// LUN 0 is not online.
    pub fn report_luns(&self, target: TargetAddress) -> Result<BTreeSet<u64>, TopologyError> {
        let lun0 = target.lun(0);
        let generic = self.bus.generic_device(lun0)?;
        let device = match generic {
            Some(device) if is_lun_online(self.executor.as_ref(), Some(&device)) => device,
            _ => {
                debug!("LUN 0 of target {} is not online, skipping REPORT LUNS", target);
                return Ok(BTreeSet::new());
            }
        };
        let luns = command::report_luns(self.executor.as_ref(), &device, SelectReport::AllLuns)?;
        Ok(luns.into_iter().collect())
    }
}
