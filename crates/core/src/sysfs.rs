use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::TopologyError;
use crate::hctl::{Hctl, TargetAddress};
use crate::model::DeviceAttributes;

/// Kernel view of one SCSI device as exposed under `class/scsi_device`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysfsDevice {
    pub hctl: Hctl,
    pub peripheral_type: u8,
    pub block_name: Option<String>,
    pub generic_name: Option<String>,
    pub attributes: DeviceAttributes,
}

/// A device-mapper map and the block devices beneath it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmMap {
    pub dm_name: String,
    pub name: String,
    pub uuid: String,
    pub slaves: Vec<String>,
}

impl DmMap {
    pub fn is_multipath(&self) -> bool {
        self.uuid.starts_with("mpath-")
    }
}

/// Bus-level operations the Linux rescanner and enumerator need. [`Sysfs`]
/// is the real implementation; tests substitute in-memory buses.
pub trait ScsiBus: Send + Sync {
    fn hosts(&self) -> Result<Vec<u32>, TopologyError>;
    fn channels(&self, host: u32) -> Result<Vec<u32>, TopologyError>;
    fn targets(&self, host: u32, channel: u32) -> Result<Vec<u32>, TopologyError>;
    fn luns(&self, target: TargetAddress) -> Result<Vec<u64>, TopologyError>;
    fn generic_device(&self, hctl: Hctl) -> Result<Option<PathBuf>, TopologyError>;
    /// Host-wide scan (`"- - -"` into the host's `scan` control).
    fn scan_host(&self, host: u32) -> Result<(), TopologyError>;
    fn add_device(&self, hctl: Hctl) -> Result<(), TopologyError>;
    fn remove_device(&self, hctl: Hctl) -> Result<(), TopologyError>;
    fn devices(&self) -> Result<Vec<SysfsDevice>, TopologyError>;
    fn multipath_maps(&self) -> Result<Vec<DmMap>, TopologyError>;

    /// Device node for a kernel device name such as `sda` or `mapper/mpatha`.
    fn device_node(&self, name: &str) -> PathBuf {
        Path::new("/dev").join(name)
    }
}

#[derive(Debug, Clone)]
pub struct Sysfs {
    sysfs_root: PathBuf,
    proc_root: PathBuf,
    dev_root: PathBuf,
}

impl Default for Sysfs {
    fn default() -> Self {
        Self::new("/sys", "/proc", "/dev")
    }
}

impl Sysfs {
    pub fn new(
        sysfs_root: impl Into<PathBuf>,
        proc_root: impl Into<PathBuf>,
        dev_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            proc_root: proc_root.into(),
            dev_root: dev_root.into(),
        }
    }

    pub fn dev_path(&self, name: &str) -> PathBuf {
        self.dev_root.join(name)
    }

    fn scsi_host_dir(&self, host: u32) -> PathBuf {
        self.sysfs_root
            .join("class/scsi_host")
            .join(format!("host{host}"))
    }

    fn scsi_device_dir(&self, hctl: Hctl) -> PathBuf {
        self.sysfs_root
            .join("class/scsi_device")
            .join(hctl.to_string())
            .join("device")
    }

    fn target_addresses(&self, host: u32) -> Result<BTreeSet<TargetAddress>, TopologyError> {
        let names = list_dir(&self.sysfs_root.join("bus/scsi/devices"))?;
        Ok(names
            .iter()
            .filter_map(|name| parse_target_name(name))
            .filter(|target| target.host == host)
            .collect())
    }

    fn read_device(&self, hctl: Hctl) -> Result<SysfsDevice, TopologyError> {
        let dir = self.scsi_device_dir(hctl);
        let peripheral_type = read_attribute(&dir.join("type"))?
            .and_then(|value| value.parse::<u8>().ok())
            .unwrap_or(0x1f);
        let block_name = linked_child(&dir, "block")?;
        let generic_name = linked_child(&dir, "scsi_generic")?;
        let size_bytes = match &block_name {
            Some(name) => read_attribute(&self.sysfs_root.join("block").join(name).join("size"))?
                .and_then(|sectors| sectors.parse::<u64>().ok())
                .map(|sectors| sectors.saturating_mul(512)),
            None => None,
        };

        Ok(SysfsDevice {
            hctl,
            peripheral_type,
            block_name,
            generic_name,
            attributes: DeviceAttributes {
                vendor: read_attribute(&dir.join("vendor"))?,
                model: read_attribute(&dir.join("model"))?,
                revision: read_attribute(&dir.join("rev"))?,
                size_bytes,
                state: read_attribute(&dir.join("state"))?,
            },
        })
    }
}

impl ScsiBus for Sysfs {
    fn hosts(&self) -> Result<Vec<u32>, TopologyError> {
        let names = list_dir(&self.sysfs_root.join("class/scsi_host"))?;
        let mut hosts = names
            .iter()
            .filter_map(|name| name.strip_prefix("host")?.parse::<u32>().ok())
            .collect::<Vec<_>>();
        hosts.sort_unstable();
        Ok(hosts)
    }

    fn channels(&self, host: u32) -> Result<Vec<u32>, TopologyError> {
        let channels = self
            .target_addresses(host)?
            .into_iter()
            .map(|target| target.channel)
            .collect::<BTreeSet<_>>();
        Ok(channels.into_iter().collect())
    }

    fn targets(&self, host: u32, channel: u32) -> Result<Vec<u32>, TopologyError> {
        Ok(self
            .target_addresses(host)?
            .into_iter()
            .filter(|target| target.channel == channel)
            .map(|target| target.target)
            .collect())
    }

    fn luns(&self, target: TargetAddress) -> Result<Vec<u64>, TopologyError> {
        let names = list_dir(&self.sysfs_root.join("class/scsi_device"))?;
        let luns = names
            .iter()
            .filter_map(|name| name.parse::<Hctl>().ok())
            .filter(|hctl| hctl.target_address() == target)
            .map(|hctl| hctl.lun)
            .collect::<BTreeSet<_>>();
        Ok(luns.into_iter().collect())
    }

    fn generic_device(&self, hctl: Hctl) -> Result<Option<PathBuf>, TopologyError> {
        let dir = self.scsi_device_dir(hctl);
        if !dir.exists() {
            return Ok(None);
        }
        Ok(linked_child(&dir, "scsi_generic")?.map(|name| self.dev_path(&name)))
    }

    fn scan_host(&self, host: u32) -> Result<(), TopologyError> {
        let path = self.scsi_host_dir(host).join("scan");
        debug!("requesting host-wide scan through {}", path.display());
        write_control(&path, "- - -")
    }

    fn add_device(&self, hctl: Hctl) -> Result<(), TopologyError> {
        let proc_scsi = self.proc_root.join("scsi/scsi");
        if proc_scsi.exists() {
            debug!("add-single-device {} through {}", hctl, proc_scsi.display());
            return write_control(
                &proc_scsi,
                &format!(
                    "scsi add-single-device {} {} {} {}",
                    hctl.host, hctl.channel, hctl.target, hctl.lun
                ),
            );
        }
        let scan = self.scsi_host_dir(hctl.host).join("scan");
        debug!("targeted scan of {} through {}", hctl, scan.display());
        write_control(
            &scan,
            &format!("{} {} {}", hctl.channel, hctl.target, hctl.lun),
        )
    }

    fn remove_device(&self, hctl: Hctl) -> Result<(), TopologyError> {
        let path = self.scsi_device_dir(hctl).join("delete");
        debug!("deleting {} through {}", hctl, path.display());
        write_control(&path, "1")
    }

    fn devices(&self) -> Result<Vec<SysfsDevice>, TopologyError> {
        let names = list_dir(&self.sysfs_root.join("class/scsi_device"))?;
        let mut addresses = names
            .iter()
            .filter_map(|name| name.parse::<Hctl>().ok())
            .collect::<Vec<_>>();
        addresses.sort();

        let mut devices = Vec::with_capacity(addresses.len());
        for hctl in addresses {
            match self.read_device(hctl) {
                Ok(device) => devices.push(device),
                // Devices disappear while we walk; skip the ones that vanished.
                Err(TopologyError::Io { source, .. })
                    if source.kind() == io::ErrorKind::NotFound =>
                {
                    debug!("{} disappeared during enumeration", hctl)
                }
                Err(err) => return Err(err),
            }
        }
        Ok(devices)
    }

    fn multipath_maps(&self) -> Result<Vec<DmMap>, TopologyError> {
        let block_root = self.sysfs_root.join("block");
        let names = list_dir(&block_root)?;
        let mut maps = Vec::new();
        for dm_name in names.into_iter().filter(|name| name.starts_with("dm-")) {
            let dir = block_root.join(&dm_name);
            let Some(uuid) = read_attribute(&dir.join("dm/uuid"))? else {
                continue;
            };
            let name = read_attribute(&dir.join("dm/name"))?.unwrap_or_else(|| dm_name.clone());
            let mut slaves = list_dir(&dir.join("slaves"))?;
            slaves.sort();
            maps.push(DmMap {
                dm_name,
                name,
                uuid,
                slaves,
            });
        }
        maps.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(maps)
    }

    fn device_node(&self, name: &str) -> PathBuf {
        self.dev_path(name)
    }
}

pub fn parse_target_name(name: &str) -> Option<TargetAddress> {
    let mut parts = name.strip_prefix("target")?.split(':');
    let host = parts.next()?.parse().ok()?;
    let channel = parts.next()?.parse().ok()?;
    let target = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(TargetAddress::new(host, channel, target))
}

fn list_dir(path: &Path) -> Result<Vec<String>, TopologyError> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(TopologyError::io(path, err)),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| TopologyError::io(path, err))?;
        names.push(entry.file_name().to_string_lossy().to_string());
    }
    Ok(names)
}

fn read_attribute(path: &Path) -> Result<Option<String>, TopologyError> {
    match fs::read_to_string(path) {
        Ok(value) => {
            let value = value.trim();
            Ok((!value.is_empty()).then(|| value.to_string()))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(TopologyError::io(path, err)),
    }
}

/// Name of the child node a device links to under `kind`, handling both the
/// `kind/<name>` directory layout and the older `kind:<name>` link layout.
fn linked_child(device_dir: &Path, kind: &str) -> Result<Option<String>, TopologyError> {
    let nested = list_dir(&device_dir.join(kind))?;
    if let Some(name) = nested.into_iter().min() {
        return Ok(Some(name));
    }
    let prefix = format!("{kind}:");
    Ok(list_dir(device_dir)?
        .into_iter()
        .filter_map(|name| name.strip_prefix(&prefix).map(str::to_string))
        .min())
}

fn write_control(path: &Path, payload: &str) -> Result<(), TopologyError> {
    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|err| TopologyError::io(path, err))?;
    file.write_all(payload.as_bytes())
        .map_err(|err| TopologyError::io(path, err))
}
