use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TopologyError;
use crate::process::ProcessSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlatformKind {
    #[default]
    Auto,
    Linux,
    Generic,
}

impl PlatformKind {
    /// Resolves `Auto` against the build target.
    pub fn resolve(self) -> PlatformKind {
        match self {
            PlatformKind::Auto if cfg!(target_os = "linux") => PlatformKind::Linux,
            PlatformKind::Auto => PlatformKind::Generic,
            other => other,
        }
    }
}

/// Where the platform rescan trigger runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum RescanIsolation {
    #[default]
    InProcess,
    /// A child process that performs the rescan; the retry variant gets an
    /// extra `--retry` argument.
    Subprocess(ProcessSpec),
}

/// How long `rescan_and_wait_for` keeps polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTimeout {
    Forever,
    Bounded(Duration),
}

impl WaitTimeout {
    /// Legacy callers pass seconds where zero meant "no limit".
    pub fn from_legacy_seconds(seconds: u64) -> Self {
        if seconds == 0 {
            WaitTimeout::Forever
        } else {
            WaitTimeout::Bounded(Duration::from_secs(seconds))
        }
    }

    pub fn is_exceeded(&self, elapsed: Duration) -> bool {
        match self {
            WaitTimeout::Forever => false,
            WaitTimeout::Bounded(limit) => elapsed >= *limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RescanOptions {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_wait_for_initial_rescan")]
    pub wait_for_initial_rescan: bool,
    #[serde(default)]
    pub isolation: RescanIsolation,
    #[serde(default = "default_rescan_process_timeout_ms")]
    pub rescan_process_timeout_ms: u64,
    #[serde(default = "default_terminate_timeout_ms")]
    pub terminate_timeout_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_wait_for_initial_rescan() -> bool {
    true
}

fn default_rescan_process_timeout_ms() -> u64 {
    120_000
}

fn default_terminate_timeout_ms() -> u64 {
    5_000
}

impl Default for RescanOptions {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            wait_for_initial_rescan: default_wait_for_initial_rescan(),
            isolation: RescanIsolation::InProcess,
            rescan_process_timeout_ms: default_rescan_process_timeout_ms(),
            terminate_timeout_ms: default_terminate_timeout_ms(),
        }
    }
}

impl RescanOptions {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn rescan_process_timeout(&self) -> Duration {
        Duration::from_millis(self.rescan_process_timeout_ms)
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), TopologyError> {
        if self.poll_interval_ms == 0 {
            return Err(TopologyError::Config(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.terminate_timeout_ms == 0 {
            return Err(TopologyError::Config(
                "terminate_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if let RescanIsolation::Subprocess(spec) = &self.isolation {
            if spec.program.trim().is_empty() {
                return Err(TopologyError::Config(
                    "subprocess isolation needs a program".to_string(),
                ));
            }
            if self.rescan_process_timeout_ms == 0 {
                return Err(TopologyError::Config(
                    "rescan_process_timeout_ms must be greater than zero".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default)]
    pub platform: PlatformKind,
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,
    #[serde(default = "default_dev_root")]
    pub dev_root: PathBuf,
    #[serde(default)]
    pub async_scan_populates_sysfs: bool,
    #[serde(default = "default_use_dmsetup")]
    pub use_dmsetup: bool,
    #[serde(default = "default_rescan_command")]
    pub rescan_command: Option<ProcessSpec>,
    /// JSON inventory consumed by the generic platform.
    #[serde(default)]
    pub inventory_path: Option<PathBuf>,
    #[serde(default)]
    pub rescan: RescanOptions,
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys")
}

fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

fn default_dev_root() -> PathBuf {
    PathBuf::from("/dev")
}

fn default_use_dmsetup() -> bool {
    true
}

fn default_rescan_command() -> Option<ProcessSpec> {
    if cfg!(any(target_os = "solaris", target_os = "illumos")) {
        Some(ProcessSpec::new("devfsadm", ["-c", "disk"]))
    } else if cfg!(target_os = "freebsd") {
        Some(ProcessSpec::new("camcontrol", ["rescan", "all"]))
    } else {
        None
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            platform: PlatformKind::Auto,
            sysfs_root: default_sysfs_root(),
            proc_root: default_proc_root(),
            dev_root: default_dev_root(),
            async_scan_populates_sysfs: false,
            use_dmsetup: default_use_dmsetup(),
            rescan_command: default_rescan_command(),
            inventory_path: None,
            rescan: RescanOptions::default(),
        }
    }
}

impl TopologyConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TopologyError> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|err| TopologyError::io(path, err))?;
        let config: TopologyConfig = serde_json::from_str(&data).map_err(|err| {
            TopologyError::Config(format!("failed to parse {}: {err}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TopologyError> {
        self.rescan.validate()?;
        if let Some(spec) = &self.rescan_command {
            if spec.program.trim().is_empty() {
                return Err(TopologyError::Config(
                    "rescan_command needs a program".to_string(),
                ));
            }
        }
        Ok(())
    }
}
