use std::fs;
use std::sync::Arc;

use tracing::info;

use crate::command::ScsiExecutor;
use crate::config::{PlatformKind, TopologyConfig};
use crate::error::TopologyError;
use crate::generic::{GenericProvider, StaticInventory};
use crate::linux::{DmsetupPolicies, LinuxProvider};
use crate::model::TopologySnapshot;
use crate::sysfs::Sysfs;

/// The per-platform capability set the coordinator drives.
pub trait TopologyProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Builds a fresh snapshot. Never returns a cached one.
    fn enumerate(&self) -> Result<TopologySnapshot, TopologyError>;

    /// Full rescan. With `wait` the call returns once the OS-level rescan
    /// completed (or its own deadline expired).
    fn initiate_rescan(&self, wait: bool) -> Result<(), TopologyError>;

    /// Cheaper rescan used between poll iterations; does not wait for the OS.
    fn retry_rescan(&self) -> Result<(), TopologyError>;

    /// The retry rescan run to completion, for isolated worker processes
    /// that exit as soon as the call returns.
    fn retry_rescan_and_wait(&self) -> Result<(), TopologyError> {
        self.initiate_rescan(true)
    }
}

pub fn build_provider(
    config: &TopologyConfig,
    executor: Arc<dyn ScsiExecutor>,
) -> Result<Arc<dyn TopologyProvider>, TopologyError> {
    config.validate()?;
    let platform = config.platform.resolve();
    info!("using {:?} topology provider", platform);

    match platform {
        PlatformKind::Linux => {
            let bus = Arc::new(Sysfs::new(
                &config.sysfs_root,
                &config.proc_root,
                &config.dev_root,
            ));
            let mut provider = LinuxProvider::new(bus, executor)
                .with_async_scan(config.async_scan_populates_sysfs);
            if config.use_dmsetup {
                provider = provider.with_policy_source(Box::new(DmsetupPolicies));
            }
            Ok(Arc::new(provider))
        }
        PlatformKind::Generic | PlatformKind::Auto => {
            let inventory = match &config.inventory_path {
                Some(path) => {
                    let data =
                        fs::read_to_string(path).map_err(|err| TopologyError::io(path, err))?;
                    serde_json::from_str::<StaticInventory>(&data).map_err(|err| {
                        TopologyError::Config(format!(
                            "failed to parse inventory {}: {err}",
                            path.display()
                        ))
                    })?
                }
                None => StaticInventory::default(),
            };
            let provider = GenericProvider::new(Arc::new(inventory))
                .with_rescan_command(config.rescan_command.clone())
                .with_timeouts(
                    config.rescan.rescan_process_timeout(),
                    config.rescan.terminate_timeout(),
                );
            Ok(Arc::new(provider))
        }
    }
}
