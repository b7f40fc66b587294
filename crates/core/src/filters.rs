use std::collections::HashSet;

use tracing::debug;

use crate::command::ScsiExecutor;
use crate::hctl::Hctl;
use crate::model::{MultipathDevice, ScsiDevice};

pub const UNKNOWN_VENDOR: &str = "<unknown>";

/// SCSI devices that are not a path of any multipath device.
pub fn filter_non_multipath_scsi_block_devices(
    scsi_devices: &[ScsiDevice],
    multipath_devices: &[MultipathDevice],
) -> Vec<ScsiDevice> {
    let claimed = multipath_path_hctls(multipath_devices);
    scsi_devices
        .iter()
        .filter(|device| !claimed.contains(&device.hctl))
        .cloned()
        .collect()
}

pub fn multipath_path_hctls(multipath_devices: &[MultipathDevice]) -> HashSet<Hctl> {
    multipath_devices
        .iter()
        .flat_map(|device| device.paths.iter().map(|path| path.hctl))
        .collect()
}

/// Devices whose right-trimmed standard-inquiry vendor and product ids equal
/// `vendor_product`. A device whose inquiry fails counts as
/// `("<unknown>", "<unknown>")`.
pub fn filter_vendor_specific(
    devices: &[ScsiDevice],
    vendor_product: (&str, &str),
    executor: &dyn ScsiExecutor,
) -> Vec<ScsiDevice> {
    let (vendor, product) = vendor_product;
    devices
        .iter()
        .filter(|device| {
            let (device_vendor, device_product) = vendor_product_of(device, executor);
            device_vendor == vendor && device_product == product
        })
        .cloned()
        .collect()
}

pub fn vendor_product_of(device: &ScsiDevice, executor: &dyn ScsiExecutor) -> (String, String) {
    match device.inquiry(executor) {
        Ok(inquiry) => (
            inquiry.trimmed_vendor().to_string(),
            inquiry.trimmed_product().to_string(),
        ),
        Err(err) => {
            debug!(
                "vendor probe failed for {} ({}): {}",
                device.display_name, device.hctl, err
            );
            (UNKNOWN_VENDOR.to_string(), UNKNOWN_VENDOR.to_string())
        }
    }
}
