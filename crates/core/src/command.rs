use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ScsiError;

/// Allocation length tried first for STANDARD INQUIRY.
pub const INQUIRY_FIXED_ALLOCATION_LENGTH: u16 = 254;
/// Enough for the vendor/product/revision fields and the additional length.
pub const INQUIRY_MINIMAL_ALLOCATION_LENGTH: u16 = 36;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectReport {
    AllLuns,
    WellKnownLuns,
}

impl SelectReport {
    pub fn code(self) -> u8 {
        match self {
            SelectReport::AllLuns => 0,
            SelectReport::WellKnownLuns => 1,
        }
    }
}

/// Command descriptors understood by a [`ScsiExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScsiCommand {
    StandardInquiry { allocation_length: u16 },
    UnitSerialNumber,
    ReportLuns { select_report: SelectReport },
    TestUnitReady,
    ReadCapacity10,
    ReadCapacity16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InquiryData {
    pub peripheral_qualifier: u8,
    pub peripheral_device_type: u8,
    pub additional_length: u8,
    pub vendor_id: String,
    pub product_id: String,
    pub revision: String,
}

impl InquiryData {
    pub fn trimmed_vendor(&self) -> &str {
        trim_padding(&self.vendor_id)
    }

    pub fn trimmed_product(&self) -> &str {
        trim_padding(&self.product_id)
    }

    pub fn trimmed_revision(&self) -> &str {
        trim_padding(&self.revision)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityData {
    pub last_lba: u64,
    pub block_length: u32,
}

impl CapacityData {
    pub fn capacity_bytes(&self) -> u64 {
        self.last_lba
            .saturating_add(1)
            .saturating_mul(u64::from(self.block_length))
    }
}

/// Decoded responses, one variant per [`ScsiCommand`] family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScsiResponse {
    Inquiry(InquiryData),
    UnitSerialNumber(String),
    ReportLuns(Vec<u64>),
    Ready,
    Capacity(CapacityData),
}

/// Executes one command against one device handle (a SCSI generic or block
/// special file) and returns the decoded response or a sense-based error.
pub trait ScsiExecutor: Send + Sync {
    fn execute(&self, device: &Path, command: &ScsiCommand) -> Result<ScsiResponse, ScsiError>;
}

/// STANDARD INQUIRY with allocation-length negotiation: a large fixed length
/// first, then the minimal 36-byte request followed by an extended request
/// sized from the reported additional length.
pub fn standard_inquiry(
    executor: &dyn ScsiExecutor,
    device: &Path,
) -> Result<InquiryData, ScsiError> {
    let fixed = executor.execute(
        device,
        &ScsiCommand::StandardInquiry {
            allocation_length: INQUIRY_FIXED_ALLOCATION_LENGTH,
        },
    );
    match fixed {
        Err(ScsiError::IllegalRequestInvalidField) => {}
        other => return expect_inquiry(other),
    }

    debug!(
        "{} rejected a {}-byte inquiry, retrying with the two-step probe",
        device.display(),
        INQUIRY_FIXED_ALLOCATION_LENGTH
    );
    let minimal = expect_inquiry(executor.execute(
        device,
        &ScsiCommand::StandardInquiry {
            allocation_length: INQUIRY_MINIMAL_ALLOCATION_LENGTH,
        },
    ))?;

    let extended_length = 5 + u16::from(minimal.additional_length);
    if extended_length <= INQUIRY_MINIMAL_ALLOCATION_LENGTH {
        return Ok(minimal);
    }

    match expect_inquiry(executor.execute(
        device,
        &ScsiCommand::StandardInquiry {
            allocation_length: extended_length,
        },
    )) {
        Err(ScsiError::IllegalRequestInvalidField) => Ok(minimal),
        other => other,
    }
}

pub fn unit_serial_number(
    executor: &dyn ScsiExecutor,
    device: &Path,
) -> Result<String, ScsiError> {
    match executor.execute(device, &ScsiCommand::UnitSerialNumber)? {
        ScsiResponse::UnitSerialNumber(serial) => Ok(serial.trim().to_string()),
        other => Err(unexpected("UNIT SERIAL NUMBER", &other)),
    }
}

pub fn report_luns(
    executor: &dyn ScsiExecutor,
    device: &Path,
    select_report: SelectReport,
) -> Result<Vec<u64>, ScsiError> {
    match executor.execute(device, &ScsiCommand::ReportLuns { select_report })? {
        ScsiResponse::ReportLuns(luns) => Ok(luns),
        other => Err(unexpected("REPORT LUNS", &other)),
    }
}

pub fn test_unit_ready(executor: &dyn ScsiExecutor, device: &Path) -> Result<(), ScsiError> {
    match executor.execute(device, &ScsiCommand::TestUnitReady)? {
        ScsiResponse::Ready => Ok(()),
        other => Err(unexpected("TEST UNIT READY", &other)),
    }
}

/// READ CAPACITY (16), falling back to (10) for devices that reject it.
pub fn read_capacity(
    executor: &dyn ScsiExecutor,
    device: &Path,
) -> Result<CapacityData, ScsiError> {
    let response = match executor.execute(device, &ScsiCommand::ReadCapacity16) {
        Err(ScsiError::IllegalRequestInvalidField) => {
            debug!("{} has no READ CAPACITY (16)", device.display());
            executor.execute(device, &ScsiCommand::ReadCapacity10)?
        }
        other => other?,
    };
    match response {
        ScsiResponse::Capacity(capacity) => Ok(capacity),
        other => Err(unexpected("READ CAPACITY", &other)),
    }
}

/// A LUN is online when its SCSI generic device exists, answers TEST UNIT
/// READY, and reports peripheral qualifier 0 in its standard inquiry.
pub fn is_lun_online(executor: &dyn ScsiExecutor, generic_device: Option<&Path>) -> bool {
    let Some(device) = generic_device else {
        return false;
    };
    if let Err(err) = test_unit_ready(executor, device) {
        debug!("{} failed TEST UNIT READY: {}", device.display(), err);
        return false;
    }
    match standard_inquiry(executor, device) {
        Ok(inquiry) => inquiry.peripheral_qualifier == 0,
        Err(err) => {
            debug!("{} failed STANDARD INQUIRY: {}", device.display(), err);
            false
        }
    }
}

/// Right-trims the space and NUL padding SCSI uses in ASCII fields.
pub fn trim_padding(value: &str) -> &str {
    value.trim_end_matches([' ', '\0'])
}

fn expect_inquiry(response: Result<ScsiResponse, ScsiError>) -> Result<InquiryData, ScsiError> {
    match response? {
        ScsiResponse::Inquiry(inquiry) => Ok(inquiry),
        other => Err(unexpected("STANDARD INQUIRY", &other)),
    }
}

fn unexpected(command: &str, response: &ScsiResponse) -> ScsiError {
    ScsiError::DeviceIo(format!("unexpected response to {command}: {response:?}"))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use super::{InquiryData, ScsiCommand, ScsiExecutor, ScsiResponse};
    use crate::error::ScsiError;

    pub fn inquiry(qualifier: u8, vendor: &str, product: &str) -> InquiryData {
        InquiryData {
            peripheral_qualifier: qualifier,
            peripheral_device_type: 0,
            additional_length: 31,
            vendor_id: format!("{vendor:<8}"),
            product_id: format!("{product:<16}"),
            revision: "0001".to_string(),
        }
    }

    /// Scripted executor: answers per (device, command) with a fixed
    /// response, and records every call.
    #[derive(Default)]
    pub struct ScriptedExecutor {
        responses: HashMap<(PathBuf, String), Result<ScsiResponse, ScsiError>>,
        pub calls: Mutex<Vec<(PathBuf, ScsiCommand)>>,
    }

    impl ScriptedExecutor {
        pub fn on(
            mut self,
            device: &str,
            command: ScsiCommand,
            response: Result<ScsiResponse, ScsiError>,
        ) -> Self {
            self.responses
                .insert((PathBuf::from(device), key(&command)), response);
            self
        }

        /// Scripts TEST UNIT READY + STANDARD INQUIRY for an online LUN.
        pub fn online(self, device: &str) -> Self {
            self.on(device, ScsiCommand::TestUnitReady, Ok(ScsiResponse::Ready))
                .on(
                    device,
                    ScsiCommand::StandardInquiry {
                        allocation_length: super::INQUIRY_FIXED_ALLOCATION_LENGTH,
                    },
                    Ok(ScsiResponse::Inquiry(inquiry(0, "VENDOR", "PRODUCT"))),
                )
        }

        pub fn call_count(&self, command: &ScsiCommand) -> usize {
            self.calls
                .lock()
                .expect("calls lock")
                .iter()
                .filter(|(_, recorded)| recorded == command)
                .count()
        }
    }

    impl ScsiExecutor for ScriptedExecutor {
        fn execute(
            &self,
            device: &Path,
            command: &ScsiCommand,
        ) -> Result<ScsiResponse, ScsiError> {
            self.calls
                .lock()
                .expect("calls lock")
                .push((device.to_path_buf(), command.clone()));
            self.responses
                .get(&(device.to_path_buf(), key(command)))
                .cloned()
                .unwrap_or_else(|| Err(ScsiError::DeviceIo("no such device".to_string())))
        }
    }

    fn key(command: &ScsiCommand) -> String {
        format!("{command:?}")
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::testing::{inquiry, ScriptedExecutor};
    use super::{
        is_lun_online, read_capacity, standard_inquiry, trim_padding, CapacityData, ScsiCommand,
        ScsiResponse, INQUIRY_FIXED_ALLOCATION_LENGTH, INQUIRY_MINIMAL_ALLOCATION_LENGTH,
    };
    use crate::error::ScsiError;

    #[test]
    fn inquiry_falls_back_to_two_step_probe() {
        let mut short = inquiry(0, "ACME", "ARRAY");
        short.additional_length = 91;
        let executor = ScriptedExecutor::default()
            .on(
                "/dev/sg0",
                ScsiCommand::StandardInquiry {
                    allocation_length: INQUIRY_FIXED_ALLOCATION_LENGTH,
                },
                Err(ScsiError::IllegalRequestInvalidField),
            )
            .on(
                "/dev/sg0",
                ScsiCommand::StandardInquiry {
                    allocation_length: INQUIRY_MINIMAL_ALLOCATION_LENGTH,
                },
                Ok(ScsiResponse::Inquiry(short.clone())),
            )
            .on(
                "/dev/sg0",
                ScsiCommand::StandardInquiry {
                    allocation_length: 96,
                },
                Ok(ScsiResponse::Inquiry(inquiry(0, "ACME", "ARRAY-EXT"))),
            );

        let data = standard_inquiry(&executor, Path::new("/dev/sg0")).expect("inquiry");
        assert_eq!(data.trimmed_product(), "ARRAY-EXT");
        assert_eq!(executor.calls.lock().expect("calls").len(), 3);
    }

    #[test]
    fn inquiry_keeps_minimal_answer_when_extension_is_rejected() {
        let mut short = inquiry(0, "ACME", "ARRAY");
        short.additional_length = 91;
        let executor = ScriptedExecutor::default()
            .on(
                "/dev/sg0",
                ScsiCommand::StandardInquiry {
                    allocation_length: INQUIRY_FIXED_ALLOCATION_LENGTH,
                },
                Err(ScsiError::IllegalRequestInvalidField),
            )
            .on(
                "/dev/sg0",
                ScsiCommand::StandardInquiry {
                    allocation_length: INQUIRY_MINIMAL_ALLOCATION_LENGTH,
                },
                Ok(ScsiResponse::Inquiry(short)),
            )
            .on(
                "/dev/sg0",
                ScsiCommand::StandardInquiry {
                    allocation_length: 96,
                },
                Err(ScsiError::IllegalRequestInvalidField),
            );

        let data = standard_inquiry(&executor, Path::new("/dev/sg0")).expect("inquiry");
        assert_eq!(data.trimmed_vendor(), "ACME");
        assert_eq!(data.trimmed_product(), "ARRAY");
    }

    #[test]
    fn read_capacity_prefers_sixteen_byte_variant() {
        let executor = ScriptedExecutor::default()
            .on(
                "/dev/sg1",
                ScsiCommand::ReadCapacity16,
                Err(ScsiError::IllegalRequestInvalidField),
            )
            .on(
                "/dev/sg1",
                ScsiCommand::ReadCapacity10,
                Ok(ScsiResponse::Capacity(CapacityData {
                    last_lba: 2047,
                    block_length: 512,
                })),
            );

        let capacity = read_capacity(&executor, Path::new("/dev/sg1")).expect("capacity");
        assert_eq!(capacity.capacity_bytes(), 1_048_576);
        assert_eq!(executor.call_count(&ScsiCommand::ReadCapacity16), 1);
        assert_eq!(executor.call_count(&ScsiCommand::ReadCapacity10), 1);
    }

    #[test]
    fn online_requires_qualifier_zero() {
        let executor = ScriptedExecutor::default()
            .online("/dev/sg2")
            .on("/dev/sg3", ScsiCommand::TestUnitReady, Ok(ScsiResponse::Ready))
            .on(
                "/dev/sg3",
                ScsiCommand::StandardInquiry {
                    allocation_length: INQUIRY_FIXED_ALLOCATION_LENGTH,
                },
                Ok(ScsiResponse::Inquiry(inquiry(1, "ACME", "ARRAY"))),
            )
            .on(
                "/dev/sg4",
                ScsiCommand::TestUnitReady,
                Err(ScsiError::NotReady),
            );

        assert!(is_lun_online(&executor, Some(Path::new("/dev/sg2"))));
        assert!(!is_lun_online(&executor, Some(Path::new("/dev/sg3"))));
        assert!(!is_lun_online(&executor, Some(Path::new("/dev/sg4"))));
        assert!(!is_lun_online(&executor, None));
    }

    #[test]
    fn trims_space_and_nul_padding() {
        assert_eq!(trim_padding("NETAPP  "), "NETAPP");
        assert_eq!(trim_padding("LUN C-Mode\0\0"), "LUN C-Mode");
        assert_eq!(trim_padding("  lead"), "  lead");
    }
}
