use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::command::{CapacityData, InquiryData, ScsiCommand, ScsiExecutor, ScsiResponse};
use crate::error::{ScsiError, UnitAttentionReason};

// sg3_utils exit statuses
const SG_LIB_CAT_NOT_READY: i32 = 2;
const SG_LIB_CAT_ILLEGAL_REQ: i32 = 5;
const SG_LIB_CAT_UNIT_ATTENTION: i32 = 6;
const SG_LIB_CAT_INVALID_OP: i32 = 9;
const SG_LIB_CAT_RES_CONFLICT: i32 = 24;

/// Executes SCSI commands through the sg3_utils command line tools
/// (`sg_inq`, `sg_luns`, `sg_turs`, `sg_readcap`) and decodes their `--raw`
/// output.
#[derive(Debug, Clone, Default)]
pub struct Sg3UtilsExecutor {
    tool_dir: Option<PathBuf>,
}

impl Sg3UtilsExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks the tools up in `dir` instead of `PATH`.
    pub fn with_tool_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            tool_dir: Some(dir.into()),
        }
    }

    fn tool(&self, name: &str) -> PathBuf {
        match &self.tool_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }

    fn run(&self, tool: &str, args: &[String], device: &Path) -> Result<Vec<u8>, ScsiError> {
        debug!("{} {} {}", tool, args.join(" "), device.display());
        let output = Command::new(self.tool(tool))
            .args(args)
            .arg(device)
            .output()
            .map_err(|err| ScsiError::DeviceIo(format!("failed to run {tool}: {err}")))?;
        if output.status.success() {
            return Ok(output.stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(match output.status.code() {
            Some(code) => classify_exit(tool, code, &stderr),
            None => ScsiError::DeviceIo(format!("{tool} was killed by a signal")),
        })
    }
}

impl ScsiExecutor for Sg3UtilsExecutor {
    fn execute(&self, device: &Path, command: &ScsiCommand) -> Result<ScsiResponse, ScsiError> {
        match command {
            ScsiCommand::StandardInquiry { allocation_length } => {
                let raw = self.run(
                    "sg_inq",
                    &["--raw".to_string(), format!("--len={allocation_length}")],
                    device,
                )?;
                decode_standard_inquiry(&raw).map(ScsiResponse::Inquiry)
            }
            ScsiCommand::UnitSerialNumber => {
                let raw = self.run(
                    "sg_inq",
                    &["--raw".to_string(), "--page=0x80".to_string()],
                    device,
                )?;
                decode_unit_serial_number(&raw).map(ScsiResponse::UnitSerialNumber)
            }
            ScsiCommand::ReportLuns { select_report } => {
                let raw = self.run(
                    "sg_luns",
                    &["--raw".to_string(), format!("--select={}", select_report.code())],
                    device,
                )?;
                decode_report_luns(&raw).map(ScsiResponse::ReportLuns)
            }
            ScsiCommand::TestUnitReady => {
                self.run("sg_turs", &[], device)?;
                Ok(ScsiResponse::Ready)
            }
            ScsiCommand::ReadCapacity10 => {
                let raw = self.run("sg_readcap", &["--raw".to_string()], device)?;
                decode_read_capacity10(&raw).map(ScsiResponse::Capacity)
            }
            ScsiCommand::ReadCapacity16 => {
                let raw = self.run(
                    "sg_readcap",
                    &["--16".to_string(), "--raw".to_string()],
                    device,
                )?;
                decode_read_capacity16(&raw).map(ScsiResponse::Capacity)
            }
        }
    }
}

/// Maps an sg3_utils exit status onto the sense categories callers act on.
pub fn classify_exit(tool: &str, code: i32, stderr: &str) -> ScsiError {
    match code {
        SG_LIB_CAT_NOT_READY => ScsiError::NotReady,
        SG_LIB_CAT_ILLEGAL_REQ | SG_LIB_CAT_INVALID_OP => ScsiError::IllegalRequestInvalidField,
        SG_LIB_CAT_UNIT_ATTENTION => ScsiError::UnitAttention(unit_attention_reason(stderr)),
        SG_LIB_CAT_RES_CONFLICT => ScsiError::ReservationConflict,
        _ => ScsiError::DeviceIo(format!(
            "{tool} exited with {code}: {}",
            stderr.trim()
        )),
    }
}

fn unit_attention_reason(stderr: &str) -> UnitAttentionReason {
    let message = stderr.to_ascii_lowercase();
    if message.contains("reported luns data has changed") {
        UnitAttentionReason::LunsChanged
    } else if message.contains("capacity data has changed") {
        UnitAttentionReason::CapacityChanged
    } else if message.contains("reset") || message.contains("power on") {
        UnitAttentionReason::BusReset
    } else {
        UnitAttentionReason::Other(stderr.trim().to_string())
    }
}

fn short(what: &str, needed: usize, got: usize) -> ScsiError {
    ScsiError::DeviceIo(format!("{what} response too short: {got} < {needed} bytes"))
}

fn ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| if byte.is_ascii_graphic() || *byte == b' ' { *byte as char } else { ' ' })
        .collect()
}

pub fn decode_standard_inquiry(raw: &[u8]) -> Result<InquiryData, ScsiError> {
    if raw.len() < 5 {
        return Err(short("STANDARD INQUIRY", 5, raw.len()));
    }
    let field = |start: usize, end: usize| -> String {
        raw.get(start..end.min(raw.len()))
            .map(ascii)
            .unwrap_or_default()
    };
    Ok(InquiryData {
        peripheral_qualifier: raw[0] >> 5,
        peripheral_device_type: raw[0] & 0x1f,
        additional_length: raw[4],
        vendor_id: field(8, 16),
        product_id: field(16, 32),
        revision: field(32, 36),
    })
}

pub fn decode_unit_serial_number(raw: &[u8]) -> Result<String, ScsiError> {
    if raw.len() < 4 {
        return Err(short("UNIT SERIAL NUMBER", 4, raw.len()));
    }
    if raw[1] != 0x80 {
        return Err(ScsiError::DeviceIo(format!(
            "expected VPD page 0x80, got {:#04x}",
            raw[1]
        )));
    }
    let length = usize::from(u16::from_be_bytes([raw[2], raw[3]]));
    let end = (4 + length).min(raw.len());
    Ok(ascii(&raw[4..end]).trim().to_string())
}

pub fn decode_report_luns(raw: &[u8]) -> Result<Vec<u64>, ScsiError> {
    if raw.len() < 8 {
        return Err(short("REPORT LUNS", 8, raw.len()));
    }
    let list_length = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    let end = (8 + list_length).min(raw.len());
    Ok(raw[8..end]
        .chunks_exact(8)
        .map(|entry| {
            let mut lun = [0u8; 8];
            lun.copy_from_slice(entry);
            flatten_lun(&lun)
        })
        .collect())
}

/// Flattens an 8-byte SCSI LUN the way the Linux midlayer numbers LUNs in
/// sysfs: each two-byte addressing level lands in successive 16-bit words.
pub fn flatten_lun(lun: &[u8; 8]) -> u64 {
    (0..8).step_by(2).fold(0u64, |flat, i| {
        flat | (u64::from(lun[i]) << ((i + 1) * 8)) | (u64::from(lun[i + 1]) << (i * 8))
    })
}

pub fn decode_read_capacity10(raw: &[u8]) -> Result<CapacityData, ScsiError> {
    if raw.len() < 8 {
        return Err(short("READ CAPACITY (10)", 8, raw.len()));
    }
    Ok(CapacityData {
        last_lba: u64::from(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])),
        block_length: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
    })
}

pub fn decode_read_capacity16(raw: &[u8]) -> Result<CapacityData, ScsiError> {
    if raw.len() < 12 {
        return Err(short("READ CAPACITY (16)", 12, raw.len()));
    }
    let mut lba = [0u8; 8];
    lba.copy_from_slice(&raw[0..8]);
    Ok(CapacityData {
        last_lba: u64::from_be_bytes(lba),
        block_length: u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]),
    })
}

#[cfg(test)]
mod tests {
    use super::{
        classify_exit, decode_read_capacity10, decode_read_capacity16, decode_report_luns,
        decode_standard_inquiry, decode_unit_serial_number, flatten_lun,
    };
    use crate::error::{ScsiError, UnitAttentionReason};

    #[test]
    fn decodes_standard_inquiry() {
        let mut raw = vec![0u8; 36];
        raw[0] = 0x20; // qualifier 1, disk
        raw[4] = 31;
        raw[8..16].copy_from_slice(b"NFINIDAT");
        raw[16..32].copy_from_slice(b"InfiniBox       ");
        raw[32..36].copy_from_slice(b"0001");

        let inquiry = decode_standard_inquiry(&raw).expect("inquiry");
        assert_eq!(inquiry.peripheral_qualifier, 1);
        assert_eq!(inquiry.peripheral_device_type, 0);
        assert_eq!(inquiry.additional_length, 31);
        assert_eq!(inquiry.trimmed_vendor(), "NFINIDAT");
        assert_eq!(inquiry.trimmed_product(), "InfiniBox");
        assert_eq!(inquiry.trimmed_revision(), "0001");
        assert!(decode_standard_inquiry(&raw[..3]).is_err());
    }

    #[test]
    fn decodes_unit_serial_number_page() {
        let mut raw = vec![0x00, 0x80, 0x00, 0x0a];
        raw.extend_from_slice(b"  7420A3B5");
        assert_eq!(decode_unit_serial_number(&raw).expect("serial"), "7420A3B5");
        assert!(decode_unit_serial_number(&[0x00, 0x83, 0x00, 0x00]).is_err());
    }

    #[test]
    fn flattens_luns_like_the_linux_midlayer() {
        assert_eq!(flatten_lun(&[0, 5, 0, 0, 0, 0, 0, 0]), 5);
        assert_eq!(flatten_lun(&[0x40, 0x05, 0, 0, 0, 0, 0, 0]), 0x4005);
        assert_eq!(flatten_lun(&[0, 1, 0, 2, 0, 0, 0, 0]), 0x0002_0001);
    }

    #[test]
    fn decodes_report_luns_list() {
        let mut raw = vec![0, 0, 0, 24, 0, 0, 0, 0];
        for lun in [0u8, 1, 7] {
            raw.extend_from_slice(&[0, lun, 0, 0, 0, 0, 0, 0]);
        }
        assert_eq!(decode_report_luns(&raw).expect("luns"), vec![0, 1, 7]);

        // A truncated response keeps only whole entries.
        assert_eq!(decode_report_luns(&raw[..20]).expect("luns"), vec![0]);
    }

    #[test]
    fn decodes_read_capacity_responses() {
        let ten = [0x00, 0x1f, 0xff, 0xff, 0x00, 0x00, 0x02, 0x00];
        let capacity = decode_read_capacity10(&ten).expect("capacity");
        assert_eq!(capacity.last_lba, 0x1f_ffff);
        assert_eq!(capacity.capacity_bytes(), 0x20_0000 * 512);

        let mut sixteen = vec![0u8; 32];
        sixteen[0..8].copy_from_slice(&0x1_0000_0000u64.to_be_bytes());
        sixteen[8..12].copy_from_slice(&4096u32.to_be_bytes());
        let capacity = decode_read_capacity16(&sixteen).expect("capacity");
        assert_eq!(capacity.last_lba, 0x1_0000_0000);
        assert_eq!(capacity.block_length, 4096);
    }

    #[test]
    fn maps_exit_codes_to_sense_categories() {
        assert_eq!(classify_exit("sg_turs", 2, ""), ScsiError::NotReady);
        assert_eq!(
            classify_exit("sg_readcap", 9, ""),
            ScsiError::IllegalRequestInvalidField
        );
        assert_eq!(
            classify_exit("sg_luns", 6, "Unit attention: Reported luns data has changed"),
            ScsiError::UnitAttention(UnitAttentionReason::LunsChanged)
        );
        assert_eq!(classify_exit("sg_inq", 24, ""), ScsiError::ReservationConflict);
        assert!(matches!(
            classify_exit("sg_inq", 15, "open error"),
            ScsiError::DeviceIo(_)
        ));
    }
}
