use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::RescanOutcome;

/// Why a target raised UNIT ATTENTION.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitAttentionReason {
    BusReset,
    CapacityChanged,
    LunsChanged,
    Other(String),
}

impl fmt::Display for UnitAttentionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitAttentionReason::BusReset => write!(f, "power on, reset or bus device reset"),
            UnitAttentionReason::CapacityChanged => write!(f, "capacity data has changed"),
            UnitAttentionReason::LunsChanged => write!(f, "reported luns data has changed"),
            UnitAttentionReason::Other(reason) => write!(f, "{reason}"),
        }
    }
}

/// Failures raised by the SCSI command execution collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScsiError {
    #[error("device not ready")]
    NotReady,
    #[error("illegal request: invalid field or unsupported command")]
    IllegalRequestInvalidField,
    #[error("unit attention: {0}")]
    UnitAttention(UnitAttentionReason),
    #[error("reservation conflict")]
    ReservationConflict,
    #[error("device I/O error: {0}")]
    DeviceIo(String),
}

impl ScsiError {
    /// Expected conditions that callers downgrade to "indeterminate" or a
    /// default value instead of propagating.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ScsiError::NotReady
                | ScsiError::IllegalRequestInvalidField
                | ScsiError::UnitAttention(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error(transparent)]
    Scsi(#[from] ScsiError),
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid HCTL address {0:?}")]
    InvalidHctl(String),
    #[error("rescan failed: {0}")]
    Rescan(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TopologyError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        TopologyError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        match self {
            TopologyError::Scsi(err) => err.is_recoverable(),
            _ => false,
        }
    }
}

/// Result of a failed `rescan_and_wait_for` call.
#[derive(Debug, Error)]
pub enum RescanError {
    #[error("timed out waiting for {predicate} after {:.1}s", .outcome.elapsed().as_secs_f64())]
    Timeout {
        predicate: String,
        outcome: RescanOutcome,
    },
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

impl RescanError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RescanError::Timeout { .. })
    }
}
