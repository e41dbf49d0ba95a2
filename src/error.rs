use crate::pci::{BindingState, PciAddress};
use crate::rebinder::PartialBindFailure;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum PassthroughError {
    #[error("PCI device {0} not found")]
    DeviceNotFound(String),

    #[error("Device inventory unavailable: {0}")]
    InventoryUnavailable(String),

    #[error("Invalid PCI address '{0}' (expected 0000:01:00.0)")]
    InvalidAddress(String),

    #[error("Invalid driver name '{0}'")]
    InvalidDriverName(String),

    #[error(
        "IOMMU group {group} contains functions not authorized for passthrough: {}",
        join_addresses(.unauthorized)
    )]
    AmbiguousGroup {
        group: u32,
        unauthorized: Vec<PciAddress>,
    },

    #[error("IOMMU group {group} is already claimed by VM '{held_by}'")]
    GroupBusy { group: u32, held_by: String },

    #[error("Processes still hold the device open: {}", join_pids(.remaining))]
    HolderBusy { remaining: Vec<u32> },

    #[error("{0}")]
    PartialBindFailure(Box<PartialBindFailure>),

    #[error("Verification failed for {address}: expected {expected}, found {found}")]
    VerificationFailed {
        address: PciAddress,
        expected: String,
        found: BindingState,
    },

    #[error("Privilege elevation denied: {0}")]
    PrivilegeDenied(String),

    #[error("{operation} did not complete within {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Privileged command failed: {0}")]
    CommandFailed(String),

    #[error("VM '{0}' already has an active passthrough session")]
    SessionExists(String),

    #[error("No passthrough session for VM '{0}'")]
    SessionNotFound(String),

    #[error("Cannot {operation} VM '{vm}' while session is {phase}")]
    InvalidTransition {
        vm: String,
        phase: String,
        operation: &'static str,
    },

    #[error("Activation of VM '{0}' was cancelled")]
    Cancelled(String),

    #[error("Hypervisor error: {0}")]
    Domain(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(String),
}

impl PassthroughError {
    /// True when the device may be left in a state that nobody verified.
    pub fn requires_manual_intervention(&self) -> bool {
        match self {
            PassthroughError::PartialBindFailure(report) => !report.stuck.is_empty(),
            PassthroughError::VerificationFailed { .. } => true,
            _ => false,
        }
    }
}

impl From<PartialBindFailure> for PassthroughError {
    fn from(report: PartialBindFailure) -> Self {
        PassthroughError::PartialBindFailure(Box::new(report))
    }
}

impl From<toml::de::Error> for PassthroughError {
    fn from(err: toml::de::Error) -> Self {
        PassthroughError::Serde(err.to_string())
    }
}

impl From<serde_json::Error> for PassthroughError {
    fn from(err: serde_json::Error) -> Self {
        PassthroughError::Serde(err.to_string())
    }
}

pub(crate) fn join_addresses(addresses: &[PciAddress]) -> String {
    if addresses.is_empty() {
        return "none".to_string();
    }
    addresses
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn join_pids(pids: &[u32]) -> String {
    pids.iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
