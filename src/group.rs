use crate::inventory::DeviceInventory;
use crate::pci::{DeviceGroup, PciAddress, PciFunction};
use crate::{PassthroughError, Result, log_debug, log_info, log_warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Operator-supplied device selector: an exact address, `vvvv:dddd`, or `vvvv:*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DevicePattern {
    Address(PciAddress),
    Id { vendor: u16, device: Option<u16> },
}

impl DevicePattern {
    pub fn matches(&self, function: &PciFunction) -> bool {
        match self {
            DevicePattern::Address(address) => *address == function.address,
            DevicePattern::Id { vendor, device } => {
                *vendor == function.id.vendor && device.is_none_or(|d| d == function.id.device)
            }
        }
    }
}

impl FromStr for DevicePattern {
    type Err = PassthroughError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if let Ok(address) = trimmed.parse::<PciAddress>() {
            return Ok(DevicePattern::Address(address));
        }

        let invalid = || PassthroughError::Config(format!("invalid device pattern '{}'", s));
        let (vendor, device) = trimmed.split_once(':').ok_or_else(invalid)?;
        if vendor.len() != 4 {
            return Err(invalid());
        }
        let vendor = u16::from_str_radix(vendor, 16).map_err(|_| invalid())?;
        let device = match device {
            "*" => None,
            d if d.len() == 4 => Some(u16::from_str_radix(d, 16).map_err(|_| invalid())?),
            _ => return Err(invalid()),
        };
        Ok(DevicePattern::Id { vendor, device })
    }
}

impl fmt::Display for DevicePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DevicePattern::Address(address) => write!(f, "{}", address),
            DevicePattern::Id {
                vendor,
                device: Some(device),
            } => write!(f, "{:04x}:{:04x}", vendor, device),
            DevicePattern::Id { vendor, device: None } => write!(f, "{:04x}:*", vendor),
        }
    }
}

impl TryFrom<String> for DevicePattern {
    type Error = PassthroughError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DevicePattern> for String {
    fn from(pattern: DevicePattern) -> Self {
        pattern.to_string()
    }
}

/// Which group members the operator allows to leave the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupPolicy {
    /// Extra functions allowed to move besides those on the target's own card.
    #[serde(default)]
    pub authorized: Vec<DevicePattern>,
    /// Functions that never move, even when authorized.
    #[serde(default)]
    pub protected: Vec<DevicePattern>,
    /// Leave PCI bridges out of the group; vfio accepts them on pcieport.
    #[serde(default = "default_skip_bridges")]
    pub skip_bridges: bool,
}

fn default_skip_bridges() -> bool {
    true
}

impl Default for GroupPolicy {
    fn default() -> Self {
        Self {
            authorized: Vec::new(),
            protected: Vec::new(),
            skip_bridges: true,
        }
    }
}

impl GroupPolicy {
    fn permits(&self, target: &PciFunction, function: &PciFunction) -> bool {
        if self.protected.iter().any(|p| p.matches(function)) {
            return false;
        }
        function.address.same_card(&target.address)
            || self.authorized.iter().any(|p| p.matches(function))
    }
}

/// Computes the full set of functions that must move with a GPU.
#[derive(Debug, Clone)]
pub struct GroupResolver {
    inventory: DeviceInventory,
    policy: GroupPolicy,
}

impl GroupResolver {
    pub fn new(inventory: DeviceInventory, policy: GroupPolicy) -> Self {
        Self { inventory, policy }
    }

    /// Resolve the group fresh from sysfs. Every member is moved or nothing is:
    /// a member the policy does not permit turns into a refusal, never a skip.
    pub fn resolve_group(&self, gpu_address: &PciAddress) -> Result<DeviceGroup> {
        let target = self.inventory.resolve(gpu_address)?;
        let group_id = target.iommu_group.ok_or_else(|| {
            PassthroughError::InventoryUnavailable(format!(
                "{} has no IOMMU group (is the IOMMU enabled?)",
                gpu_address
            ))
        })?;

        if !target.is_display() {
            log_warn!(
                "{} is not a display controller (class {:06x}); passing it through anyway",
                gpu_address,
                target.class
            );
        }

        let mut members = Vec::new();
        for function in self.inventory.iommu_group_members(group_id)? {
            if self.policy.skip_bridges && function.is_bridge() && function.address != target.address {
                log_debug!(
                    "Leaving bridge {} out of IOMMU group {}",
                    function.address,
                    group_id
                );
                continue;
            }
            members.push(function);
        }

        if !members.iter().any(|f| f.address == target.address) {
            // The kernel listing and the device's own link disagree; trust neither.
            return Err(PassthroughError::InventoryUnavailable(format!(
                "{} is not listed in its IOMMU group {}",
                gpu_address, group_id
            )));
        }

        let unauthorized: Vec<PciAddress> = members
            .iter()
            .filter(|f| !self.policy.permits(&target, f))
            .map(|f| f.address)
            .collect();
        if !unauthorized.is_empty() {
            log_warn!(
                "Refusing IOMMU group {}: {} member(s) not authorized",
                group_id,
                unauthorized.len()
            );
            return Err(PassthroughError::AmbiguousGroup {
                group: group_id,
                unauthorized,
            });
        }

        if members.iter().any(|f| f.boot_vga) {
            log_warn!(
                "IOMMU group {} drives the boot display; host display processes must be released first",
                group_id
            );
        }

        let group = DeviceGroup::new(group_id, target.address, members);
        log_info!("Resolved {} for {}", group, gpu_address);
        Ok(group)
    }
}
