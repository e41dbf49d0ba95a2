// PCI function identity and binding snapshots.
// Everything here is a point-in-time view; the kernel owns the truth.

use crate::{PassthroughError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

pub const VFIO_PCI_DRIVER: &str = "vfio-pci";

/// PCI class code prefix for PCI-to-PCI bridges (class 06, subclass 04).
pub const BRIDGE_CLASS_PREFIX: u32 = 0x0604;

static PCI_ADDRESS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:([0-9a-fA-F]{4}):)?([0-9a-fA-F]{2}):([0-9a-fA-F]{2})\.([0-7])$")
        .expect("PCI address regex is valid")
});

static DRIVER_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,63}$").expect("driver regex is valid"));

/// Bus address of one PCI function (domain:bus:device.function).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PciAddress {
    pub domain: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    pub fn new(domain: u16, bus: u8, device: u8, function: u8) -> Result<Self> {
        if device > 0x1f || function > 7 {
            return Err(PassthroughError::InvalidAddress(format!(
                "{:04x}:{:02x}:{:02x}.{}",
                domain, bus, device, function
            )));
        }
        Ok(Self {
            domain,
            bus,
            device,
            function,
        })
    }

    /// Functions of one physical card share domain, bus and device number.
    pub fn same_card(&self, other: &PciAddress) -> bool {
        self.domain == other.domain && self.bus == other.bus && self.device == other.device
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

impl FromStr for PciAddress {
    type Err = PassthroughError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let caps = PCI_ADDRESS_REGEX
            .captures(trimmed)
            .ok_or_else(|| PassthroughError::InvalidAddress(s.to_string()))?;

        let hex = |idx: usize| -> Result<u32> {
            match caps.get(idx) {
                Some(m) => u32::from_str_radix(m.as_str(), 16)
                    .map_err(|_| PassthroughError::InvalidAddress(s.to_string())),
                None => Ok(0),
            }
        };

        PciAddress::new(hex(1)? as u16, hex(2)? as u8, hex(3)? as u8, hex(4)? as u8)
    }
}

impl TryFrom<String> for PciAddress {
    type Error = PassthroughError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PciAddress> for String {
    fn from(address: PciAddress) -> Self {
        address.to_string()
    }
}

/// Vendor and device identifier pair, as written to `new_id`/`remove_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PciId {
    pub vendor: u16,
    pub device: u16,
}

impl PciId {
    pub fn new(vendor: u16, device: u16) -> Self {
        Self { vendor, device }
    }

    /// Value format expected by the dynamic-ID control files.
    pub fn sysfs_value(&self) -> String {
        format!("{:04x} {:04x}", self.vendor, self.device)
    }
}

impl fmt::Display for PciId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.device)
    }
}

/// Kernel driver name. Only ever built from validated input, so it is safe to
/// use as a sysfs path component or a modprobe argument.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DriverName(String);

impl DriverName {
    pub fn parse(name: &str) -> Result<Self> {
        let trimmed = name.trim();
        if DRIVER_NAME_REGEX.is_match(trimmed) && !trimmed.contains("..") {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(PassthroughError::InvalidDriverName(name.to_string()))
        }
    }

    pub fn vfio_pci() -> Self {
        Self(VFIO_PCI_DRIVER.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_vfio(&self) -> bool {
        self.0 == VFIO_PCI_DRIVER
    }

    /// Kernel module name backing this driver (modprobe treats '-' and '_' alike).
    pub fn module_name(&self) -> String {
        self.0.replace('-', "_")
    }
}

impl fmt::Display for DriverName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DriverName {
    type Error = PassthroughError;

    fn try_from(value: String) -> Result<Self> {
        DriverName::parse(&value)
    }
}

impl From<DriverName> for String {
    fn from(driver: DriverName) -> Self {
        driver.0
    }
}

/// Which driver currently owns a function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindingState {
    HostDriver(DriverName),
    VfioPci,
    Unbound,
    Unknown,
}

impl BindingState {
    pub fn from_driver(driver: Option<&DriverName>) -> Self {
        match driver {
            Some(d) if d.is_vfio() => BindingState::VfioPci,
            Some(d) => BindingState::HostDriver(d.clone()),
            None => BindingState::Unbound,
        }
    }

    pub fn is_vfio(&self) -> bool {
        matches!(self, BindingState::VfioPci)
    }
}

impl fmt::Display for BindingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingState::HostDriver(d) => write!(f, "host driver {}", d),
            BindingState::VfioPci => write!(f, "{}", VFIO_PCI_DRIVER),
            BindingState::Unbound => write!(f, "unbound"),
            BindingState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Snapshot of one PCI function as read from sysfs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciFunction {
    pub address: PciAddress,
    pub id: PciId,
    /// 24-bit class code, e.g. 0x030000 for a VGA controller.
    pub class: u32,
    pub driver: Option<DriverName>,
    pub iommu_group: Option<u32>,
    pub boot_vga: bool,
}

impl PciFunction {
    pub fn binding_state(&self) -> BindingState {
        BindingState::from_driver(self.driver.as_ref())
    }

    pub fn is_bridge(&self) -> bool {
        self.class >> 8 == BRIDGE_CLASS_PREFIX
    }

    pub fn is_display(&self) -> bool {
        self.class >> 16 == 0x03
    }
}

/// The functions that move between host and vfio-pci as one unit.
/// Members are kept sorted by bus address so logs and binding order are stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceGroup {
    iommu_group: u32,
    target: PciAddress,
    functions: Vec<PciFunction>,
}

impl DeviceGroup {
    pub fn new(iommu_group: u32, target: PciAddress, mut functions: Vec<PciFunction>) -> Self {
        functions.sort_by_key(|f| f.address);
        functions.dedup_by_key(|f| f.address);
        Self {
            iommu_group,
            target,
            functions,
        }
    }

    pub fn iommu_group(&self) -> u32 {
        self.iommu_group
    }

    /// The address the operator asked for (usually the GPU's display function).
    pub fn target(&self) -> PciAddress {
        self.target
    }

    pub fn functions(&self) -> &[PciFunction] {
        &self.functions
    }

    pub fn addresses(&self) -> Vec<PciAddress> {
        self.functions.iter().map(|f| f.address).collect()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn contains(&self, address: &PciAddress) -> bool {
        self.functions.iter().any(|f| &f.address == address)
    }
}

impl fmt::Display for DeviceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IOMMU group {} [{}]",
            self.iommu_group,
            crate::error::join_addresses(&self.addresses())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parsing() {
        let addr: PciAddress = "0000:01:00.1".parse().unwrap();
        assert_eq!(addr, PciAddress::new(0, 1, 0, 1).unwrap());
        assert_eq!(addr.to_string(), "0000:01:00.1");

        let short: PciAddress = "0a:00.0".parse().unwrap();
        assert_eq!(short.to_string(), "0000:0a:00.0");

        let upper: PciAddress = "0000:0A:1F.7".parse().unwrap();
        assert_eq!(upper.to_string(), "0000:0a:1f.7");
    }

    #[test]
    fn test_address_rejects_garbage() {
        for bad in [
            "",
            "0000:01:00",
            "0000:01:00.8",
            "0000:01:20.0",
            "01:00.0; rm -rf /",
            "../../0000:01:00.0",
            "0000:01:00.0\n0000:02:00.0",
        ] {
            assert!(bad.parse::<PciAddress>().is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_address_ordering_and_same_card() {
        let gpu: PciAddress = "0000:01:00.0".parse().unwrap();
        let audio: PciAddress = "0000:01:00.1".parse().unwrap();
        let other: PciAddress = "0000:02:00.0".parse().unwrap();

        assert!(gpu < audio && audio < other);
        assert!(gpu.same_card(&audio));
        assert!(!gpu.same_card(&other));
    }

    #[test]
    fn test_driver_name_validation() {
        assert!(DriverName::parse("snd_hda_intel").is_ok());
        assert!(DriverName::parse("vfio-pci").unwrap().is_vfio());
        assert_eq!(DriverName::parse("vfio-pci").unwrap().module_name(), "vfio_pci");

        for bad in ["", "nvidia; reboot", "../vfio-pci", "a/b", "driver name", "-x"] {
            assert!(DriverName::parse(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_binding_state_from_driver() {
        let nvidia = DriverName::parse("nvidia").unwrap();
        assert_eq!(
            BindingState::from_driver(Some(&nvidia)),
            BindingState::HostDriver(nvidia.clone())
        );
        assert_eq!(
            BindingState::from_driver(Some(&DriverName::vfio_pci())),
            BindingState::VfioPci
        );
        assert_eq!(BindingState::from_driver(None), BindingState::Unbound);
    }

    #[test]
    fn test_device_group_sorts_members() {
        let make = |addr: &str| PciFunction {
            address: addr.parse().unwrap(),
            id: PciId::new(0x10de, 0x2684),
            class: 0x030000,
            driver: None,
            iommu_group: Some(5),
            boot_vga: false,
        };

        let group = DeviceGroup::new(
            5,
            "0000:01:00.0".parse().unwrap(),
            vec![make("0000:01:00.1"), make("0000:01:00.0"), make("0000:01:00.1")],
        );

        assert_eq!(group.len(), 2);
        assert_eq!(group.addresses()[0].to_string(), "0000:01:00.0");
        assert_eq!(group.to_string(), "IOMMU group 5 [0000:01:00.0, 0000:01:00.1]");
    }

    #[test]
    fn test_id_formats() {
        let id = PciId::new(0x10de, 0x228b);
        assert_eq!(id.to_string(), "10de:228b");
        assert_eq!(id.sysfs_value(), "10de 228b");
    }

    #[test]
    fn test_class_helpers() {
        let mut function = PciFunction {
            address: "0000:00:01.0".parse().unwrap(),
            id: PciId::new(0x8086, 0x1901),
            class: 0x060400,
            driver: None,
            iommu_group: Some(1),
            boot_vga: false,
        };
        assert!(function.is_bridge());
        assert!(!function.is_display());

        function.class = 0x030200;
        assert!(function.is_display());
        assert!(!function.is_bridge());
    }
}
