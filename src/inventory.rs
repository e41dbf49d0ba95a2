// Device Inventory: point-in-time reads of PCI functions from sysfs.
// Nothing is cached between calls; driver bindings change behind our back.

use crate::pci::{BindingState, DriverName, PciAddress, PciFunction, PciId};
use crate::{PassthroughError, Result, log_debug};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Locations of the kernel interfaces the engine touches, relative to a root.
/// The root is `/` on a real host and a temporary tree in tests.
#[derive(Debug, Clone)]
pub struct SysfsLayout {
    root: PathBuf,
}

impl SysfsLayout {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn host() -> Self {
        Self::new("/")
    }

    pub fn devices_dir(&self) -> PathBuf {
        self.root.join("sys/bus/pci/devices")
    }

    pub fn device_dir(&self, address: &PciAddress) -> PathBuf {
        self.devices_dir().join(address.to_string())
    }

    pub fn drivers_dir(&self) -> PathBuf {
        self.root.join("sys/bus/pci/drivers")
    }

    pub fn driver_dir(&self, driver: &DriverName) -> PathBuf {
        self.drivers_dir().join(driver.as_str())
    }

    pub fn drivers_probe(&self) -> PathBuf {
        self.root.join("sys/bus/pci/drivers_probe")
    }

    pub fn iommu_groups_dir(&self) -> PathBuf {
        self.root.join("sys/kernel/iommu_groups")
    }

    pub fn proc_dir(&self) -> PathBuf {
        self.root.join("proc")
    }

    pub fn dev_dir(&self) -> PathBuf {
        self.root.join("dev")
    }
}

impl Default for SysfsLayout {
    fn default() -> Self {
        Self::host()
    }
}

#[derive(Debug, Clone)]
pub struct DeviceInventory {
    layout: SysfsLayout,
}

impl DeviceInventory {
    pub fn new(layout: SysfsLayout) -> Self {
        Self { layout }
    }

    /// Whether the kernel exposes IOMMU groups at all.
    pub fn iommu_enabled(&self) -> bool {
        fs::read_dir(self.layout.iommu_groups_dir())
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    }

    /// Enumerate every PCI function, sorted by address.
    pub fn list_functions(&self) -> Result<Vec<PciFunction>> {
        let devices_dir = self.layout.devices_dir();
        let entries = fs::read_dir(&devices_dir).map_err(|e| {
            PassthroughError::InventoryUnavailable(format!(
                "cannot read {}: {}",
                devices_dir.display(),
                e
            ))
        })?;

        let mut functions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                PassthroughError::InventoryUnavailable(format!("cannot list PCI devices: {}", e))
            })?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Ok(address) = name.parse::<PciAddress>() else {
                log_debug!("Skipping non-PCI entry {}", name);
                continue;
            };

            match self.resolve(&address) {
                Ok(function) => functions.push(function),
                Err(PassthroughError::DeviceNotFound(_)) => {
                    log_debug!("Device {} disappeared during enumeration", address);
                }
                Err(err) => return Err(err),
            }
        }

        functions.sort_by_key(|f| f.address);
        Ok(functions)
    }

    /// Read one function fresh from sysfs.
    pub fn resolve(&self, address: &PciAddress) -> Result<PciFunction> {
        let dir = self.layout.device_dir(address);
        if !dir.exists() {
            if !self.layout.devices_dir().exists() {
                return Err(PassthroughError::InventoryUnavailable(format!(
                    "{} is not accessible",
                    self.layout.devices_dir().display()
                )));
            }
            return Err(PassthroughError::DeviceNotFound(address.to_string()));
        }

        let vendor = read_hex(&dir.join("vendor"), address)?;
        let device = read_hex(&dir.join("device"), address)?;
        let class = read_hex(&dir.join("class"), address)?;

        Ok(PciFunction {
            address: *address,
            id: PciId::new(vendor as u16, device as u16),
            class,
            driver: read_driver_link(&dir)?,
            iommu_group: read_iommu_group(&dir),
            boot_vga: fs::read_to_string(dir.join("boot_vga"))
                .map(|v| v.trim() == "1")
                .unwrap_or(false),
        })
    }

    /// Parse and resolve an operator-supplied address string.
    pub fn resolve_str(&self, address: &str) -> Result<PciFunction> {
        let parsed: PciAddress = address.parse()?;
        self.resolve(&parsed)
    }

    /// Every function the kernel lists under one IOMMU group.
    pub fn iommu_group_members(&self, group_id: u32) -> Result<Vec<PciFunction>> {
        let groups_dir = self.layout.iommu_groups_dir();
        if !groups_dir.exists() {
            return Err(PassthroughError::InventoryUnavailable(
                "IOMMU groups not exposed (IOMMU disabled?)".to_string(),
            ));
        }

        let devices_dir = groups_dir.join(group_id.to_string()).join("devices");
        let entries = fs::read_dir(&devices_dir).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                PassthroughError::DeviceNotFound(format!("IOMMU group {}", group_id))
            }
            _ => PassthroughError::InventoryUnavailable(format!(
                "cannot read {}: {}",
                devices_dir.display(),
                e
            )),
        })?;

        let mut members = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let address: PciAddress = match name.parse() {
                Ok(address) => address,
                Err(_) => {
                    log_debug!("Ignoring unexpected IOMMU group entry {}", name);
                    continue;
                }
            };
            members.push(self.resolve(&address)?);
        }

        members.sort_by_key(|f| f.address);
        Ok(members)
    }

    /// Current binding of one function, read straight from the driver link.
    pub fn binding_state(&self, address: &PciAddress) -> Result<BindingState> {
        let dir = self.layout.device_dir(address);
        if !dir.exists() {
            return Err(PassthroughError::DeviceNotFound(address.to_string()));
        }
        match read_driver_link(&dir) {
            Ok(driver) => Ok(BindingState::from_driver(driver.as_ref())),
            Err(err) => {
                log_debug!("Driver link for {} unreadable: {}", address, err);
                Ok(BindingState::Unknown)
            }
        }
    }

    /// Contents of `driver_override`, `None` when unset.
    pub fn driver_override(&self, address: &PciAddress) -> Result<Option<DriverName>> {
        let path = self.layout.device_dir(address).join("driver_override");
        match fs::read_to_string(&path) {
            Ok(value) => {
                let value = value.trim();
                if value.is_empty() || value == "(null)" {
                    Ok(None)
                } else {
                    DriverName::parse(value).map(Some)
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PassthroughError::InventoryUnavailable(format!(
                "cannot read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Whether a driver is registered with the PCI bus (its module is loaded).
    pub fn driver_present(&self, driver: &DriverName) -> bool {
        self.layout.driver_dir(driver).is_dir()
    }

    /// Device nodes through which host processes can hold this function open.
    pub fn device_nodes(&self, function: &PciFunction) -> Vec<PathBuf> {
        let dir = self.layout.device_dir(&function.address);
        let dev = self.layout.dev_dir();
        let mut nodes = Vec::new();

        for name in list_names(&dir.join("drm")) {
            if name.starts_with("card") || name.starts_with("renderD") {
                nodes.push(dev.join("dri").join(&name));
            }
        }

        let sound_cards: Vec<String> = list_names(&dir.join("sound"))
            .into_iter()
            .filter_map(|name| name.strip_prefix("card").map(|n| n.to_string()))
            .collect();
        if !sound_cards.is_empty() {
            let snd_nodes = list_names(&dev.join("snd"));
            for card in &sound_cards {
                let control = format!("controlC{}", card);
                let pcm = format!("pcmC{}D", card);
                let hw = format!("hwC{}D", card);
                for node in &snd_nodes {
                    if *node == control || node.starts_with(&pcm) || node.starts_with(&hw) {
                        nodes.push(dev.join("snd").join(node));
                    }
                }
            }
        }

        if function.driver.as_ref().map(|d| d.as_str()) == Some("nvidia") {
            if let Some(minor) = self.nvidia_minor(&function.address) {
                nodes.push(dev.join(format!("nvidia{}", minor)));
            }
        }

        if function.binding_state().is_vfio() {
            if let Some(group) = function.iommu_group {
                nodes.push(dev.join("vfio").join(group.to_string()));
            }
        }

        nodes.sort();
        nodes.dedup();
        nodes
    }

    fn nvidia_minor(&self, address: &PciAddress) -> Option<u32> {
        let info = self
            .layout
            .proc_dir()
            .join("driver/nvidia/gpus")
            .join(address.to_string())
            .join("information");
        let contents = fs::read_to_string(info).ok()?;
        contents
            .lines()
            .find_map(|line| line.trim().strip_prefix("Device Minor:"))
            .and_then(|v| v.trim().parse().ok())
    }
}

fn read_hex(path: &Path, address: &PciAddress) -> Result<u32> {
    let raw = fs::read_to_string(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => PassthroughError::DeviceNotFound(address.to_string()),
        _ => PassthroughError::InventoryUnavailable(format!(
            "cannot read {}: {}",
            path.display(),
            e
        )),
    })?;
    let trimmed = raw.trim();
    u32::from_str_radix(trimmed.trim_start_matches("0x"), 16).map_err(|_| {
        PassthroughError::InventoryUnavailable(format!(
            "unexpected contents in {}: {:?}",
            path.display(),
            trimmed
        ))
    })
}

fn read_driver_link(device_dir: &Path) -> Result<Option<DriverName>> {
    match fs::read_link(device_dir.join("driver")) {
        Ok(target) => match target.file_name() {
            Some(name) => DriverName::parse(&name.to_string_lossy()).map(Some),
            None => Ok(None),
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(PassthroughError::InventoryUnavailable(format!(
            "cannot read driver link under {}: {}",
            device_dir.display(),
            e
        ))),
    }
}

fn read_iommu_group(device_dir: &Path) -> Option<u32> {
    fs::read_link(device_dir.join("iommu_group"))
        .ok()
        .and_then(|p| {
            p.file_name()
                .and_then(|f| f.to_str())
                .and_then(|s| s.parse::<u32>().ok())
        })
}

fn list_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.file_name().to_string_lossy().to_string())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
