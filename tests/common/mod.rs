// Shared fixtures: a fake kernel that keeps a sysfs tree in a tempdir and
// reacts to privileged operations the way the PCI core does.
#![allow(dead_code)]

use nova_passthrough::group::{GroupPolicy, GroupResolver};
use nova_passthrough::privileged::TerminationSignal;
use nova_passthrough::reaper::{Holder, ProcessReaper, ProcessTable, ReaperTimeouts};
use nova_passthrough::{
    DeviceInventory, DriverRebinder, PassthroughError, PciAddress, PciId, PrivilegedExec,
    PrivilegedOp, Result, SessionManager, SysfsLayout,
};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const GPU: &str = "0000:01:00.0";
pub const AUDIO: &str = "0000:01:00.1";
pub const USB: &str = "0000:00:14.0";

pub fn addr(s: &str) -> PciAddress {
    s.parse().unwrap()
}

type FailureRule = Box<dyn Fn(&PrivilegedOp) -> bool + Send>;

#[derive(Default)]
struct KernelState {
    writes: usize,
    ops: Vec<PrivilegedOp>,
    ids: HashMap<PciAddress, PciId>,
    native: HashMap<PciAddress, String>,
    vfio_ids: BTreeSet<PciId>,
    failures: Vec<FailureRule>,
    /// Operations that report success without changing anything.
    ignored: Vec<FailureRule>,
}

pub struct FakeKernel {
    root: TempDir,
    state: Mutex<KernelState>,
}

impl FakeKernel {
    pub fn new() -> Arc<Self> {
        let kernel = Self::without_vfio();
        fs::create_dir_all(kernel.driver_dir("vfio-pci")).unwrap();
        kernel
    }

    /// A host where the vfio-pci module has not been loaded yet.
    pub fn without_vfio() -> Arc<Self> {
        let root = tempfile::tempdir().unwrap();
        for dir in [
            "sys/bus/pci/devices",
            "sys/bus/pci/drivers",
            "sys/kernel/iommu_groups",
            "proc",
            "dev",
        ] {
            fs::create_dir_all(root.path().join(dir)).unwrap();
        }
        Arc::new(Self {
            root,
            state: Mutex::new(KernelState::default()),
        })
    }

    /// GPU at 01:00.0 on nvidia and its audio at 01:00.1 on snd_hda_intel,
    /// both in IOMMU group 5, plus an unrelated USB controller in group 3.
    pub fn gpu_with_audio() -> Arc<Self> {
        let kernel = Self::new();
        kernel.add_function(GPU, (0x10de, 0x2684), 0x030000, Some("nvidia"), 5);
        kernel.add_function(AUDIO, (0x10de, 0x22ba), 0x040300, Some("snd_hda_intel"), 5);
        kernel.add_function(USB, (0x8086, 0xa36d), 0x0c0330, Some("xhci_hcd"), 3);
        kernel
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn layout(&self) -> SysfsLayout {
        SysfsLayout::new(self.root.path())
    }

    pub fn inventory(&self) -> DeviceInventory {
        DeviceInventory::new(self.layout())
    }

    pub fn add_function(&self, address: &str, id: (u16, u16), class: u32, driver: Option<&str>, group: u32) {
        let dir = self.device_dir(address);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("vendor"), format!("0x{:04x}\n", id.0)).unwrap();
        fs::write(dir.join("device"), format!("0x{:04x}\n", id.1)).unwrap();
        fs::write(dir.join("class"), format!("0x{:06x}\n", class)).unwrap();
        fs::write(dir.join("driver_override"), "(null)\n").unwrap();

        let group_dir = self
            .root()
            .join("sys/kernel/iommu_groups")
            .join(group.to_string())
            .join("devices");
        fs::create_dir_all(&group_dir).unwrap();
        symlink(format!("../../../../kernel/iommu_groups/{}", group), dir.join("iommu_group")).unwrap();
        symlink(format!("../../../../devices/pci0000:00/{}", address), group_dir.join(address)).unwrap();

        let mut state = self.state.lock().unwrap();
        state.ids.insert(addr(address), PciId::new(id.0, id.1));
        if let Some(driver) = driver {
            fs::create_dir_all(self.driver_dir(driver)).unwrap();
            self.link(address, driver);
            if driver != "vfio-pci" {
                state.native.insert(addr(address), driver.to_string());
            }
        }
    }

    /// Native driver the kernel would pick on probe for a function added unbound.
    pub fn set_native(&self, address: &str, driver: &str) {
        fs::create_dir_all(self.driver_dir(driver)).unwrap();
        self.state
            .lock()
            .unwrap()
            .native
            .insert(addr(address), driver.to_string());
    }

    pub fn add_drm_node(&self, address: &str, node: &str) -> PathBuf {
        fs::create_dir_all(self.device_dir(address).join("drm").join(node)).unwrap();
        self.root().join("dev/dri").join(node)
    }

    pub fn mark_boot_vga(&self, address: &str) {
        fs::write(self.device_dir(address).join("boot_vga"), "1\n").unwrap();
    }

    /// Current driver as the `driver` link reports it.
    pub fn driver_of(&self, address: &str) -> Option<String> {
        fs::read_link(self.device_dir(address).join("driver"))
            .ok()
            .and_then(|t| t.file_name().map(|n| n.to_string_lossy().to_string()))
    }

    pub fn override_of(&self, address: &str) -> Option<String> {
        let value = fs::read_to_string(self.device_dir(address).join("driver_override")).ok()?;
        let value = value.trim();
        if value.is_empty() || value == "(null)" {
            None
        } else {
            Some(value.to_string())
        }
    }

    pub fn driver_loaded(&self, driver: &str) -> bool {
        self.driver_dir(driver).is_dir()
    }

    pub fn unload_driver(&self, driver: &str) {
        fs::remove_dir_all(self.driver_dir(driver)).unwrap();
    }

    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    pub fn ops(&self) -> Vec<PrivilegedOp> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn ops_labelled(&self, label: &str) -> Vec<PrivilegedOp> {
        self.ops().into_iter().filter(|op| op.label() == label).collect()
    }

    pub fn fail_when<F>(&self, rule: F)
    where
        F: Fn(&PrivilegedOp) -> bool + Send + 'static,
    {
        self.state.lock().unwrap().failures.push(Box::new(rule));
    }

    /// Make matching operations "succeed" without the kernel acting on them.
    pub fn ignore_when<F>(&self, rule: F)
    where
        F: Fn(&PrivilegedOp) -> bool + Send + 'static,
    {
        self.state.lock().unwrap().ignored.push(Box::new(rule));
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.failures.clear();
        state.ignored.clear();
    }

    fn device_dir(&self, address: &str) -> PathBuf {
        self.root().join("sys/bus/pci/devices").join(address)
    }

    fn driver_dir(&self, driver: &str) -> PathBuf {
        self.root().join("sys/bus/pci/drivers").join(driver)
    }

    fn link(&self, address: &str, driver: &str) {
        symlink(
            format!("../../../bus/pci/drivers/{}", driver),
            self.device_dir(address).join("driver"),
        )
        .unwrap();
    }

    fn unlink(&self, address: &str) {
        fs::remove_file(self.device_dir(address).join("driver")).unwrap();
    }

    fn all_devices(state: &KernelState) -> Vec<PciAddress> {
        let mut all: Vec<PciAddress> = state.ids.keys().copied().collect();
        all.sort();
        all
    }

    fn apply(&self, state: &mut KernelState, op: &PrivilegedOp) -> Result<()> {
        let fail = |msg: &str| Err(PassthroughError::CommandFailed(format!("{}: {}", op, msg)));
        match op {
            PrivilegedOp::Unbind { driver, address } => {
                let a = address.to_string();
                if self.driver_of(&a).as_deref() != Some(driver.as_str()) {
                    return fail("No such device");
                }
                self.unlink(&a);
                Ok(())
            }
            PrivilegedOp::Bind { driver, address } => {
                let a = address.to_string();
                if !self.driver_loaded(driver.as_str()) {
                    return fail("No such file or directory");
                }
                if self.driver_of(&a).is_some() {
                    return fail("Device or resource busy");
                }
                if let Some(over) = self.override_of(&a) {
                    if over != driver.as_str() {
                        return fail("No such device");
                    }
                }
                self.link(&a, driver.as_str());
                Ok(())
            }
            PrivilegedOp::SetDriverOverride { address, driver } => {
                let value = driver.as_ref().map(|d| d.to_string()).unwrap_or_default();
                fs::write(self.device_dir(&address.to_string()).join("driver_override"), value)
                    .unwrap();
                Ok(())
            }
            PrivilegedOp::NewId { id } => {
                if !self.driver_loaded("vfio-pci") {
                    return fail("No such file or directory");
                }
                // EEXIST is treated as success by the real executor.
                state.vfio_ids.insert(*id);
                for device in Self::all_devices(state) {
                    let a = device.to_string();
                    let matches = state.ids.get(&device) == Some(id);
                    let allowed = self
                        .override_of(&a)
                        .is_none_or(|o| o == "vfio-pci");
                    if matches && allowed && self.driver_of(&a).is_none() {
                        self.link(&a, "vfio-pci");
                    }
                }
                Ok(())
            }
            PrivilegedOp::RemoveId { id } => {
                state.vfio_ids.remove(id);
                Ok(())
            }
            PrivilegedOp::ProbeDriver { address } => {
                let a = address.to_string();
                if self.driver_of(&a).is_some() {
                    return Ok(());
                }
                let choice = match self.override_of(&a) {
                    Some(over) => Some(over),
                    None if state
                        .ids
                        .get(address)
                        .is_some_and(|id| state.vfio_ids.contains(id)) =>
                    {
                        Some("vfio-pci".to_string())
                    }
                    None => state.native.get(address).cloned(),
                };
                if let Some(driver) = choice {
                    if self.driver_loaded(&driver) {
                        self.link(&a, &driver);
                    }
                }
                Ok(())
            }
            PrivilegedOp::LoadModule { module } => {
                let driver = match module.as_str() {
                    "vfio" | "vfio_iommu_type1" => return Ok(()),
                    "vfio_pci" => "vfio-pci".to_string(),
                    other => other.to_string(),
                };
                fs::create_dir_all(self.driver_dir(&driver)).unwrap();
                for device in Self::all_devices(state) {
                    let a = device.to_string();
                    if self.driver_of(&a).is_none()
                        && self.override_of(&a).is_none()
                        && state.native.get(&device) == Some(&driver)
                    {
                        self.link(&a, &driver);
                    }
                }
                Ok(())
            }
            PrivilegedOp::Signal { .. } => Ok(()),
        }
    }
}

impl PrivilegedExec for FakeKernel {
    fn execute(&self, op: &PrivilegedOp) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.writes += 1;
        state.ops.push(op.clone());
        if state.failures.iter().any(|rule| rule(op)) {
            return Err(PassthroughError::CommandFailed(format!("injected failure: {}", op)));
        }
        if state.ignored.iter().any(|rule| rule(op)) {
            return Ok(());
        }
        self.apply(&mut state, op)
    }
}

struct FakeProcess {
    holder: Holder,
    alive: bool,
    ignores_term: bool,
    ignores_kill: bool,
}

/// A process table where tests decide who holds what and who dies on which signal.
#[derive(Default)]
pub struct FakeProcesses {
    procs: Mutex<Vec<FakeProcess>>,
    signals: Mutex<Vec<(u32, TerminationSignal)>>,
}

impl FakeProcesses {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn spawn(&self, pid: u32, command: &str, nodes: &[PathBuf]) {
        self.spawn_with(pid, command, nodes, false, false);
    }

    pub fn spawn_with(&self, pid: u32, command: &str, nodes: &[PathBuf], ignores_term: bool, ignores_kill: bool) {
        self.procs.lock().unwrap().push(FakeProcess {
            holder: Holder {
                pid,
                command: command.to_string(),
                nodes: nodes.to_vec(),
            },
            alive: true,
            ignores_term,
            ignores_kill,
        });
    }

    pub fn signals(&self) -> Vec<(u32, TerminationSignal)> {
        self.signals.lock().unwrap().clone()
    }
}

impl ProcessTable for FakeProcesses {
    fn holders(&self, nodes: &[PathBuf]) -> Result<Vec<Holder>> {
        Ok(self
            .procs
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.alive && p.holder.nodes.iter().any(|n| nodes.contains(n)))
            .map(|p| p.holder.clone())
            .collect())
    }

    fn signal(&self, pid: u32, signal: TerminationSignal) -> Result<()> {
        self.signals.lock().unwrap().push((pid, signal));
        for p in self.procs.lock().unwrap().iter_mut() {
            if p.holder.pid == pid {
                let ignores = match signal {
                    TerminationSignal::Term => p.ignores_term,
                    TerminationSignal::Kill => p.ignores_kill,
                };
                if !ignores {
                    p.alive = false;
                }
            }
        }
        Ok(())
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.procs
            .lock()
            .unwrap()
            .iter()
            .any(|p| p.holder.pid == pid && p.alive)
    }
}

pub fn quick_timeouts() -> ReaperTimeouts {
    ReaperTimeouts {
        grace: Duration::from_millis(50),
        kill_wait: Duration::from_millis(50),
        poll: Duration::from_millis(5),
    }
}

pub fn rebinder(kernel: &Arc<FakeKernel>) -> DriverRebinder {
    DriverRebinder::new(kernel.inventory(), kernel.clone()).with_settle(Duration::ZERO)
}

pub fn reaper(kernel: &Arc<FakeKernel>, procs: &Arc<FakeProcesses>) -> ProcessReaper {
    ProcessReaper::new(kernel.inventory(), procs.clone(), quick_timeouts())
}

pub fn resolver(kernel: &Arc<FakeKernel>) -> GroupResolver {
    GroupResolver::new(kernel.inventory(), GroupPolicy::default())
}

pub fn session_manager(kernel: &Arc<FakeKernel>, procs: &Arc<FakeProcesses>) -> SessionManager {
    SessionManager::new(resolver(kernel), rebinder(kernel), reaper(kernel, procs))
}
