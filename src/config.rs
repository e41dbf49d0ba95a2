use crate::group::{GroupPolicy, GroupResolver};
use crate::hooks::{LifecycleHooks, VirshDomain};
use crate::inventory::{DeviceInventory, SysfsLayout};
use crate::pci::PciAddress;
use crate::privileged::{Elevation, ExecTimeouts, HostExecutor, PrivilegedExec};
use crate::reaper::{ProcFs, ProcessReaper, ReaperTimeouts};
use crate::rebinder::DriverRebinder;
use crate::session::{ActivateOptions, SessionManager};
use crate::{PassthroughError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassthroughConfig {
    /// Prefix for /sys, /proc and /dev.
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,
    #[serde(default = "default_libvirt_uri")]
    pub libvirt_uri: String,
    #[serde(default)]
    pub privilege: PrivilegeConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub policy: GroupPolicy,
    #[serde(default)]
    pub vm: HashMap<String, VmPassthroughConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PrivilegeConfig {
    #[serde(default)]
    pub elevation: Elevation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_sysfs_write_secs")]
    pub sysfs_write_secs: u64,
    #[serde(default = "default_module_load_secs")]
    pub module_load_secs: u64,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_reaper_grace_ms")]
    pub reaper_grace_ms: u64,
    #[serde(default = "default_reaper_kill_wait_ms")]
    pub reaper_kill_wait_ms: u64,
    /// How long a guest gets to honour ACPI shutdown before it is destroyed.
    #[serde(default = "default_shutdown_secs")]
    pub shutdown_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            sysfs_write_secs: default_sysfs_write_secs(),
            module_load_secs: default_module_load_secs(),
            settle_ms: default_settle_ms(),
            reaper_grace_ms: default_reaper_grace_ms(),
            reaper_kill_wait_ms: default_reaper_kill_wait_ms(),
            shutdown_secs: default_shutdown_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn exec_timeouts(&self) -> ExecTimeouts {
        ExecTimeouts {
            sysfs_write: Duration::from_secs(self.sysfs_write_secs),
            module_load: Duration::from_secs(self.module_load_secs),
            ..ExecTimeouts::default()
        }
    }

    pub fn reaper_timeouts(&self) -> ReaperTimeouts {
        ReaperTimeouts {
            grace: Duration::from_millis(self.reaper_grace_ms),
            kill_wait: Duration::from_millis(self.reaper_kill_wait_ms),
            ..ReaperTimeouts::default()
        }
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_secs(self.shutdown_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmPassthroughConfig {
    pub gpu: Option<String>,
    #[serde(default)]
    pub authorize_kill: bool,
}

impl VmPassthroughConfig {
    pub fn gpu_address(&self) -> Result<Option<PciAddress>> {
        self.gpu.as_deref().map(str::parse).transpose()
    }

    pub fn activate_options(&self) -> ActivateOptions {
        ActivateOptions {
            authorize_kill: self.authorize_kill,
        }
    }
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/")
}

fn default_libvirt_uri() -> String {
    "qemu:///system".to_string()
}

fn default_shutdown_secs() -> u64 {
    120
}

fn default_sysfs_write_secs() -> u64 {
    10
}

fn default_module_load_secs() -> u64 {
    30
}

fn default_settle_ms() -> u64 {
    250
}

fn default_reaper_grace_ms() -> u64 {
    3000
}

fn default_reaper_kill_wait_ms() -> u64 {
    2000
}

impl Default for PassthroughConfig {
    fn default() -> Self {
        Self {
            sysfs_root: default_sysfs_root(),
            libvirt_uri: default_libvirt_uri(),
            privilege: PrivilegeConfig::default(),
            timeouts: TimeoutConfig::default(),
            policy: GroupPolicy::default(),
            vm: HashMap::new(),
        }
    }
}

impl PassthroughConfig {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("nova")
            .join("passthrough.toml")
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    /// Missing file means defaults; a broken file is an error.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self> {
        let config: PassthroughConfig =
            toml::from_str(contents).map_err(|e| PassthroughError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| PassthroughError::Config(e.to_string()))?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, vm) in &self.vm {
            vm.gpu_address()
                .map_err(|e| PassthroughError::Config(format!("vm.{}: {}", name, e)))?;
        }
        if self.timeouts.sysfs_write_secs == 0 || self.timeouts.module_load_secs == 0 {
            return Err(PassthroughError::Config(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn get_vm(&self, name: &str) -> Option<&VmPassthroughConfig> {
        self.vm.get(name)
    }

    pub fn layout(&self) -> SysfsLayout {
        SysfsLayout::new(&self.sysfs_root)
    }

    pub fn inventory(&self) -> DeviceInventory {
        DeviceInventory::new(self.layout())
    }

    pub fn executor(&self) -> Arc<dyn PrivilegedExec> {
        Arc::new(HostExecutor::new(
            self.layout(),
            self.privilege.elevation,
            self.timeouts.exec_timeouts(),
        ))
    }

    pub fn resolver(&self) -> GroupResolver {
        GroupResolver::new(self.inventory(), self.policy.clone())
    }

    pub fn rebinder(&self, exec: Arc<dyn PrivilegedExec>) -> DriverRebinder {
        DriverRebinder::new(self.inventory(), exec).with_settle(self.timeouts.settle())
    }

    pub fn reaper(&self, exec: Arc<dyn PrivilegedExec>) -> ProcessReaper {
        let table = Arc::new(ProcFs::new(self.layout(), exec));
        ProcessReaper::new(self.inventory(), table, self.timeouts.reaper_timeouts())
    }

    /// Session manager wired to the real host.
    pub fn session_manager(&self) -> SessionManager {
        let exec = self.executor();
        SessionManager::new(self.resolver(), self.rebinder(exec.clone()), self.reaper(exec))
    }

    pub fn hooks(&self) -> LifecycleHooks {
        LifecycleHooks::new(Arc::new(self.session_manager()))
            .with_shutdown_timeout(self.timeouts.shutdown())
    }

    pub fn domain(&self, name: &str) -> VirshDomain {
        VirshDomain::new(name).with_connect(&self.libvirt_uri)
    }
}
