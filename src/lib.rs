pub mod config;
pub mod error;
pub mod events;
pub mod group;
pub mod hooks;
pub mod inventory;
pub mod logger;
pub mod pci;
pub mod privileged;
pub mod reaper;
pub mod rebinder;
pub mod session;

pub use error::PassthroughError;

pub type Result<T> = std::result::Result<T, PassthroughError>;

// Convenience re-exports for embedding the engine in a VM manager
pub use config::PassthroughConfig;
pub use group::{GroupPolicy, GroupResolver};
pub use hooks::{DomainHandle, LifecycleHooks, VirshDomain};
pub use inventory::{DeviceInventory, SysfsLayout};
pub use pci::{BindingState, DeviceGroup, DriverName, PciAddress, PciFunction, PciId};
pub use privileged::{HostExecutor, PrivilegedExec, PrivilegedOp};
pub use reaper::{ProcessReaper, ProcessTable};
pub use rebinder::{BindingRecord, DriverRebinder, PartialBindFailure};
pub use session::{ActivateOptions, PassthroughSession, Phase, SessionManager};
