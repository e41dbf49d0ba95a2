// Driver Rebinder: moves a DeviceGroup between host drivers and vfio-pci.
//
// Each function goes through record -> unbind -> new_id -> bind -> verify.
// A failure anywhere rolls back every function touched in the same call,
// and whatever could not be rolled back is reported, never hidden.

use crate::events;
use crate::inventory::DeviceInventory;
use crate::pci::{BindingState, DeviceGroup, DriverName, PciAddress, PciFunction, PciId};
use crate::privileged::{PrivilegedExec, PrivilegedOp};
use crate::{PassthroughError, Result, log_debug, log_error, log_info, log_warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Modules that make up the VFIO stack, loaded when vfio-pci is missing.
const VFIO_MODULES: [&str; 3] = ["vfio", "vfio_pci", "vfio_iommu_type1"];

/// What a group looked like before it was moved to vfio-pci.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRecord {
    /// Binding of each function before the move.
    pub original_states: BTreeMap<PciAddress, BindingState>,
    /// IDs this engine registered through `new_id`.
    pub registered_ids: BTreeSet<PciId>,
}

impl BindingRecord {
    pub fn original_driver(&self, address: &PciAddress) -> Option<&DriverName> {
        match self.original_states.get(address) {
            Some(BindingState::HostDriver(driver)) => Some(driver),
            _ => None,
        }
    }

    /// Drivers as they were when the group was resolved. Used to recover a
    /// group whose bind failed before a full record existed.
    pub fn snapshot(group: &DeviceGroup) -> Self {
        Self {
            original_states: group
                .functions()
                .iter()
                .map(|f| (f.address, f.binding_state()))
                .collect(),
            registered_ids: BTreeSet::new(),
        }
    }

    /// Build a record from operator-supplied originals (one-shot restores).
    pub fn from_drivers<I>(drivers: I) -> Self
    where
        I: IntoIterator<Item = (PciAddress, DriverName)>,
    {
        Self {
            original_states: drivers
                .into_iter()
                .map(|(a, d)| (a, BindingState::from_driver(Some(&d))))
                .collect(),
            registered_ids: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    ToVfio,
    ToHost,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ToVfio => write!(f, "host -> vfio-pci"),
            Direction::ToHost => write!(f, "vfio-pci -> host"),
        }
    }
}

/// A function whose rollback failed; it needs an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StuckFunction {
    pub address: PciAddress,
    pub state: BindingState,
    pub error: String,
}

/// Exact per-function outcome of a move that failed part way.
/// `succeeded`, `rolled_back` and `stuck` never share an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialBindFailure {
    pub group: u32,
    pub direction: Direction,
    pub failed_at: PciAddress,
    pub cause: String,
    /// Functions left in the requested target state.
    pub succeeded: Vec<PciAddress>,
    /// Functions returned to where they started.
    pub rolled_back: Vec<PciAddress>,
    pub stuck: Vec<StuckFunction>,
}

impl PartialBindFailure {
    pub fn stuck_addresses(&self) -> Vec<PciAddress> {
        self.stuck.iter().map(|s| s.address).collect()
    }
}

impl fmt::Display for PartialBindFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Moving IOMMU group {} ({}) failed at {}: {}; succeeded: [{}]; rolled back: [{}]",
            self.group,
            self.direction,
            self.failed_at,
            self.cause,
            crate::error::join_addresses(&self.succeeded),
            crate::error::join_addresses(&self.rolled_back),
        )?;
        if !self.stuck.is_empty() {
            write!(f, "; STUCK, manual intervention required:")?;
            for stuck in &self.stuck {
                write!(f, " {} ({}: {})", stuck.address, stuck.state, stuck.error)?;
            }
        }
        Ok(())
    }
}

/// Where a function should end up when leaving vfio-pci.
#[derive(Debug, Clone, PartialEq, Eq)]
enum HostTarget {
    Driver(DriverName),
    /// Let the kernel pick through drivers_probe.
    Probe,
    /// Leave it without a driver; it had none before.
    Unbound,
    /// It was on vfio-pci before the bind; it stays there.
    Vfio,
}

impl HostTarget {
    /// Functions that were never recorded, or unreadable, go to the kernel's choice.
    fn from_original(original: Option<&BindingState>) -> Self {
        match original {
            Some(BindingState::HostDriver(driver)) => HostTarget::Driver(driver.clone()),
            Some(BindingState::Unbound) => HostTarget::Unbound,
            Some(BindingState::VfioPci) => HostTarget::Vfio,
            Some(BindingState::Unknown) | None => HostTarget::Probe,
        }
    }

    fn satisfied_by(&self, state: &BindingState) -> bool {
        match (self, state) {
            (HostTarget::Driver(want), BindingState::HostDriver(have)) => want == have,
            (HostTarget::Probe, BindingState::HostDriver(_)) => true,
            (HostTarget::Unbound, BindingState::Unbound) => true,
            (HostTarget::Vfio, BindingState::VfioPci) => true,
            _ => false,
        }
    }
}

pub struct DriverRebinder {
    inventory: DeviceInventory,
    exec: Arc<dyn PrivilegedExec>,
    settle: Duration,
}

impl DriverRebinder {
    pub fn new(inventory: DeviceInventory, exec: Arc<dyn PrivilegedExec>) -> Self {
        Self {
            inventory,
            exec,
            settle: Duration::from_millis(250),
        }
    }

    /// Pause between a bind-type write and the verification read.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Move every function of the group to vfio-pci.
    ///
    /// Returns the record needed to restore the group later. Binding a group
    /// that is already fully on vfio-pci performs no writes.
    pub fn bind_to_vfio(&self, group: &DeviceGroup) -> Result<BindingRecord> {
        let members = self.fresh_members(group)?;
        let mut record = BindingRecord::default();

        if members.iter().all(|f| f.binding_state().is_vfio()) {
            log_info!("{} already bound to vfio-pci", group);
            for function in &members {
                record
                    .original_states
                    .insert(function.address, BindingState::VfioPci);
            }
            return Ok(record);
        }

        self.ensure_vfio_driver(group)?;
        log_info!("Binding {} to vfio-pci", group);

        let mut already_vfio = Vec::new();
        let mut moved: Vec<(PciAddress, BindingState)> = Vec::new();

        for function in &members {
            let state = function.binding_state();
            if state.is_vfio() {
                log_debug!("{} already on vfio-pci", function.address);
                record.original_states.insert(function.address, state);
                already_vfio.push(function.address);
                continue;
            }

            record.original_states.insert(function.address, state.clone());
            moved.push((function.address, state));

            if let Err(err) = self.move_to_vfio(group, function, &mut record) {
                log_error!("Binding {} failed: {}", function.address, err);
                let report =
                    self.rollback_bind(group, function.address, &err, &moved, already_vfio, &record);
                return Err(report.into());
            }
        }

        log_info!("{} bound to vfio-pci", group);
        Ok(record)
    }

    /// Return every function of the group to its recorded host driver.
    ///
    /// Functions that started on vfio-pci stay there, functions that had no
    /// driver stay unbound, and functions missing from the record are handed
    /// to the kernel's probe. A group that is already back on the host performs no writes.
    pub fn restore_host_driver(&self, group: &DeviceGroup, original: &BindingRecord) -> Result<()> {
        let members = self.fresh_members(group)?;
        let targets: Vec<(PciFunction, HostTarget)> = members
            .into_iter()
            .map(|f| {
                let target = HostTarget::from_original(original.original_states.get(&f.address));
                (f, target)
            })
            .collect();

        if targets
            .iter()
            .all(|(f, target)| target.satisfied_by(&f.binding_state()))
        {
            log_info!("{} already on host drivers", group);
            return Ok(());
        }

        log_info!("Restoring {} to host drivers", group);

        // Drop dynamic IDs first so vfio-pci cannot re-claim on probe. A record
        // from another process may not list them, so cover every vfio member too.
        // IDs of functions that belong on vfio-pci are kept.
        let keep: BTreeSet<PciId> = targets
            .iter()
            .filter(|(_, target)| *target == HostTarget::Vfio)
            .map(|(f, _)| f.id)
            .collect();
        let mut stale_ids = original.registered_ids.clone();
        stale_ids.extend(
            targets
                .iter()
                .filter(|(f, _)| f.binding_state().is_vfio())
                .map(|(f, _)| f.id),
        );
        stale_ids.retain(|id| !keep.contains(id));
        for id in &stale_ids {
            self.run(group, PrivilegedOp::RemoveId { id: *id })?;
        }

        let mut untouched = Vec::new();
        let mut restored: Vec<PciAddress> = Vec::new();

        for (function, target) in &targets {
            if target.satisfied_by(&function.binding_state()) {
                untouched.push(function.address);
                continue;
            }

            if let Err(err) = self.move_to_host(group, &function.address, target) {
                log_error!("Restoring {} failed: {}", function.address, err);
                let mut touched = restored.clone();
                touched.push(function.address);
                let report = self.rollback_restore(group, function.address, &err, &touched, untouched);
                return Err(report.into());
            }
            restored.push(function.address);
        }

        log_info!("{} restored to host drivers", group);
        Ok(())
    }

    /// Current binding of every member, read fresh.
    pub fn group_state(&self, group: &DeviceGroup) -> Vec<(PciAddress, BindingState)> {
        group
            .functions()
            .iter()
            .map(|f| {
                let state = self
                    .inventory
                    .binding_state(&f.address)
                    .unwrap_or(BindingState::Unknown);
                (f.address, state)
            })
            .collect()
    }

    /// Re-read every member and make sure it still belongs to the group.
    fn fresh_members(&self, group: &DeviceGroup) -> Result<Vec<PciFunction>> {
        let mut members = Vec::with_capacity(group.len());
        for function in group.functions() {
            let fresh = self.inventory.resolve(&function.address)?;
            if fresh.iommu_group != Some(group.iommu_group()) {
                return Err(PassthroughError::InventoryUnavailable(format!(
                    "{} moved from IOMMU group {} to {:?}",
                    function.address,
                    group.iommu_group(),
                    fresh.iommu_group
                )));
            }
            if fresh.id != function.id {
                return Err(PassthroughError::InventoryUnavailable(format!(
                    "{} changed identity from {} to {}",
                    function.address, function.id, fresh.id
                )));
            }
            members.push(fresh);
        }
        Ok(members)
    }

    fn ensure_vfio_driver(&self, group: &DeviceGroup) -> Result<()> {
        let vfio = DriverName::vfio_pci();
        if self.inventory.driver_present(&vfio) {
            return Ok(());
        }

        log_info!("vfio-pci driver not loaded, loading VFIO modules");
        for module in VFIO_MODULES {
            let module = DriverName::parse(module)?;
            self.run(group, PrivilegedOp::LoadModule { module })?;
        }

        if self.inventory.driver_present(&vfio) {
            Ok(())
        } else {
            Err(PassthroughError::CommandFailed(
                "vfio-pci driver still missing after loading VFIO modules".to_string(),
            ))
        }
    }

    fn move_to_vfio(
        &self,
        group: &DeviceGroup,
        function: &PciFunction,
        record: &mut BindingRecord,
    ) -> Result<()> {
        let address = function.address;
        let vfio = DriverName::vfio_pci();

        // Step 2: detach from whatever owns it now.
        match self.inventory.binding_state(&address)? {
            BindingState::HostDriver(driver) => {
                self.run(group, PrivilegedOp::Unbind { driver, address })?;
                self.expect_state(&address, "unbound", |s| *s == BindingState::Unbound)?;
            }
            BindingState::Unbound => {}
            BindingState::VfioPci => return Ok(()),
            BindingState::Unknown => {
                return Err(PassthroughError::VerificationFailed {
                    address,
                    expected: "a readable driver binding".to_string(),
                    found: BindingState::Unknown,
                });
            }
        }

        if self.inventory.driver_override(&address)?.as_ref() != Some(&vfio) {
            self.run(
                group,
                PrivilegedOp::SetDriverOverride {
                    address,
                    driver: Some(vfio.clone()),
                },
            )?;
        }

        // Step 3: dynamic ID; may bind the function on its own.
        if !record.registered_ids.contains(&function.id) {
            self.run(group, PrivilegedOp::NewId { id: function.id })?;
            record.registered_ids.insert(function.id);
            self.pause();
        }

        // Step 4: explicit bind only if the new_id probe did not take it.
        if self.inventory.binding_state(&address)? == BindingState::Unbound {
            self.run(
                group,
                PrivilegedOp::Bind {
                    driver: vfio,
                    address,
                },
            )?;
            self.pause();
        }

        // Step 5: trust the kernel's answer, not the write's.
        self.expect_state(&address, "vfio-pci", BindingState::is_vfio)?;
        log_debug!("{} verified on vfio-pci", address);
        Ok(())
    }

    fn move_to_host(&self, group: &DeviceGroup, address: &PciAddress, target: &HostTarget) -> Result<()> {
        let address = *address;

        match self.inventory.binding_state(&address)? {
            BindingState::VfioPci if *target == HostTarget::Vfio => return Ok(()),
            BindingState::VfioPci => {
                self.run(
                    group,
                    PrivilegedOp::Unbind {
                        driver: DriverName::vfio_pci(),
                        address,
                    },
                )?;
                self.expect_state(&address, "unbound", |s| *s == BindingState::Unbound)?;
            }
            BindingState::Unbound => {}
            state if target.satisfied_by(&state) => return Ok(()),
            state => {
                return Err(PassthroughError::VerificationFailed {
                    address,
                    expected: describe_target(target),
                    found: state,
                });
            }
        }

        if self.inventory.driver_override(&address)?.is_some() {
            self.run(
                group,
                PrivilegedOp::SetDriverOverride {
                    address,
                    driver: None,
                },
            )?;
        }

        match target {
            HostTarget::Driver(driver) => {
                if !self.inventory.driver_present(driver) {
                    self.run(
                        group,
                        PrivilegedOp::LoadModule {
                            module: driver.clone(),
                        },
                    )?;
                    self.pause();
                }
                // Loading the module may already have probed the function.
                if self.inventory.binding_state(&address)? == BindingState::Unbound {
                    self.run(
                        group,
                        PrivilegedOp::Bind {
                            driver: driver.clone(),
                            address,
                        },
                    )?;
                    self.pause();
                }
            }
            HostTarget::Probe => {
                self.run(group, PrivilegedOp::ProbeDriver { address })?;
                self.pause();
            }
            HostTarget::Unbound => {}
            HostTarget::Vfio => {
                self.run(
                    group,
                    PrivilegedOp::SetDriverOverride {
                        address,
                        driver: Some(DriverName::vfio_pci()),
                    },
                )?;
                self.run(
                    group,
                    PrivilegedOp::Bind {
                        driver: DriverName::vfio_pci(),
                        address,
                    },
                )?;
                self.pause();
            }
        }

        let state = self.inventory.binding_state(&address)?;
        match target {
            HostTarget::Probe if state == BindingState::Unbound => {
                log_warn!("{} has no host driver after probing; leaving it unbound", address);
                Ok(())
            }
            _ if target.satisfied_by(&state) => Ok(()),
            _ => Err(PassthroughError::VerificationFailed {
                address,
                expected: describe_target(target),
                found: state,
            }),
        }
    }

    fn rollback_bind(
        &self,
        group: &DeviceGroup,
        failed_at: PciAddress,
        cause: &PassthroughError,
        moved: &[(PciAddress, BindingState)],
        already_vfio: Vec<PciAddress>,
        record: &BindingRecord,
    ) -> PartialBindFailure {
        log_warn!(
            "Rolling back {} function(s) of IOMMU group {}",
            moved.len(),
            group.iommu_group()
        );

        for id in &record.registered_ids {
            if let Err(err) = self.run(group, PrivilegedOp::RemoveId { id: *id }) {
                log_warn!("Could not remove dynamic ID {} during rollback: {}", id, err);
            }
        }

        let mut rolled_back = Vec::new();
        let mut stuck = Vec::new();
        for (address, original) in moved.iter().rev() {
            let target = HostTarget::from_original(Some(original));
            match self.move_to_host(group, address, &target) {
                Ok(()) => rolled_back.push(*address),
                Err(err) => {
                    log_error!("Rollback of {} failed: {}", address, err);
                    stuck.push(self.stuck(address, &err));
                }
            }
        }

        self.report(group, Direction::ToVfio, failed_at, cause, already_vfio, rolled_back, stuck)
    }

    fn rollback_restore(
        &self,
        group: &DeviceGroup,
        failed_at: PciAddress,
        cause: &PassthroughError,
        touched: &[PciAddress],
        untouched: Vec<PciAddress>,
    ) -> PartialBindFailure {
        log_warn!(
            "Returning {} function(s) of IOMMU group {} to vfio-pci so the group stays whole",
            touched.len(),
            group.iommu_group()
        );

        let mut scratch = BindingRecord::default();
        let mut rolled_back = Vec::new();
        let mut stuck = Vec::new();
        for address in touched.iter().rev() {
            let outcome = self
                .inventory
                .resolve(address)
                .and_then(|function| self.move_to_vfio(group, &function, &mut scratch));
            match outcome {
                Ok(()) => rolled_back.push(*address),
                Err(err) => {
                    log_error!("Rollback of {} to vfio-pci failed: {}", address, err);
                    stuck.push(self.stuck(address, &err));
                }
            }
        }

        self.report(group, Direction::ToHost, failed_at, cause, untouched, rolled_back, stuck)
    }

    #[allow(clippy::too_many_arguments)]
    fn report(
        &self,
        group: &DeviceGroup,
        direction: Direction,
        failed_at: PciAddress,
        cause: &PassthroughError,
        mut succeeded: Vec<PciAddress>,
        mut rolled_back: Vec<PciAddress>,
        stuck: Vec<StuckFunction>,
    ) -> PartialBindFailure {
        succeeded.sort();
        rolled_back.sort();
        let report = PartialBindFailure {
            group: group.iommu_group(),
            direction,
            failed_at,
            cause: cause.to_string(),
            succeeded,
            rolled_back,
            stuck,
        };
        if report.stuck.is_empty() {
            log_warn!("{}", report);
        } else {
            log_error!("{}", report);
        }
        report
    }

    fn stuck(&self, address: &PciAddress, err: &PassthroughError) -> StuckFunction {
        StuckFunction {
            address: *address,
            state: self
                .inventory
                .binding_state(address)
                .unwrap_or(BindingState::Unknown),
            error: err.to_string(),
        }
    }

    fn expect_state<F>(&self, address: &PciAddress, expected: &str, check: F) -> Result<()>
    where
        F: Fn(&BindingState) -> bool,
    {
        let state = self.inventory.binding_state(address)?;
        if check(&state) {
            Ok(())
        } else {
            Err(PassthroughError::VerificationFailed {
                address: *address,
                expected: expected.to_string(),
                found: state,
            })
        }
    }

    fn run(&self, group: &DeviceGroup, op: PrivilegedOp) -> Result<()> {
        let from = op
            .address()
            .and_then(|address| self.inventory.binding_state(&address).ok());
        let outcome = self.exec.execute(&op);
        events::Mutation {
            group: group.iommu_group(),
            op: &op,
            from,
        }
        .emit(&outcome);
        outcome
    }

    fn pause(&self) {
        if !self.settle.is_zero() {
            thread::sleep(self.settle);
        }
    }
}

fn describe_target(target: &HostTarget) -> String {
    match target {
        HostTarget::Driver(driver) => driver.to_string(),
        HostTarget::Probe => "any host driver".to_string(),
        HostTarget::Unbound => "unbound".to_string(),
        HostTarget::Vfio => "vfio-pci".to_string(),
    }
}
