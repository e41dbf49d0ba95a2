// Passthrough Session Manager.
//
// One session per VM. A session claims its IOMMU group for its whole life,
// so no two sessions ever mutate the same group. Blocking sysfs and process
// work runs on the blocking pool; progress is published as SessionEvents.

use crate::events::SessionEvent;
use crate::group::GroupResolver;
use crate::pci::{BindingState, DeviceGroup, PciAddress};
use crate::reaper::ProcessReaper;
use crate::rebinder::{BindingRecord, DriverRebinder};
use crate::{PassthroughError, Result, log_error, log_info, log_warn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{OwnedMutexGuard, broadcast};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// No session; only appears as the endpoint of a transition.
    Idle,
    Resolving,
    Releasing,
    Binding,
    Active,
    Restoring,
    Failed(String),
}

impl Phase {
    pub fn is_failed(&self) -> bool {
        matches!(self, Phase::Failed(_))
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => write!(f, "Idle"),
            Phase::Resolving => write!(f, "Resolving"),
            Phase::Releasing => write!(f, "Releasing"),
            Phase::Binding => write!(f, "Binding"),
            Phase::Active => write!(f, "Active"),
            Phase::Restoring => write!(f, "Restoring"),
            Phase::Failed(reason) => write!(f, "Failed({})", reason),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivateOptions {
    /// Allow the Reaper to terminate processes holding the group open.
    pub authorize_kill: bool,
}

/// Why a session is parked in `Failed`, with the group as last read from sysfs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFault {
    pub message: String,
    pub manual_intervention: bool,
    pub functions: Vec<(PciAddress, BindingState)>,
}

/// Snapshot of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassthroughSession {
    pub id: Uuid,
    pub vm_name: String,
    pub gpu: PciAddress,
    pub group: Option<DeviceGroup>,
    pub phase: Phase,
    pub record: Option<BindingRecord>,
    pub fault: Option<SessionFault>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PassthroughSession {
    pub fn group_id(&self) -> Option<u32> {
        self.group.as_ref().map(|g| g.iommu_group())
    }

    fn functions(&self) -> Vec<PciAddress> {
        self.group.as_ref().map(|g| g.addresses()).unwrap_or_default()
    }
}

struct SessionSlot {
    session: PassthroughSession,
    op_lock: Arc<tokio::sync::Mutex<()>>,
    cancel: Arc<AtomicBool>,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<String, SessionSlot>,
    /// IOMMU group id -> VM holding it.
    claims: HashMap<u32, String>,
}

pub struct SessionManager {
    resolver: GroupResolver,
    rebinder: Arc<DriverRebinder>,
    reaper: Arc<ProcessReaper>,
    registry: Arc<Mutex<Registry>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    pub fn new(resolver: GroupResolver, rebinder: DriverRebinder, reaper: ProcessReaper) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            resolver,
            rebinder: Arc::new(rebinder),
            reaper: Arc::new(reaper),
            registry: Arc::new(Mutex::new(Registry::default())),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn session(&self, vm_name: &str) -> Option<PassthroughSession> {
        self.registry()
            .sessions
            .get(vm_name)
            .map(|slot| slot.session.clone())
    }

    pub fn sessions(&self) -> Vec<PassthroughSession> {
        let mut sessions: Vec<_> = self
            .registry()
            .sessions
            .values()
            .map(|slot| slot.session.clone())
            .collect();
        sessions.sort_by(|a, b| a.vm_name.cmp(&b.vm_name));
        sessions
    }

    /// VM currently holding an IOMMU group, if any.
    pub fn claimed_by(&self, group_id: u32) -> Option<String> {
        self.registry().claims.get(&group_id).cloned()
    }

    /// Claim the GPU's group for `vm_name` and move it to vfio-pci.
    ///
    /// Returns once the session is `Active`. Failures before any sysfs write
    /// release the claim; a group left in an unverified state parks the
    /// session in `Failed` until acknowledged.
    pub async fn activate(
        &self,
        vm_name: &str,
        gpu: PciAddress,
        options: ActivateOptions,
    ) -> Result<PassthroughSession> {
        let (_op_guard, cancel) = self.open_session(vm_name, gpu)?;
        self.transition(vm_name, Phase::Resolving, None);

        // Resolution only reads sysfs.
        let resolver = self.resolver.clone();
        let group = match blocking(move || resolver.resolve_group(&gpu)).await {
            Ok(group) => group,
            Err(err) => return Err(self.abandon(vm_name, err)),
        };

        if let Err(err) = self.claim(vm_name, &group) {
            return Err(self.abandon(vm_name, err));
        }
        if cancel.load(Ordering::SeqCst) {
            return Err(self.abandon(vm_name, PassthroughError::Cancelled(vm_name.to_string())));
        }

        let reaper = self.reaper.clone();
        let probe = group.clone();
        let holders = match blocking(move || reaper.holders(&probe)).await {
            Ok(holders) => holders,
            Err(err) => return Err(self.abandon(vm_name, err)),
        };
        if !holders.is_empty() {
            self.transition(
                vm_name,
                Phase::Releasing,
                Some(format!("{} process(es) hold the group", holders.len())),
            );
            let reaper = self.reaper.clone();
            let target = group.clone();
            let outcome =
                blocking(move || reaper.release_holders(&target, options.authorize_kill)).await;
            if let Err(err) = outcome {
                return Err(self.abandon(vm_name, err));
            }
        }

        if cancel.load(Ordering::SeqCst) {
            return Err(self.abandon(vm_name, PassthroughError::Cancelled(vm_name.to_string())));
        }

        self.transition(vm_name, Phase::Binding, None);
        let rebinder = self.rebinder.clone();
        let target = group.clone();
        match blocking(move || rebinder.bind_to_vfio(&target)).await {
            Ok(record) => {
                self.update(vm_name, |s| s.record = Some(record));
                self.transition(vm_name, Phase::Active, None);
                log_info!("VM '{}' may start: {} is on vfio-pci", vm_name, group);
            }
            Err(err) => {
                if self.group_untouched(&group).await {
                    return Err(self.abandon(vm_name, err));
                }
                return Err(self.park(vm_name, &group, err).await);
            }
        }

        self.session(vm_name)
            .ok_or_else(|| PassthroughError::SessionNotFound(vm_name.to_string()))
    }

    /// Return an `Active` session's group to its host drivers and end the session.
    pub async fn deactivate(&self, vm_name: &str) -> Result<()> {
        let (op_lock, _) = self.slot_handles(vm_name)?;
        self.require_phase(vm_name, "deactivate", |p| *p == Phase::Active)?;

        let _guard = op_lock.lock_owned().await;
        // Re-check: a cancel may have finished while we waited.
        self.require_phase(vm_name, "deactivate", |p| *p == Phase::Active)?;
        self.restore(vm_name).await
    }

    /// Stop whatever the session is doing and put the group back on the host.
    ///
    /// Waits for an in-flight bind or restore to finish first; a device is
    /// never abandoned half way through a driver change.
    pub async fn cancel(&self, vm_name: &str) -> Result<()> {
        let (op_lock, cancel) = self.slot_handles(vm_name)?;
        cancel.store(true, Ordering::SeqCst);
        log_info!("Cancelling passthrough session for VM '{}'", vm_name);

        let _guard = op_lock.lock_owned().await;
        let Some(session) = self.session(vm_name) else {
            // The activation saw the flag and unwound on its own.
            return Ok(());
        };

        // Intermediate phases are only seen here when the caller dropped an
        // activation or restore future, which releases the lock without unwinding.
        match session.phase {
            Phase::Active | Phase::Failed(_) => self.restore(vm_name).await,
            Phase::Idle | Phase::Resolving | Phase::Releasing => {
                self.finish(vm_name, Some("cancelled".to_string()));
                Ok(())
            }
            Phase::Binding | Phase::Restoring => {
                let err = PassthroughError::InvalidTransition {
                    vm: vm_name.to_string(),
                    phase: session.phase.to_string(),
                    operation: "cancel",
                };
                match session.group.as_ref() {
                    // A driver change stopped half way; leave it to the operator.
                    Some(group) => Err(self.park(vm_name, group, err).await),
                    None => {
                        self.finish(vm_name, Some("cancelled".to_string()));
                        Err(err)
                    }
                }
            }
        }
    }

    /// Operator confirms a `Failed` group has been dealt with; release the claim.
    pub fn acknowledge(&self, vm_name: &str) -> Result<()> {
        self.require_phase(vm_name, "acknowledge", Phase::is_failed)?;
        log_warn!(
            "Operator acknowledged failed session for VM '{}'; releasing its group without restoring",
            vm_name
        );
        self.finish(vm_name, Some("acknowledged".to_string()));
        Ok(())
    }

    async fn restore(&self, vm_name: &str) -> Result<()> {
        let session = self
            .session(vm_name)
            .ok_or_else(|| PassthroughError::SessionNotFound(vm_name.to_string()))?;
        let Some(group) = session.group.clone() else {
            self.finish(vm_name, None);
            return Ok(());
        };
        let record = session
            .record
            .clone()
            .unwrap_or_else(|| BindingRecord::snapshot(&group));

        self.transition(vm_name, Phase::Restoring, None);
        let rebinder = self.rebinder.clone();
        let target = group.clone();
        match blocking(move || rebinder.restore_host_driver(&target, &record)).await {
            Ok(()) => {
                log_info!("{} returned to the host after VM '{}'", group, vm_name);
                self.finish(vm_name, None);
                Ok(())
            }
            Err(err) => Err(self.park(vm_name, &group, err).await),
        }
    }

    /// Insert a fresh session for `vm_name` and take its operation lock.
    fn open_session(
        &self,
        vm_name: &str,
        gpu: PciAddress,
    ) -> Result<(OwnedMutexGuard<()>, Arc<AtomicBool>)> {
        let mut registry = self.registry();
        if registry.sessions.contains_key(vm_name) {
            return Err(PassthroughError::SessionExists(vm_name.to_string()));
        }

        let op_lock = Arc::new(tokio::sync::Mutex::new(()));
        let guard = op_lock.clone().try_lock_owned().map_err(|_| {
            PassthroughError::InvalidTransition {
                vm: vm_name.to_string(),
                phase: Phase::Idle.to_string(),
                operation: "activate",
            }
        })?;
        let cancel = Arc::new(AtomicBool::new(false));
        let now = Utc::now();

        registry.sessions.insert(
            vm_name.to_string(),
            SessionSlot {
                session: PassthroughSession {
                    id: Uuid::new_v4(),
                    vm_name: vm_name.to_string(),
                    gpu,
                    group: None,
                    phase: Phase::Idle,
                    record: None,
                    fault: None,
                    created_at: now,
                    updated_at: now,
                },
                op_lock,
                cancel: cancel.clone(),
            },
        );
        Ok((guard, cancel))
    }

    /// Atomically reserve the group; fails without side effects if another VM holds it.
    fn claim(&self, vm_name: &str, group: &DeviceGroup) -> Result<()> {
        let mut registry = self.registry();
        if let Some(holder) = registry.claims.get(&group.iommu_group()) {
            if holder != vm_name {
                return Err(PassthroughError::GroupBusy {
                    group: group.iommu_group(),
                    held_by: holder.clone(),
                });
            }
        }
        registry
            .claims
            .insert(group.iommu_group(), vm_name.to_string());
        if let Some(slot) = registry.sessions.get_mut(vm_name) {
            slot.session.group = Some(group.clone());
        }
        log_info!("VM '{}' claimed {}", vm_name, group);
        Ok(())
    }

    /// Unwind a session that failed before touching any device.
    fn abandon(&self, vm_name: &str, err: PassthroughError) -> PassthroughError {
        log_warn!("Activation of VM '{}' stopped: {}", vm_name, err);
        self.finish(vm_name, Some(err.to_string()));
        err
    }

    /// Move a session to `Failed`, keeping its claim, and record what sysfs says now.
    async fn park(&self, vm_name: &str, group: &DeviceGroup, err: PassthroughError) -> PassthroughError {
        log_error!("Passthrough session for VM '{}' failed: {}", vm_name, err);
        let functions = self.read_group(group).await;
        let fault = SessionFault {
            message: err.to_string(),
            manual_intervention: err.requires_manual_intervention()
                || functions.iter().any(|(_, s)| *s == BindingState::Unknown),
            functions,
        };
        self.update(vm_name, |s| s.fault = Some(fault));
        self.transition(vm_name, Phase::Failed(err.to_string()), None);
        err
    }

    /// Whether every member still has the binding it had when resolved.
    async fn group_untouched(&self, group: &DeviceGroup) -> bool {
        let current = self.read_group(group).await;
        group
            .functions()
            .iter()
            .zip(current.iter())
            .all(|(before, (_, now))| before.binding_state() == *now)
            && current.len() == group.len()
    }

    async fn read_group(&self, group: &DeviceGroup) -> Vec<(PciAddress, BindingState)> {
        let rebinder = self.rebinder.clone();
        let target = group.clone();
        match tokio::task::spawn_blocking(move || rebinder.group_state(&target)).await {
            Ok(states) => states,
            Err(err) => {
                log_error!("Could not read group state: {}", err);
                group
                    .addresses()
                    .into_iter()
                    .map(|a| (a, BindingState::Unknown))
                    .collect()
            }
        }
    }

    /// End a session: drop it, release its claim, announce `Idle`.
    fn finish(&self, vm_name: &str, detail: Option<String>) {
        let removed = {
            let mut registry = self.registry();
            let removed = registry.sessions.remove(vm_name);
            if let Some(group_id) = removed.as_ref().and_then(|s| s.session.group_id()) {
                if registry.claims.get(&group_id).map(String::as_str) == Some(vm_name) {
                    registry.claims.remove(&group_id);
                }
            }
            removed
        };
        if let Some(slot) = removed {
            self.publish(&slot.session, slot.session.phase.clone(), Phase::Idle, detail);
        }
    }

    fn transition(&self, vm_name: &str, to: Phase, detail: Option<String>) {
        let snapshot = {
            let mut registry = self.registry();
            registry.sessions.get_mut(vm_name).map(|slot| {
                let from = std::mem::replace(&mut slot.session.phase, to.clone());
                slot.session.updated_at = Utc::now();
                (slot.session.clone(), from)
            })
        };
        if let Some((session, from)) = snapshot {
            self.publish(&session, from, to, detail);
        }
    }

    fn publish(&self, session: &PassthroughSession, from: Phase, to: Phase, detail: Option<String>) {
        let event = SessionEvent {
            session_id: session.id,
            vm_name: session.vm_name.clone(),
            group_id: session.group_id(),
            functions: session.functions(),
            from,
            to,
            at: Utc::now(),
            detail,
        };
        event.emit();
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn update<F>(&self, vm_name: &str, change: F)
    where
        F: FnOnce(&mut PassthroughSession),
    {
        if let Some(slot) = self.registry().sessions.get_mut(vm_name) {
            change(&mut slot.session);
            slot.session.updated_at = Utc::now();
        }
    }

    fn slot_handles(&self, vm_name: &str) -> Result<(Arc<tokio::sync::Mutex<()>>, Arc<AtomicBool>)> {
        self.registry()
            .sessions
            .get(vm_name)
            .map(|slot| (slot.op_lock.clone(), slot.cancel.clone()))
            .ok_or_else(|| PassthroughError::SessionNotFound(vm_name.to_string()))
    }

    fn require_phase<F>(&self, vm_name: &str, operation: &'static str, allowed: F) -> Result<()>
    where
        F: Fn(&Phase) -> bool,
    {
        let registry = self.registry();
        let slot = registry
            .sessions
            .get(vm_name)
            .ok_or_else(|| PassthroughError::SessionNotFound(vm_name.to_string()))?;
        if allowed(&slot.session.phase) {
            Ok(())
        } else {
            Err(PassthroughError::InvalidTransition {
                vm: vm_name.to_string(),
                phase: slot.session.phase.to_string(),
                operation,
            })
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        // Registry updates are single assignments; a poisoned lock still holds consistent data.
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Run blocking sysfs or process work off the async executor.
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| PassthroughError::CommandFailed(format!("worker task failed: {}", e)))?
}
