// Process Reaper: finds processes holding a group's device nodes open and,
// when allowed, terminates them before the group leaves its host drivers.

use crate::inventory::{DeviceInventory, SysfsLayout};
use crate::pci::DeviceGroup;
use crate::privileged::{PrivilegedExec, PrivilegedOp, TerminationSignal};
use crate::{PassthroughError, Result, log_debug, log_info, log_warn};
use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// A process with at least one of the watched device nodes open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holder {
    pub pid: u32,
    pub command: String,
    pub nodes: Vec<PathBuf>,
}

/// Source of truth for running processes.
pub trait ProcessTable: Send + Sync {
    /// Processes with any of `nodes` open. Never includes the calling process.
    fn holders(&self, nodes: &[PathBuf]) -> Result<Vec<Holder>>;

    fn signal(&self, pid: u32, signal: TerminationSignal) -> Result<()>;

    fn is_alive(&self, pid: u32) -> bool;
}

/// Reads `/proc/<pid>/fd` under the configured root.
pub struct ProcFs {
    layout: SysfsLayout,
    exec: Arc<dyn PrivilegedExec>,
    own_pid: u32,
}

impl ProcFs {
    pub fn new(layout: SysfsLayout, exec: Arc<dyn PrivilegedExec>) -> Self {
        Self {
            layout,
            exec,
            own_pid: std::process::id(),
        }
    }

    fn command(&self, pid: u32) -> String {
        fs::read_to_string(self.layout.proc_dir().join(pid.to_string()).join("comm"))
            .map(|c| c.trim().to_string())
            .unwrap_or_else(|_| "?".to_string())
    }
}

impl ProcessTable for ProcFs {
    fn holders(&self, nodes: &[PathBuf]) -> Result<Vec<Holder>> {
        let proc_dir = self.layout.proc_dir();
        let entries = fs::read_dir(&proc_dir).map_err(|e| {
            PassthroughError::InventoryUnavailable(format!(
                "cannot read {}: {}",
                proc_dir.display(),
                e
            ))
        })?;

        let watched: BTreeSet<&PathBuf> = nodes.iter().collect();
        let mut holders = Vec::new();
        let mut uninspectable = Vec::new();

        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            if pid == self.own_pid {
                continue;
            }

            let fds = match fs::read_dir(entry.path().join("fd")) {
                Ok(fds) => fds,
                Err(err) if process_gone(&err) => continue,
                Err(err) => {
                    log_debug!("Cannot read open files of pid {}: {}", pid, err);
                    uninspectable.push(pid);
                    continue;
                }
            };
            let mut open: BTreeSet<PathBuf> = BTreeSet::new();
            for fd in fds.flatten() {
                if let Ok(target) = fs::read_link(fd.path()) {
                    if watched.contains(&target) {
                        open.insert(target);
                    }
                }
            }

            if !open.is_empty() {
                holders.push(Holder {
                    pid,
                    command: self.command(pid),
                    nodes: open.into_iter().collect(),
                });
            }
        }

        // An unreadable process may be the display server; never report "no holders" then.
        if !uninspectable.is_empty() {
            uninspectable.sort_unstable();
            return Err(PassthroughError::PrivilegeDenied(format!(
                "cannot inspect open files of {} process(es) (first pid {}); run as root to find holders of the device nodes",
                uninspectable.len(),
                uninspectable[0]
            )));
        }

        holders.sort_by_key(|h| h.pid);
        Ok(holders)
    }

    fn signal(&self, pid: u32, sig: TerminationSignal) -> Result<()> {
        if pid == self.own_pid {
            return Err(PassthroughError::CommandFailed(
                "refusing to signal our own process".to_string(),
            ));
        }
        match signal::kill(Pid::from_raw(pid as i32), sig.as_nix()) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(Errno::EPERM) => {
                log_debug!("kill({}) not permitted, retrying through privileged helper", pid);
                self.exec.execute(&PrivilegedOp::Signal { pid, signal: sig })
            }
            Err(errno) => Err(PassthroughError::CommandFailed(format!(
                "kill({}, {:?}): {}",
                pid, sig, errno
            ))),
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        let stat = self.layout.proc_dir().join(pid.to_string()).join("stat");
        match fs::read_to_string(stat) {
            // Zombies hold no file descriptors.
            Ok(contents) => contents
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next())
                .is_none_or(|state| state != "Z"),
            Err(_) => false,
        }
    }
}

/// The process exited between listing /proc and reading its fd directory.
fn process_gone(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound || err.raw_os_error() == Some(Errno::ESRCH as i32)
}

#[derive(Debug, Clone, Copy)]
pub struct ReaperTimeouts {
    /// Wait between the graceful and the forceful signal.
    pub grace: Duration,
    /// Wait after the forceful signal before giving up.
    pub kill_wait: Duration,
    pub poll: Duration,
}

impl Default for ReaperTimeouts {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(3000),
            kill_wait: Duration::from_millis(2000),
            poll: Duration::from_millis(50),
        }
    }
}

pub struct ProcessReaper {
    inventory: DeviceInventory,
    table: Arc<dyn ProcessTable>,
    timeouts: ReaperTimeouts,
}

impl ProcessReaper {
    pub fn new(inventory: DeviceInventory, table: Arc<dyn ProcessTable>, timeouts: ReaperTimeouts) -> Self {
        Self {
            inventory,
            table,
            timeouts,
        }
    }

    /// Device nodes of every function in the group, read fresh.
    pub fn device_nodes(&self, group: &DeviceGroup) -> Result<Vec<PathBuf>> {
        let mut nodes = BTreeSet::new();
        for function in group.functions() {
            let fresh = self.inventory.resolve(&function.address)?;
            nodes.extend(self.inventory.device_nodes(&fresh));
        }
        Ok(nodes.into_iter().collect())
    }

    pub fn holders(&self, group: &DeviceGroup) -> Result<Vec<Holder>> {
        let nodes = self.device_nodes(group)?;
        if nodes.is_empty() {
            return Ok(Vec::new());
        }
        self.table.holders(&nodes)
    }

    /// Terminate every holder of the group's devices.
    ///
    /// Without `authorize_kill` any holder is reported as `HolderBusy` and
    /// nothing is signalled. Returns how many processes went away.
    pub fn release_holders(&self, group: &DeviceGroup, authorize_kill: bool) -> Result<usize> {
        let holders = self.holders(group)?;
        if holders.is_empty() {
            log_debug!("No processes hold {}", group);
            return Ok(0);
        }

        for holder in &holders {
            log_info!(
                "pid {} ({}) holds {}",
                holder.pid,
                holder.command,
                holder
                    .nodes
                    .iter()
                    .map(|n| n.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        let pids: Vec<u32> = holders.iter().map(|h| h.pid).collect();
        if !authorize_kill {
            log_warn!("{} is in use and killing was not authorized", group);
            return Err(PassthroughError::HolderBusy { remaining: pids });
        }

        let survivors = self.escalate(&pids, TerminationSignal::Term, self.timeouts.grace);
        let remaining = if survivors.is_empty() {
            survivors
        } else {
            log_warn!("{} process(es) ignored SIGTERM, sending SIGKILL", survivors.len());
            self.escalate(&survivors, TerminationSignal::Kill, self.timeouts.kill_wait)
        };

        if !remaining.is_empty() {
            return Err(PassthroughError::HolderBusy { remaining });
        }

        log_info!("Released {} holder(s) of {}", pids.len(), group);
        Ok(pids.len())
    }

    /// Signal every pid, then wait up to `wait` for them to exit. Returns survivors.
    fn escalate(&self, pids: &[u32], sig: TerminationSignal, wait: Duration) -> Vec<u32> {
        for pid in pids {
            if let Err(err) = self.table.signal(*pid, sig) {
                log_warn!("Could not send {:?} to pid {}: {}", sig, pid, err);
            }
        }

        let deadline = Instant::now() + wait;
        loop {
            let alive: Vec<u32> = pids
                .iter()
                .copied()
                .filter(|pid| self.table.is_alive(*pid))
                .collect();
            if alive.is_empty() || Instant::now() >= deadline {
                return alive;
            }
            thread::sleep(self.timeouts.poll);
        }
    }
}
