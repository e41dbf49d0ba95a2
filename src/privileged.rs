// Privileged execution boundary.
//
// The engine never builds shell strings. Every elevated action is one of the
// `PrivilegedOp` variants, whose parameters are already-validated newtypes.

use crate::inventory::SysfsLayout;
use crate::pci::{DriverName, PciAddress, PciId};
use crate::{PassthroughError, Result, log_debug, log_warn};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::{Pid, geteuid};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationSignal {
    Term,
    Kill,
}

impl TerminationSignal {
    pub fn as_nix(&self) -> Signal {
        match self {
            TerminationSignal::Term => Signal::SIGTERM,
            TerminationSignal::Kill => Signal::SIGKILL,
        }
    }

    fn kill_flag(&self) -> &'static str {
        match self {
            TerminationSignal::Term => "-TERM",
            TerminationSignal::Kill => "-KILL",
        }
    }
}

/// The complete allow-list of elevated actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrivilegedOp {
    Unbind {
        driver: DriverName,
        address: PciAddress,
    },
    Bind {
        driver: DriverName,
        address: PciAddress,
    },
    SetDriverOverride {
        address: PciAddress,
        driver: Option<DriverName>,
    },
    NewId {
        id: PciId,
    },
    RemoveId {
        id: PciId,
    },
    ProbeDriver {
        address: PciAddress,
    },
    LoadModule {
        module: DriverName,
    },
    Signal {
        pid: u32,
        signal: TerminationSignal,
    },
}

impl PrivilegedOp {
    pub fn label(&self) -> &'static str {
        match self {
            PrivilegedOp::Unbind { .. } => "unbind",
            PrivilegedOp::Bind { .. } => "bind",
            PrivilegedOp::SetDriverOverride { .. } => "driver_override",
            PrivilegedOp::NewId { .. } => "new_id",
            PrivilegedOp::RemoveId { .. } => "remove_id",
            PrivilegedOp::ProbeDriver { .. } => "drivers_probe",
            PrivilegedOp::LoadModule { .. } => "modprobe",
            PrivilegedOp::Signal { .. } => "signal",
        }
    }

    /// The PCI function this operation acts on, if any.
    pub fn address(&self) -> Option<PciAddress> {
        match self {
            PrivilegedOp::Unbind { address, .. }
            | PrivilegedOp::Bind { address, .. }
            | PrivilegedOp::SetDriverOverride { address, .. }
            | PrivilegedOp::ProbeDriver { address } => Some(*address),
            _ => None,
        }
    }

    /// Control file and value for operations that are plain sysfs writes.
    pub fn sysfs_write(&self, layout: &SysfsLayout) -> Option<(PathBuf, String)> {
        let vfio = DriverName::vfio_pci();
        match self {
            PrivilegedOp::Unbind { driver, address } => Some((
                layout.driver_dir(driver).join("unbind"),
                address.to_string(),
            )),
            PrivilegedOp::Bind { driver, address } => Some((
                layout.driver_dir(driver).join("bind"),
                address.to_string(),
            )),
            PrivilegedOp::SetDriverOverride { address, driver } => Some((
                layout.device_dir(address).join("driver_override"),
                driver
                    .as_ref()
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "\n".to_string()),
            )),
            PrivilegedOp::NewId { id } => {
                Some((layout.driver_dir(&vfio).join("new_id"), id.sysfs_value()))
            }
            PrivilegedOp::RemoveId { id } => {
                Some((layout.driver_dir(&vfio).join("remove_id"), id.sysfs_value()))
            }
            PrivilegedOp::ProbeDriver { address } => {
                Some((layout.drivers_probe(), address.to_string()))
            }
            PrivilegedOp::LoadModule { .. } | PrivilegedOp::Signal { .. } => None,
        }
    }

    /// Kernel errors that mean the requested state already holds.
    fn tolerates(&self, errno: Option<Errno>) -> bool {
        match self {
            PrivilegedOp::NewId { .. } => errno == Some(Errno::EEXIST),
            PrivilegedOp::RemoveId { .. } => errno == Some(Errno::ENODEV),
            _ => false,
        }
    }
}

impl fmt::Display for PrivilegedOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrivilegedOp::Unbind { driver, address } => write!(f, "unbind {} from {}", address, driver),
            PrivilegedOp::Bind { driver, address } => write!(f, "bind {} to {}", address, driver),
            PrivilegedOp::SetDriverOverride {
                address,
                driver: Some(driver),
            } => write!(f, "set driver_override of {} to {}", address, driver),
            PrivilegedOp::SetDriverOverride { address, driver: None } => {
                write!(f, "clear driver_override of {}", address)
            }
            PrivilegedOp::NewId { id } => write!(f, "register {} with vfio-pci", id),
            PrivilegedOp::RemoveId { id } => write!(f, "remove {} from vfio-pci", id),
            PrivilegedOp::ProbeDriver { address } => write!(f, "probe drivers for {}", address),
            PrivilegedOp::LoadModule { module } => write!(f, "load module {}", module.module_name()),
            PrivilegedOp::Signal { pid, signal } => write!(f, "send {:?} to pid {}", signal, pid),
        }
    }
}

/// Runs allow-listed operations with elevated privileges.
pub trait PrivilegedExec: Send + Sync {
    fn execute(&self, op: &PrivilegedOp) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Elevation {
    /// Direct when running as root, sudo otherwise.
    #[default]
    Auto,
    Direct,
    Sudo,
    Pkexec,
}

impl Elevation {
    fn effective(self) -> Elevation {
        match self {
            Elevation::Auto if geteuid().is_root() => Elevation::Direct,
            Elevation::Auto => Elevation::Sudo,
            other => other,
        }
    }

    fn wrap(self, program: &str) -> Command {
        match self {
            Elevation::Sudo => {
                let mut cmd = Command::new("sudo");
                cmd.arg("-n").arg(program);
                cmd
            }
            Elevation::Pkexec => {
                let mut cmd = Command::new("pkexec");
                cmd.arg(program);
                cmd
            }
            Elevation::Auto | Elevation::Direct => Command::new(program),
        }
    }
}

/// Bounded waits for each kind of privileged call.
#[derive(Debug, Clone, Copy)]
pub struct ExecTimeouts {
    pub sysfs_write: Duration,
    pub module_load: Duration,
    pub signal: Duration,
}

impl Default for ExecTimeouts {
    fn default() -> Self {
        Self {
            sysfs_write: Duration::from_secs(10),
            module_load: Duration::from_secs(30),
            signal: Duration::from_secs(5),
        }
    }
}

/// Executes operations against the real host.
pub struct HostExecutor {
    layout: SysfsLayout,
    elevation: Elevation,
    timeouts: ExecTimeouts,
}

impl HostExecutor {
    pub fn new(layout: SysfsLayout, elevation: Elevation, timeouts: ExecTimeouts) -> Self {
        let elevation = elevation.effective();
        log_debug!("Privileged operations use {:?} elevation", elevation);
        Self {
            layout,
            elevation,
            timeouts,
        }
    }

    fn write_sysfs(&self, op: &PrivilegedOp, path: PathBuf, value: String) -> Result<()> {
        let result = match self.elevation {
            Elevation::Direct | Elevation::Auto => {
                write_with_deadline(path.clone(), value.clone(), self.timeouts.sysfs_write)
            }
            elevation => {
                let mut cmd = elevation.wrap("tee");
                cmd.arg(&path);
                run_with_deadline(cmd, Some(value.clone()), self.timeouts.sysfs_write)
                    .map(|_| ())
            }
        };

        match result {
            Err(HelperFailure::Os(err)) if op.tolerates(err.raw_os_error().map(Errno::from_i32)) => {
                log_debug!("{}: already in requested state", op);
                Ok(())
            }
            Err(HelperFailure::Exited { stderr, .. })
                if op.tolerates(errno_from_stderr(&stderr)) =>
            {
                log_debug!("{}: already in requested state", op);
                Ok(())
            }
            other => other.map_err(|failure| failure.into_error(op, &path.display().to_string())),
        }
    }

    fn load_module(&self, op: &PrivilegedOp, module: &DriverName) -> Result<()> {
        let mut cmd = self.elevation.wrap("modprobe");
        cmd.arg(module.module_name());
        run_with_deadline(cmd, None, self.timeouts.module_load)
            .map(|_| ())
            .map_err(|failure| failure.into_error(op, "modprobe"))
    }

    fn signal(&self, op: &PrivilegedOp, pid: u32, sig: TerminationSignal) -> Result<()> {
        if matches!(self.elevation, Elevation::Direct | Elevation::Auto) {
            return signal::kill(Pid::from_raw(pid as i32), sig.as_nix()).map_err(|errno| {
                if errno == Errno::EPERM {
                    PassthroughError::PrivilegeDenied(format!("{}: {}", op, errno))
                } else {
                    PassthroughError::CommandFailed(format!("{}: {}", op, errno))
                }
            });
        }

        let mut cmd = self.elevation.wrap("kill");
        cmd.arg(sig.kill_flag()).arg(pid.to_string());
        run_with_deadline(cmd, None, self.timeouts.signal)
            .map(|_| ())
            .map_err(|failure| failure.into_error(op, "kill"))
    }
}

impl PrivilegedExec for HostExecutor {
    fn execute(&self, op: &PrivilegedOp) -> Result<()> {
        log_debug!("Privileged: {}", op);
        match op {
            PrivilegedOp::LoadModule { module } => self.load_module(op, module),
            PrivilegedOp::Signal { pid, signal } => self.signal(op, *pid, *signal),
            _ => match op.sysfs_write(&self.layout) {
                Some((path, value)) => self.write_sysfs(op, path, value),
                None => Err(PassthroughError::CommandFailed(format!(
                    "{} has no sysfs target",
                    op
                ))),
            },
        }
    }
}

#[derive(Debug)]
enum HelperFailure {
    Os(io::Error),
    Exited { code: Option<i32>, stderr: String },
    TimedOut(Duration),
}

impl HelperFailure {
    fn into_error(self, op: &PrivilegedOp, target: &str) -> PassthroughError {
        match self {
            HelperFailure::Os(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                PassthroughError::PrivilegeDenied(format!("{} ({}): {}", op, target, err))
            }
            HelperFailure::Os(err) => {
                PassthroughError::CommandFailed(format!("{} ({}): {}", op, target, err))
            }
            HelperFailure::Exited { code, stderr } => {
                let stderr = stderr.trim();
                if looks_like_denial(code, stderr) {
                    PassthroughError::PrivilegeDenied(format!("{}: {}", op, stderr))
                } else {
                    PassthroughError::CommandFailed(format!(
                        "{} ({}) exited with {:?}: {}",
                        op, target, code, stderr
                    ))
                }
            }
            HelperFailure::TimedOut(after) => PassthroughError::Timeout {
                operation: op.to_string(),
                after,
            },
        }
    }
}

fn looks_like_denial(code: Option<i32>, stderr: &str) -> bool {
    // pkexec: 126 dismissed, 127 not authorized
    matches!(code, Some(126) | Some(127))
        || stderr.contains("password is required")
        || stderr.contains("not in the sudoers")
        || stderr.contains("Permission denied")
}

fn errno_from_stderr(stderr: &str) -> Option<Errno> {
    if stderr.contains("File exists") {
        Some(Errno::EEXIST)
    } else if stderr.contains("No such device") {
        Some(Errno::ENODEV)
    } else {
        None
    }
}

/// Write one sysfs file on a helper thread so a hung driver cannot stall us forever.
fn write_with_deadline(path: PathBuf, value: String, limit: Duration) -> std::result::Result<(), HelperFailure> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("sysfs-write".to_string())
        .spawn(move || {
            let _ = tx.send(fs::write(&path, value.as_bytes()));
        })
        .map_err(HelperFailure::Os)?;

    match rx.recv_timeout(limit) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(HelperFailure::Os(err)),
        Err(RecvTimeoutError::Timeout) => {
            log_warn!("sysfs write still blocked after {:?}; abandoning it", limit);
            Err(HelperFailure::TimedOut(limit))
        }
        Err(RecvTimeoutError::Disconnected) => Err(HelperFailure::Os(io::Error::other(
            "sysfs writer thread exited without a result",
        ))),
    }
}

/// Run an allow-listed helper and wait for it with a hard ceiling.
fn run_with_deadline(
    mut cmd: Command,
    stdin: Option<String>,
    limit: Duration,
) -> std::result::Result<String, HelperFailure> {
    cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(HelperFailure::Os)?;
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes()).map_err(HelperFailure::Os)?;
    }

    let started = Instant::now();
    let status = loop {
        match child.try_wait().map_err(HelperFailure::Os)? {
            Some(status) => break status,
            None if started.elapsed() >= limit => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(HelperFailure::TimedOut(limit));
            }
            None => thread::sleep(POLL_INTERVAL),
        }
    };

    let mut stderr = String::new();
    if let Some(mut pipe) = child.stderr.take() {
        use std::io::Read;
        let _ = pipe.read_to_string(&mut stderr);
    }

    if status.success() {
        Ok(stderr)
    } else {
        Err(HelperFailure::Exited {
            code: status.code(),
            stderr,
        })
    }
}
