// Lifecycle Hooks: the seam between the VM subsystem and passthrough sessions.

use crate::pci::PciAddress;
use crate::session::{ActivateOptions, PassthroughSession, Phase, SessionManager};
use crate::{PassthroughError, Result, log_debug, log_info, log_warn};
use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::{sleep, timeout};

static HOSTDEV_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<hostdev\b([^>]*)>(.*?)</hostdev>"#).expect("hostdev regex is valid")
});
static SOURCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<source\b[^>]*>(.*?)</source>"#).expect("source regex is valid")
});
static ADDRESS_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<address\b([^>]*)/?>"#).expect("address regex is valid"));
static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(\w+)\s*=\s*['"]([^'"]*)['"]"#).expect("attribute regex is valid")
});

/// A hypervisor-side VM.
#[async_trait]
pub trait DomainHandle: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> Result<()>;

    /// Graceful shutdown, or immediate power-off when `force` is set.
    async fn stop(&self, force: bool) -> Result<()>;

    async fn xml(&self) -> Result<String>;

    async fn is_active(&self) -> Result<bool>;

    async fn wait_until_inactive(&self, poll: Duration) -> Result<()> {
        while self.is_active().await? {
            sleep(poll).await;
        }
        Ok(())
    }
}

/// A libvirt domain driven through `virsh`.
pub struct VirshDomain {
    name: String,
    connect: String,
    command_timeout: Duration,
}

impl VirshDomain {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            connect: "qemu:///system".to_string(),
            command_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_connect(mut self, uri: &str) -> Self {
        self.connect = uri.to_string();
        self
    }

    async fn virsh(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("virsh");
        cmd.arg("-c").arg(&self.connect).args(args).kill_on_drop(true);
        log_debug!("virsh {}", args.join(" "));

        let output = timeout(self.command_timeout, cmd.output())
            .await
            .map_err(|_| PassthroughError::Timeout {
                operation: format!("virsh {}", args.join(" ")),
                after: self.command_timeout,
            })?
            .map_err(|e| PassthroughError::Domain(format!("failed to run virsh: {}", e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(PassthroughError::Domain(format!(
                "virsh {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[async_trait]
impl DomainHandle for VirshDomain {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<()> {
        self.virsh(&["start", &self.name]).await.map(|_| ())
    }

    async fn stop(&self, force: bool) -> Result<()> {
        let verb = if force { "destroy" } else { "shutdown" };
        self.virsh(&[verb, &self.name]).await.map(|_| ())
    }

    async fn xml(&self) -> Result<String> {
        self.virsh(&["dumpxml", &self.name]).await
    }

    async fn is_active(&self) -> Result<bool> {
        let state = self.virsh(&["domstate", &self.name]).await?;
        Ok(matches!(
            state.trim(),
            "running" | "paused" | "in shutdown" | "blocked" | "pmsuspended"
        ))
    }
}

/// PCI host addresses passed through by a domain definition.
pub fn hostdev_addresses(xml: &str) -> Vec<PciAddress> {
    let mut addresses = Vec::new();
    for hostdev in HOSTDEV_RE.captures_iter(xml) {
        let is_pci = ATTR_RE
            .captures_iter(&hostdev[1])
            .any(|a| &a[1] == "type" && &a[2] == "pci");
        if !is_pci {
            continue;
        }
        let Some(source) = SOURCE_RE.captures(&hostdev[2]) else {
            continue;
        };
        for tag in ADDRESS_TAG_RE.captures_iter(&source[1]) {
            let mut parts = [None; 4];
            for attr in ATTR_RE.captures_iter(&tag[1]) {
                let slot = match &attr[1] {
                    "domain" => 0,
                    "bus" => 1,
                    "slot" => 2,
                    "function" => 3,
                    _ => continue,
                };
                parts[slot] = u32::from_str_radix(attr[2].trim_start_matches("0x"), 16).ok();
            }
            let [Some(domain), Some(bus), Some(slot), Some(function)] = parts else {
                continue;
            };
            let narrowed = (
                u16::try_from(domain),
                u8::try_from(bus),
                u8::try_from(slot),
                u8::try_from(function),
            );
            let (Ok(domain), Ok(bus), Ok(slot), Ok(function)) = narrowed else {
                log_warn!("Ignoring out-of-range hostdev address: {}", &tag[0]);
                continue;
            };
            match PciAddress::new(domain, bus, slot, function) {
                Ok(address) => addresses.push(address),
                Err(err) => log_warn!("Ignoring hostdev address: {}", err),
            }
        }
    }

    addresses.sort();
    addresses.dedup();
    addresses
}

/// Calls the VM subsystem makes around a domain's life.
pub struct LifecycleHooks {
    sessions: Arc<SessionManager>,
    shutdown_timeout: Duration,
    shutdown_poll: Duration,
}

impl LifecycleHooks {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            shutdown_timeout: Duration::from_secs(120),
            shutdown_poll: Duration::from_millis(500),
        }
    }

    /// Time a guest gets to finish a graceful shutdown before it is destroyed.
    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self.shutdown_poll =
            (shutdown_timeout / 4).clamp(Duration::from_millis(10), Duration::from_millis(500));
        self
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Must succeed before the hypervisor is told to start the VM.
    pub async fn on_before_start(
        &self,
        vm_name: &str,
        gpu: PciAddress,
        options: ActivateOptions,
    ) -> Result<PassthroughSession> {
        if let Some(existing) = self.sessions.session(vm_name) {
            if existing.phase == Phase::Active && existing.gpu == gpu {
                log_debug!("VM '{}' already holds its GPU", vm_name);
                return Ok(existing);
            }
        }
        self.sessions.activate(vm_name, gpu, options).await
    }

    /// Pick the GPU from the domain's hostdevs. `Ok(None)` when it passes nothing through.
    pub async fn on_before_start_domain(
        &self,
        domain: &dyn DomainHandle,
        options: ActivateOptions,
    ) -> Result<Option<PassthroughSession>> {
        let xml = domain.xml().await?;
        let addresses = hostdev_addresses(&xml);
        let Some(gpu) = addresses.first().copied() else {
            log_debug!("Domain '{}' has no PCI hostdevs", domain.name());
            return Ok(None);
        };
        if addresses.iter().any(|a| !a.same_card(&gpu)) {
            log_warn!(
                "Domain '{}' passes through several cards; only {} is managed",
                domain.name(),
                gpu
            );
        }
        self.on_before_start(domain.name(), gpu, options).await.map(Some)
    }

    /// Best effort; failures are surfaced once and never retried.
    pub async fn on_after_stop(&self, vm_name: &str) -> Result<()> {
        let Some(session) = self.sessions.session(vm_name) else {
            log_debug!("VM '{}' stopped without a passthrough session", vm_name);
            return Ok(());
        };

        match &session.phase {
            Phase::Active => self.sessions.deactivate(vm_name).await,
            Phase::Failed(reason) => {
                log_warn!(
                    "VM '{}' stopped but its group is parked in Failed ({}); acknowledge after fixing it",
                    vm_name,
                    reason
                );
                Err(PassthroughError::InvalidTransition {
                    vm: vm_name.to_string(),
                    phase: session.phase.to_string(),
                    operation: "restore",
                })
            }
            _ => self.sessions.cancel(vm_name).await,
        }
    }

    /// Prepare the GPU, then start the domain. A domain that refuses to start
    /// gets its GPU handed back to the host.
    pub async fn start_domain(
        &self,
        domain: &dyn DomainHandle,
        gpu: Option<PciAddress>,
        options: ActivateOptions,
    ) -> Result<()> {
        let prepared = match gpu {
            Some(gpu) => Some(self.on_before_start(domain.name(), gpu, options).await?),
            None => self.on_before_start_domain(domain, options).await?,
        };

        if let Err(err) = domain.start().await {
            if prepared.is_some() {
                log_warn!("Domain '{}' failed to start, returning its GPU", domain.name());
                if let Err(restore_err) = self.sessions.cancel(domain.name()).await {
                    log_warn!("GPU of '{}' may remain unavailable to the host: {}", domain.name(), restore_err);
                }
            }
            return Err(err);
        }

        log_info!("Domain '{}' started", domain.name());
        Ok(())
    }

    /// Stop the domain, then give its GPU back. A guest that ignores the
    /// graceful shutdown is destroyed once the shutdown timeout passes.
    pub async fn stop_domain(&self, domain: &dyn DomainHandle, force: bool) -> Result<()> {
        domain.stop(force).await?;
        if !force {
            let waited = timeout(
                self.shutdown_timeout,
                domain.wait_until_inactive(self.shutdown_poll),
            )
            .await;
            match waited {
                Ok(result) => result?,
                Err(_) => {
                    log_warn!(
                        "Domain '{}' still running after {:?}, destroying it",
                        domain.name(),
                        self.shutdown_timeout
                    );
                    domain.stop(true).await?;
                }
            }
        }

        if let Err(err) = self.on_after_stop(domain.name()).await {
            log_warn!(
                "Domain '{}' stopped, but its GPU may remain unavailable to the host: {}",
                domain.name(),
                err
            );
            return Err(err);
        }
        Ok(())
    }
}
