mod common;

use async_trait::async_trait;
use common::*;
use nova_passthrough::{ActivateOptions, DomainHandle, LifecycleHooks, PassthroughError, Phase, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A domain that records calls and checks the GPU is on vfio-pci when it starts.
struct FakeDomain {
    name: String,
    xml: String,
    kernel: Arc<FakeKernel>,
    fail_start: bool,
    ignores_shutdown: bool,
    destroyed: AtomicBool,
    running: AtomicBool,
    gpu_driver_at_start: Mutex<Option<String>>,
}

impl FakeDomain {
    fn new(kernel: &Arc<FakeKernel>, xml: &str) -> Self {
        Self {
            name: "win11".to_string(),
            xml: xml.to_string(),
            kernel: kernel.clone(),
            fail_start: false,
            ignores_shutdown: false,
            destroyed: AtomicBool::new(false),
            running: AtomicBool::new(false),
            gpu_driver_at_start: Mutex::new(None),
        }
    }

    fn failing(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// A guest that never reacts to ACPI shutdown.
    fn hung(mut self) -> Self {
        self.ignores_shutdown = true;
        self
    }
}

#[async_trait]
impl DomainHandle for FakeDomain {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<()> {
        *self.gpu_driver_at_start.lock().unwrap() = self.kernel.driver_of(GPU);
        if self.fail_start {
            return Err(PassthroughError::Domain("qemu exited during startup".to_string()));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self, force: bool) -> Result<()> {
        if force {
            self.destroyed.store(true, Ordering::SeqCst);
        } else if self.ignores_shutdown {
            return Ok(());
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn xml(&self) -> Result<String> {
        Ok(self.xml.clone())
    }

    async fn is_active(&self) -> Result<bool> {
        Ok(self.running.load(Ordering::SeqCst))
    }
}

const GPU_HOSTDEV_XML: &str = r#"
<domain type='kvm'>
  <name>win11</name>
  <devices>
    <hostdev mode='subsystem' type='pci' managed='no'>
      <source>
        <address domain='0x0000' bus='0x01' slot='0x00' function='0x0'/>
      </source>
    </hostdev>
    <hostdev mode='subsystem' type='pci' managed='no'>
      <source>
        <address domain='0x0000' bus='0x01' slot='0x00' function='0x1'/>
      </source>
    </hostdev>
  </devices>
</domain>"#;

const PLAIN_XML: &str = "<domain type='kvm'><name>win11</name><devices/></domain>";

fn hooks(kernel: &Arc<FakeKernel>) -> LifecycleHooks {
    LifecycleHooks::new(Arc::new(session_manager(kernel, &FakeProcesses::new())))
}

#[tokio::test]
async fn test_gpu_is_on_vfio_before_domain_starts() {
    let kernel = FakeKernel::gpu_with_audio();
    let hooks = hooks(&kernel);
    let domain = FakeDomain::new(&kernel, PLAIN_XML);

    hooks
        .start_domain(&domain, Some(addr(GPU)), ActivateOptions::default())
        .await
        .unwrap();

    assert_eq!(domain.gpu_driver_at_start.lock().unwrap().as_deref(), Some("vfio-pci"));
    assert_eq!(hooks.sessions().session("win11").unwrap().phase, Phase::Active);
}

#[tokio::test]
async fn test_gpu_taken_from_domain_hostdevs() {
    let kernel = FakeKernel::gpu_with_audio();
    let hooks = hooks(&kernel);
    let domain = FakeDomain::new(&kernel, GPU_HOSTDEV_XML);

    let session = hooks
        .on_before_start_domain(&domain, ActivateOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.gpu, addr(GPU));
    assert_eq!(session.group_id(), Some(5));

    // Calling the hook again for the same VM and GPU is harmless.
    let again = hooks
        .on_before_start(&domain.name, addr(GPU), ActivateOptions::default())
        .await
        .unwrap();
    assert_eq!(again.id, session.id);
}

#[tokio::test]
async fn test_domain_without_hostdevs_is_left_alone() {
    let kernel = FakeKernel::gpu_with_audio();
    let hooks = hooks(&kernel);
    let domain = FakeDomain::new(&kernel, PLAIN_XML);

    hooks
        .start_domain(&domain, None, ActivateOptions::default())
        .await
        .unwrap();
    assert!(hooks.sessions().sessions().is_empty());
    assert_eq!(kernel.writes(), 0);
}

#[tokio::test]
async fn test_failed_start_returns_gpu_to_host() {
    let kernel = FakeKernel::gpu_with_audio();
    let hooks = hooks(&kernel);
    let domain = FakeDomain::new(&kernel, GPU_HOSTDEV_XML).failing();

    let err = hooks
        .start_domain(&domain, None, ActivateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PassthroughError::Domain(_)));

    assert!(hooks.sessions().session("win11").is_none());
    assert_eq!(kernel.driver_of(GPU).as_deref(), Some("nvidia"));
    assert_eq!(kernel.driver_of(AUDIO).as_deref(), Some("snd_hda_intel"));
}

#[tokio::test]
async fn test_stop_domain_restores_host_drivers() {
    let kernel = FakeKernel::gpu_with_audio();
    let hooks = hooks(&kernel);
    let domain = FakeDomain::new(&kernel, GPU_HOSTDEV_XML);

    hooks
        .start_domain(&domain, None, ActivateOptions::default())
        .await
        .unwrap();
    hooks.stop_domain(&domain, false).await.unwrap();

    assert!(!domain.is_active().await.unwrap());
    assert!(hooks.sessions().session("win11").is_none());
    assert_eq!(kernel.driver_of(GPU).as_deref(), Some("nvidia"));
    assert_eq!(kernel.driver_of(AUDIO).as_deref(), Some("snd_hda_intel"));
}

#[tokio::test]
async fn test_after_stop_without_session() {
    let kernel = FakeKernel::gpu_with_audio();
    let hooks = hooks(&kernel);

    hooks.on_after_stop("never-started").await.unwrap();
    assert_eq!(kernel.writes(), 0);
}

#[tokio::test]
async fn test_after_stop_does_not_retry_failed_group() {
    let kernel = FakeKernel::gpu_with_audio();
    kernel.fail_when(|op| {
        matches!(op, nova_passthrough::PrivilegedOp::NewId { id } if id.device == 0x22ba)
    });
    kernel.fail_when(|op| {
        matches!(op, nova_passthrough::PrivilegedOp::Bind { driver, .. } if driver.as_str() == "snd_hda_intel")
    });
    let hooks = hooks(&kernel);

    hooks
        .on_before_start("win11", addr(GPU), ActivateOptions::default())
        .await
        .unwrap_err();
    let writes = kernel.writes();

    let err = hooks.on_after_stop("win11").await.unwrap_err();
    assert!(matches!(err, PassthroughError::InvalidTransition { .. }));
    assert_eq!(kernel.writes(), writes);
    assert!(hooks.sessions().session("win11").unwrap().phase.is_failed());
}

#[tokio::test]
async fn test_hung_guest_is_destroyed_and_gpu_restored() {
    let kernel = FakeKernel::gpu_with_audio();
    let hooks = hooks(&kernel).with_shutdown_timeout(Duration::from_millis(100));
    let domain = FakeDomain::new(&kernel, GPU_HOSTDEV_XML).hung();

    hooks
        .start_domain(&domain, None, ActivateOptions::default())
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), hooks.stop_domain(&domain, false))
        .await
        .expect("stop_domain must not wait forever on a hung guest")
        .unwrap();

    assert!(domain.destroyed.load(Ordering::SeqCst));
    assert!(!domain.is_active().await.unwrap());
    assert!(hooks.sessions().session("win11").is_none());
    assert_eq!(kernel.driver_of(GPU).as_deref(), Some("nvidia"));
    assert_eq!(kernel.driver_of(AUDIO).as_deref(), Some("snd_hda_intel"));
}
