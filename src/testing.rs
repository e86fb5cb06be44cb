//! Test doubles shared by the unit tests

use async_trait::async_trait;
use nic_agent_shared::CommandResult;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::command::handlers::HandlerContext;
use crate::command::ResultSink;
use crate::hardware::{
    BackendError, BackendKind, BackendResult, BootDevice, CancelSignal, DiskImage, DiskProvision,
    HardwareBackend, MockBackend, PowerAction, PowerControl, StorageAttach, StorageTarget,
};

/// Backend that records each call, optionally sleeps, and then answers like
/// the mock backend (or with a fixed error)
pub struct SpyBackend {
    inner: MockBackend,
    calls: Mutex<Vec<String>>,
    delay: Duration,
    error: Option<BackendError>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl Default for SpyBackend {
    fn default() -> Self {
        Self {
            inner: MockBackend::new("/dev/sda"),
            calls: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            error: None,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }
}

impl SpyBackend {
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn failing(error: BackendError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Highest number of operations that were running at the same time
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    async fn record(&self, call: String) -> Result<(), BackendError> {
        self.calls.lock().unwrap().push(call);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        match &self.error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PowerControl for SpyBackend {
    async fn set_power(&self, action: PowerAction, cancel: &CancelSignal) -> BackendResult {
        self.record(format!("set_power({action:?})")).await?;
        self.inner.set_power(action, cancel).await
    }

    async fn power_status(&self, cancel: &CancelSignal) -> BackendResult {
        self.record("power_status".into()).await?;
        self.inner.power_status(cancel).await
    }

    async fn set_boot_device(
        &self,
        device: BootDevice,
        persistent: bool,
        cancel: &CancelSignal,
    ) -> BackendResult {
        self.record(format!("set_boot_device({device:?}, {persistent})"))
            .await?;
        self.inner.set_boot_device(device, persistent, cancel).await
    }
}

#[async_trait]
impl DiskProvision for SpyBackend {
    async fn provision_disk(&self, image: &DiskImage, cancel: &CancelSignal) -> BackendResult {
        self.record(format!("provision_disk({})", image.image)).await?;
        self.inner.provision_disk(image, cancel).await
    }
}

#[async_trait]
impl StorageAttach for SpyBackend {
    async fn attach_storage(&self, target: &StorageTarget, cancel: &CancelSignal) -> BackendResult {
        self.record(format!("attach_storage({}@{})", target.iqn, target.ip))
            .await?;
        self.inner.attach_storage(target, cancel).await
    }

    async fn detach_storage(&self, target: &StorageTarget, cancel: &CancelSignal) -> BackendResult {
        self.record(format!("detach_storage({}@{})", target.iqn, target.ip))
            .await?;
        self.inner.detach_storage(target, cancel).await
    }

    async fn list_devices(&self) -> BackendResult {
        self.record("list_devices".into()).await?;
        self.inner.list_devices().await
    }
}

impl HardwareBackend for SpyBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Mock
    }
}

/// Handler context with the given JSON object as arguments
pub fn context(backend: Arc<dyn HardwareBackend>, args: Value) -> HandlerContext {
    HandlerContext {
        correlation_id: "test-cmd".into(),
        args: args.as_object().cloned().unwrap_or_default(),
        backend,
        cancel: CancelSignal::never(),
    }
}

/// Sink that keeps every delivered result
#[derive(Default)]
pub struct RecordingSink {
    results: Mutex<Vec<CommandResult>>,
}

impl RecordingSink {
    pub fn results(&self) -> Vec<CommandResult> {
        self.results.lock().unwrap().clone()
    }

    pub fn for_id(&self, correlation_id: &str) -> Vec<CommandResult> {
        self.results()
            .into_iter()
            .filter(|r| r.correlation_id == correlation_id)
            .collect()
    }
}

#[async_trait]
impl ResultSink for RecordingSink {
    async fn deliver(&self, result: CommandResult) -> anyhow::Result<()> {
        self.results.lock().unwrap().push(result);
        Ok(())
    }
}

/// Sink whose first `failures` deliveries fail
pub struct FlakySink {
    failures: u32,
    attempts: AtomicU32,
    delivered: RecordingSink,
}

impl FlakySink {
    pub fn failing_first(failures: u32) -> Self {
        Self {
            failures,
            attempts: AtomicU32::new(0),
            delivered: RecordingSink::default(),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<CommandResult> {
        self.delivered.results()
    }
}

#[async_trait]
impl ResultSink for FlakySink {
    async fn deliver(&self, result: CommandResult) -> anyhow::Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            anyhow::bail!("management channel down (attempt {attempt})");
        }
        self.delivered.deliver(result).await
    }
}
