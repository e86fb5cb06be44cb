//! Hardware execution backends
//!
//! The dispatcher only ever talks to [`HardwareBackend`]. Two implementations
//! exist and one is chosen at startup:
//! - [`RealBackend`] drives the BMC, the host disk and the storage emulator
//!   through their vendor tools
//! - [`MockBackend`] answers every operation with the same success payload the
//!   real backend produces, without any I/O

mod mock;
pub mod real;

pub use mock::MockBackend;
pub use real::RealBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::AgentConfig;

/// String-keyed JSON object used for command arguments and result payloads
pub type Payload = Map<String, Value>;

pub type BackendResult = Result<Payload, BackendError>;

/// Which backend the agent runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Real,
    #[default]
    Mock,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Real => write!(f, "real"),
            BackendKind::Mock => write!(f, "mock"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "real" => Ok(BackendKind::Real),
            "mock" => Ok(BackendKind::Mock),
            other => Err(format!("unknown backend `{other}` (expected `real` or `mock`)")),
        }
    }
}

/// Error vocabulary every backend normalizes device faults into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendErrorKind {
    DeviceUnreachable,
    Busy,
    UnsupportedOperation,
    HardwareFault,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::DeviceUnreachable, message)
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Busy, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::UnsupportedOperation, message)
    }

    pub fn fault(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::HardwareFault, message)
    }
}

/// Chassis power actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    On,
    Off,
    /// ACPI soft shutdown
    SoftOff,
    Cycle,
}

impl PowerAction {
    /// Power state the chassis ends up in once the action completes
    pub fn resulting_state(self) -> PowerState {
        match self {
            PowerAction::On | PowerAction::Cycle => PowerState::On,
            PowerAction::Off | PowerAction::SoftOff => PowerState::Off,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
}

impl PowerState {
    pub fn as_str(self) -> &'static str {
        match self {
            PowerState::On => "on",
            PowerState::Off => "off",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootDevice {
    Pxe,
    Disk,
    Cdrom,
    Bios,
}

impl BootDevice {
    pub const NAMES: &'static [&'static str] = &["pxe", "disk", "cdrom", "bios"];

    pub fn as_str(self) -> &'static str {
        match self {
            BootDevice::Pxe => "pxe",
            BootDevice::Disk => "disk",
            BootDevice::Cdrom => "cdrom",
            BootDevice::Bios => "bios",
        }
    }
}

impl FromStr for BootDevice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pxe" => Ok(BootDevice::Pxe),
            "disk" => Ok(BootDevice::Disk),
            "cdrom" => Ok(BootDevice::Cdrom),
            "bios" => Ok(BootDevice::Bios),
            other => Err(format!("unknown boot device `{other}`")),
        }
    }
}

/// Image to deploy onto the host disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskImage {
    /// Image path as staged on the card
    pub image: String,
    /// Expected SHA-256 (hex) of the image file
    pub sha256: Option<String>,
}

/// Remote iSCSI volume exposed to the host as a virtio block device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageTarget {
    pub iqn: String,
    pub ip: IpAddr,
}

// ─────────────────────────────────────────────────────────────────────────────
// Cooperative cancellation
// ─────────────────────────────────────────────────────────────────────────────

/// Sender half of a cancellation signal, kept by the dispatcher
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Receiver half handed to backend operations.
///
/// Cancellation is advisory: an operation may observe it and stop early, but
/// nothing forces it to.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation has been requested
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Handle dropped without cancelling
                std::future::pending::<()>().await;
            }
        }
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

// ─────────────────────────────────────────────────────────────────────────────
// Capabilities
// ─────────────────────────────────────────────────────────────────────────────

/// Chassis power and boot order through the baseboard management controller
#[async_trait]
pub trait PowerControl: Send + Sync {
    async fn set_power(&self, action: PowerAction, cancel: &CancelSignal) -> BackendResult;

    async fn power_status(&self, cancel: &CancelSignal) -> BackendResult;

    async fn set_boot_device(
        &self,
        device: BootDevice,
        persistent: bool,
        cancel: &CancelSignal,
    ) -> BackendResult;
}

/// Image deployment onto the host disk
#[async_trait]
pub trait DiskProvision: Send + Sync {
    async fn provision_disk(&self, image: &DiskImage, cancel: &CancelSignal) -> BackendResult;
}

/// Remote volume attach/detach
#[async_trait]
pub trait StorageAttach: Send + Sync {
    async fn attach_storage(&self, target: &StorageTarget, cancel: &CancelSignal) -> BackendResult;

    async fn detach_storage(&self, target: &StorageTarget, cancel: &CancelSignal) -> BackendResult;

    /// Devices currently exposed to the host
    async fn list_devices(&self) -> BackendResult;
}

/// Full capability set the dispatcher executes against
pub trait HardwareBackend: PowerControl + DiskProvision + StorageAttach {
    fn kind(&self) -> BackendKind;
}

/// Build the backend named in the configuration. Called once at startup.
pub fn select_backend(config: &AgentConfig) -> anyhow::Result<Arc<dyn HardwareBackend>> {
    let backend: Arc<dyn HardwareBackend> = match config.backend {
        BackendKind::Real => Arc::new(RealBackend::from_config(config)?),
        BackendKind::Mock => Arc::new(MockBackend::new(config.disk.device.clone())),
    };
    Ok(backend)
}

// ─────────────────────────────────────────────────────────────────────────────
// Success payloads
//
// Both backends build their results here so the mock cannot drift from the
// real success path.
// ─────────────────────────────────────────────────────────────────────────────

fn object(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

pub(crate) fn power_payload(state: PowerState) -> Payload {
    object(json!({ "state": state.as_str() }))
}

pub(crate) fn boot_payload(device: BootDevice, persistent: bool) -> Payload {
    object(json!({ "boot_device": device.as_str(), "persistent": persistent }))
}

pub(crate) fn provision_payload(image: &DiskImage, device: &str) -> Payload {
    object(json!({
        "image": image.image,
        "device": device,
        "verified": image.sha256.is_some(),
    }))
}

pub(crate) fn attach_payload(names: &real::CloudDiskNames) -> Payload {
    object(json!({
        "result": "Cloud disk connected successfully.",
        "iscsi_bdev": names.iscsi,
        "blk_device": names.blk,
    }))
}

pub(crate) fn detach_payload() -> Payload {
    object(json!({ "result": "Cloud disk disconnected successfully." }))
}

pub(crate) fn devices_payload(devices: Vec<String>) -> Payload {
    object(json!({ "devices": devices }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn backend_kind_parses_case_insensitively() {
        assert_eq!("REAL".parse::<BackendKind>(), Ok(BackendKind::Real));
        assert_eq!("mock".parse::<BackendKind>(), Ok(BackendKind::Mock));
        assert!("simulated".parse::<BackendKind>().is_err());
    }

    #[test]
    fn power_actions_map_to_final_state() {
        assert_eq!(PowerAction::Cycle.resulting_state(), PowerState::On);
        assert_eq!(PowerAction::SoftOff.resulting_state(), PowerState::Off);
        assert_eq!(power_payload(PowerAction::On.resulting_state())["state"], "on");
    }

    #[tokio::test]
    async fn cancel_signal_fires_once_requested() {
        let (handle, signal) = cancel_pair();
        assert!(!signal.is_cancelled());

        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.cancelled().await }
        });
        handle.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancellation not observed")
            .unwrap();
        assert!(signal.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn never_signal_stays_pending() {
        let signal = CancelSignal::never();
        let result = tokio::time::timeout(Duration::from_secs(5), signal.cancelled()).await;
        assert!(result.is_err());
        assert!(!signal.is_cancelled());
    }
}
